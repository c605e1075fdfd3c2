// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // q, k, v, b, h, s standard in attention code
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // HapiModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! HAPI-rs: Head Ablation Probing for Induction
//!
//! Estimates which attention heads of a small pretrained transformer are
//! causally necessary for induction-style completions, by running the model
//! many times with random subsets of heads zeroed out.
//!
//! ## Architecture
//!
//! - `ablation`: Head identifiers and retention masks
//! - `model`: High-level HapiModel wrapper and the HapiBackend trait
//! - `forward_gpt2`: GPT-2 forward pass with per-head ablation
//! - `forward_llama`: LLaMA forward pass with per-head ablation
//! - `masks`: Cached causal attention masks
//! - `attention`: Attention pattern capture
//! - `prompts`: Prompt/completion pairs and filtering
//! - `evaluation`: Completion scoring under a fixed mask
//! - `sampling`: Monte Carlo ablation trials and per-head tallies
//! - `scores`: Per-head score maps
//! - `outliers`: Percentile-based outlier head detection
//! - `induction`: Attention-pattern induction score scan
//! - `report`: Heatmaps, summary tables and the trial dump
//! - `experiment`: Experiment runner coordinating the full pipeline

pub mod ablation;
pub mod attention;
pub mod evaluation;
pub mod experiment;
pub mod forward_gpt2;
pub mod forward_llama;
pub mod induction;
pub mod masks;
pub mod model;
pub mod outliers;
pub mod prompts;
pub mod report;
pub mod sampling;
pub mod scores;

pub use ablation::{HeadId, HeadMask};
pub use attention::AttentionCache;
pub use evaluation::{evaluate_mask, evaluate_outlier_masks, CompletionEvaluator, MaskEvaluation};
pub use experiment::{Experiment, ExperimentConfig, ExperimentResults};
pub use forward_gpt2::{Gpt2Config, HapiGpt2};
pub use forward_llama::{HapiLlama, LlamaConfig};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{CompletionCheck, HapiBackend, HapiModel, ModelArchitecture};
pub use outliers::{detect_outliers, OutlierReport};
pub use prompts::{PromptPair, PromptSet};
pub use report::{print_summary, render_heatmap, write_dump, TrialDump};
pub use sampling::{run_trials, HeadTally, PhaseOutcome, TrialConfig, TrialPhase, TrialRecord};
pub use scores::HeadScores;
