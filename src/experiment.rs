//! Experiment runner for head ablation experiments
//!
//! Coordinates prompt filtering, the two Monte Carlo phases, outlier
//! detection and the evaluation of the fixed masks.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::evaluation::{evaluate_outlier_masks, CompletionEvaluator, MaskEvaluation};
use crate::outliers::OutlierReport;
use crate::prompts::PromptSet;
use crate::sampling::{run_trials, PhaseOutcome, TrialConfig, TrialPhase};
use crate::scores::HeadScores;

/// Configuration for a head ablation experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// HuggingFace model ID
    pub model_id: String,
    /// Prompt JSON file (None = built-in prompts)
    pub prompts_path: Option<PathBuf>,
    /// Trials per phase
    pub n_trials: usize,
    /// Ablation rate of the importance phase
    pub high_ablation_rate: f64,
    /// Ablation rate of the exclusion phase
    pub low_ablation_rate: f64,
    /// Prompts scored per trial (None = all filtered prompts)
    pub prompts_per_trial: Option<usize>,
    /// Minimum per-trial accuracy counted as a success
    pub success_threshold: f64,
    /// Outlier percentile (0-100)
    pub percentile: f64,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Prefix prompts with the BOS token
    pub prepend_bos: bool,
    /// Run the attention-pattern induction scan
    pub induction_scan: bool,
    /// Tokens per copy in the induction scan
    pub induction_half_len: usize,
    /// Random sequences averaged in the induction scan
    pub induction_sequences: usize,
    /// Print layer x head heatmaps
    pub show_heatmaps: bool,
    /// Where to write the trial dump (None = no dump)
    pub dump_path: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model_id: "openai-community/gpt2".to_string(),
            prompts_path: None,
            n_trials: 300,
            high_ablation_rate: 0.6,
            low_ablation_rate: 0.1,
            prompts_per_trial: None,
            success_threshold: 0.5,
            percentile: 95.0,
            seed: 42,
            prepend_bos: true,
            induction_scan: false,
            induction_half_len: 50,
            induction_sequences: 4,
            show_heatmaps: true,
            dump_path: None,
        }
    }
}

impl ExperimentConfig {
    /// Load a config from JSON; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.importance_trials().validate()?;
        self.exclusion_trials().validate()?;
        if self.n_trials == 0 {
            anyhow::bail!("n_trials must be at least 1");
        }
        if !(0.0..=100.0).contains(&self.percentile) {
            anyhow::bail!("Percentile must be in [0, 100], got {}", self.percentile);
        }
        if self.high_ablation_rate < self.low_ablation_rate {
            anyhow::bail!(
                "High ablation rate {} is below low ablation rate {}",
                self.high_ablation_rate,
                self.low_ablation_rate
            );
        }
        Ok(())
    }

    pub fn importance_trials(&self) -> TrialConfig {
        TrialConfig {
            n_trials: self.n_trials,
            ablation_rate: self.high_ablation_rate,
            prompts_per_trial: self.prompts_per_trial,
            success_threshold: self.success_threshold,
        }
    }

    pub fn exclusion_trials(&self) -> TrialConfig {
        TrialConfig {
            ablation_rate: self.low_ablation_rate,
            ..self.importance_trials()
        }
    }

    /// Prompts from `prompts_path`, or the built-in set
    pub fn load_prompts(&self) -> Result<PromptSet> {
        match &self.prompts_path {
            Some(path) => PromptSet::load(path),
            None => Ok(PromptSet::builtin()),
        }
    }
}

/// Results from a full head ablation experiment
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub model_id: String,
    pub n_layers: usize,
    pub n_heads: usize,
    /// Prompts kept after filtering
    pub n_prompts: usize,
    /// Prompts the unablated model got wrong
    pub n_rejected: usize,
    pub importance: PhaseOutcome,
    pub exclusion: PhaseOutcome,
    pub importance_scores: HeadScores,
    pub exclusion_penalties: HeadScores,
    pub outliers: OutlierReport,
    /// outliers only, outliers ablated, full model
    pub mask_evaluations: Vec<MaskEvaluation>,
    /// Filled in when the induction scan is enabled
    pub induction_scores: Option<HeadScores>,
}

/// Main experiment runner
pub struct Experiment<E: CompletionEvaluator> {
    config: ExperimentConfig,
    evaluator: E,
}

impl<E: CompletionEvaluator> Experiment<E> {
    /// Create a new experiment
    pub fn new(evaluator: E, config: ExperimentConfig) -> Self {
        Self { config, evaluator }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    /// Run the full pipeline over `prompts`
    pub fn run(&self, prompts: &PromptSet) -> Result<ExperimentResults> {
        info!("Starting head ablation experiment");
        info!("Config: {:?}", self.config);
        self.config.validate()?;

        let (n_layers, n_heads) = self.evaluator.head_dims();
        info!(
            "Model: {} layers x {} heads = {} heads",
            n_layers,
            n_heads,
            n_layers * n_heads
        );

        let (filtered, n_rejected) = prompts.filter_correct(&self.evaluator)?;
        if filtered.is_empty() {
            anyhow::bail!(
                "The unablated model answered none of the {} prompts correctly",
                prompts.len()
            );
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let importance = run_trials(
            &self.evaluator,
            &filtered,
            &self.config.importance_trials(),
            TrialPhase::Importance,
            &mut rng,
        )?;
        info!(
            "Importance phase success rate: {:.1}%",
            importance.success_rate() * 100.0
        );

        let exclusion = run_trials(
            &self.evaluator,
            &filtered,
            &self.config.exclusion_trials(),
            TrialPhase::Exclusion,
            &mut rng,
        )?;
        info!(
            "Exclusion phase success rate: {:.1}%",
            exclusion.success_rate() * 100.0
        );

        let importance_scores = importance.scores();
        let exclusion_penalties = exclusion.scores();

        let outliers = OutlierReport::from_scores(
            &importance_scores,
            &exclusion_penalties,
            self.config.percentile,
        )?;
        info!("Detected {} outlier heads", outliers.combined.len());

        let mask_evaluations = evaluate_outlier_masks(&self.evaluator, &filtered, &outliers.combined)?;

        Ok(ExperimentResults {
            model_id: self.config.model_id.clone(),
            n_layers,
            n_heads,
            n_prompts: filtered.len(),
            n_rejected,
            importance,
            exclusion,
            importance_scores,
            exclusion_penalties,
            outliers,
            mask_evaluations,
            induction_scores: None,
        })
    }
}
