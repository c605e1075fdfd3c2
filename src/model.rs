//! HapiModel wrapper for head ablation experiments
//!
//! Supports multiple model backends (GPT-2, LLaMA) with a unified interface.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use hf_hub::api::sync::ApiRepo;
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::PathBuf;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::ablation::HeadMask;
use crate::attention::AttentionCache;
use crate::evaluation::CompletionEvaluator;
use crate::forward_gpt2::HapiGpt2;
use crate::forward_llama::HapiLlama;
use crate::prompts::PromptPair;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// GPT-2 family (OpenAI, distilgpt2, ...)
    Gpt2,
    /// LLaMA family (SmolLM, TinyLlama, ...)
    Llama,
}

impl ModelArchitecture {
    /// Detect architecture from model ID
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("gpt2") || model_lower.contains("gpt-2") {
            ModelArchitecture::Gpt2
        } else if model_lower.contains("llama") || model_lower.contains("smollm") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to GPT-2",
                model_id
            );
            ModelArchitecture::Gpt2
        }
    }
}

/// Unified backend trait for all model architectures.
///
/// Implementing this trait is the only requirement for running ablation
/// trials on a new architecture.
pub trait HapiBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    // --- Forward passes ---

    /// Logits `[batch, seq, vocab]` with the ablated heads of `mask` zeroed
    fn forward_with_head_mask(&self, input_ids: &Tensor, mask: Option<&HeadMask>) -> Result<Tensor>;

    /// Logits plus the post-softmax attention pattern of every layer
    fn forward_with_attention(
        &self,
        input_ids: &Tensor,
        mask: Option<&HeadMask>,
    ) -> Result<(Tensor, AttentionCache)>;
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Download the safetensors weights of a hub repo (single file or sharded)
pub(crate) fn fetch_safetensors(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Downloading {} shard files...", shard_names.len());
        shard_names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {name}"))
            })
            .collect()
    } else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Ok(vec![path])
    }
}

/// Outcome of checking one prompt against its expected completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionCheck {
    /// Every expected token was the model's top prediction
    pub correct: bool,
    /// Greedy predictions at each expected-token position
    pub predicted: Vec<u32>,
    /// Tokenized expected completion
    pub expected: Vec<u32>,
}

/// Compare greedy predictions with the expected completion tokens
///
/// `predicted[i]` is the argmax at the position that should produce
/// `expected[i]` when the expected prefix is fed back in.
pub fn completion_matches(predicted: &[u32], expected: &[u32]) -> bool {
    !expected.is_empty() && predicted == expected
}

/// High-level model wrapper for ablation experiments
pub struct HapiModel {
    model: Box<dyn HapiBackend>,
    tokenizer: Tokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
    prepend_bos: bool,
}

impl HapiModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let architecture = ModelArchitecture::from_model_id(model_id);
        Self::from_pretrained_with_arch(model_id, force_cpu, architecture)
    }

    /// Load with explicit architecture specification
    pub fn from_pretrained_with_arch(
        model_id: &str,
        force_cpu: Option<bool>,
        architecture: ModelArchitecture,
    ) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        // GPT-2 checkpoints are fp32; LLaMA-family checkpoints are trained in bf16
        let dtype = match (architecture, device.is_cuda()) {
            (ModelArchitecture::Llama, true) => DType::BF16,
            _ => DType::F32,
        };

        info!("Loading model: {}", model_id);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let model: Box<dyn HapiBackend> = match architecture {
            ModelArchitecture::Gpt2 => Box::new(HapiGpt2::load(model_id, &device, dtype)?),
            ModelArchitecture::Llama => Box::new(HapiLlama::load(model_id, &device, dtype)?),
        };

        Ok(Self::from_parts(
            model,
            tokenizer,
            device,
            architecture,
            model_id,
        ))
    }

    /// Assemble a model from an already-built backend and tokenizer
    pub fn from_parts(
        model: Box<dyn HapiBackend>,
        tokenizer: Tokenizer,
        device: Device,
        architecture: ModelArchitecture,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            architecture,
            model_id: model_id.to_string(),
            prepend_bos: true,
        }
    }

    /// Whether prompts are prefixed with the BOS token (default: true)
    pub fn set_prepend_bos(&mut self, prepend_bos: bool) {
        self.prepend_bos = prepend_bos;
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    pub fn n_heads(&self) -> usize {
        self.model.n_heads()
    }

    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Total number of attention heads
    pub fn total_heads(&self) -> usize {
        self.n_layers() * self.n_heads()
    }

    /// BOS token for this tokenizer, if it has one
    pub fn bos_token_id(&self) -> Option<u32> {
        ["<|endoftext|>", "<s>", "<|begin_of_text|>"]
            .iter()
            .find_map(|token| self.tokenizer.token_to_id(token))
    }

    /// Tokenize text into ids (no special tokens added)
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Tokenize a prompt, prefixing BOS when enabled
    pub fn encode_prompt(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if self.prepend_bos {
            if let Some(bos) = self.bos_token_id() {
                ids.push(bos);
            }
        }
        ids.extend(self.encode(text)?);
        Ok(ids)
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    fn to_input(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Greedy next-token prediction for a prompt under a head mask
    pub fn predict_next(&self, prompt: &str, mask: Option<&HeadMask>) -> Result<u32> {
        let ids = self.encode_prompt(prompt)?;
        if ids.is_empty() {
            anyhow::bail!("Cannot predict from an empty prompt");
        }
        let logits = self.model.forward_with_head_mask(&self.to_input(&ids)?, mask)?;
        let next = logits
            .i((0, ids.len() - 1))?
            .argmax(D::Minus1)?
            .to_scalar::<u32>()?;
        Ok(next)
    }

    /// Check whether the model produces `pair.expected` after `pair.prompt`
    ///
    /// Single teacher-forced pass over `prompt + expected[..n-1]`: the
    /// completion is correct iff each expected token is the argmax at the
    /// position preceding it.
    pub fn check_completion(
        &self,
        pair: &PromptPair,
        mask: Option<&HeadMask>,
    ) -> Result<CompletionCheck> {
        let prompt_ids = self.encode_prompt(&pair.prompt)?;
        let expected = self.encode(&pair.expected)?;
        if prompt_ids.is_empty() {
            anyhow::bail!("Prompt '{}' tokenizes to nothing", pair.prompt);
        }
        if expected.is_empty() {
            anyhow::bail!(
                "Expected completion for '{}' tokenizes to nothing",
                pair.prompt
            );
        }

        let mut ids = prompt_ids.clone();
        ids.extend_from_slice(&expected[..expected.len() - 1]);

        let logits = self.model.forward_with_head_mask(&self.to_input(&ids)?, mask)?;
        let start = prompt_ids.len() - 1;
        let predicted: Vec<u32> = logits
            .i((0, start..start + expected.len()))?
            .argmax(D::Minus1)?
            .to_vec1()?;

        let correct = completion_matches(&predicted, &expected);
        debug!(
            "'{}' -> predicted {:?}, expected {:?} ({})",
            pair.expected,
            predicted,
            expected,
            if correct { "ok" } else { "miss" }
        );

        Ok(CompletionCheck {
            correct,
            predicted,
            expected,
        })
    }

    /// Attention patterns for a token sequence under a head mask
    pub fn attention_patterns(
        &self,
        ids: &[u32],
        mask: Option<&HeadMask>,
    ) -> Result<AttentionCache> {
        let (_, cache) = self.model.forward_with_attention(&self.to_input(ids)?, mask)?;
        Ok(cache)
    }
}

impl CompletionEvaluator for HapiModel {
    fn head_dims(&self) -> (usize, usize) {
        (self.n_layers(), self.n_heads())
    }

    fn is_correct(&self, pair: &PromptPair, mask: &HeadMask) -> Result<bool> {
        Ok(self.check_completion(pair, Some(mask))?.correct)
    }
}
