//! GPT-2 forward pass with per-head ablation
//!
//! Custom implementation that runs layer-by-layer so individual attention
//! heads can be zeroed and attention patterns captured.
//!
//! Architecture notes:
//! - Learned absolute position embeddings (`wpe`)
//! - Pre-LayerNorm blocks with GELU (tanh approximation) MLP
//! - Fused `c_attn` projection producing Q, K, V
//! - HF checkpoints store projections as Conv1D: weight is `[in, out]`
//! - Unembedding is tied to `wte`

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::ablation::HeadMask;
use crate::attention::AttentionCache;
use crate::masks::create_causal_mask;
use crate::model::{fetch_safetensors, HapiBackend};

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// Load a Conv1D projection (`[in, out]` weight) as a candle `Linear`
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (in_dim, out_dim),
        "weight",
        candle_nn::init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", candle_nn::init::ZERO)?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Multi-head causal self-attention
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let c_attn = conv1d(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    /// Returns (output, attention_weights) where attention_weights is
    /// [batch, heads, seq, seq]. `head_mask` is `[1, heads, 1, 1]`.
    fn forward(&self, x: &Tensor, head_mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, hidden) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |idx: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, idx * hidden, hidden)?
                .reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        // z: [batch, heads, seq, head_dim]
        let z = attn_weights.matmul(&v)?;

        // ABLATION POINT: zero the per-head output before c_proj
        let z = match head_mask {
            Some(m) => z.broadcast_mul(m)?,
            None => z,
        };

        let z = z.transpose(1, 2)?.reshape((b, seq_len, hidden))?;
        Ok((self.c_proj.forward(&z)?, attn_weights))
    }
}

/// MLP block (GPT-2 style - GELU, biased Conv1D projections)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let inner = config.inner_dim();
        Ok(Self {
            c_fc: conv1d(config.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: conv1d(inner, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

/// Single transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor, head_mask: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let residual = x;
        let x = self.ln_1.forward(x)?;
        let (x, attn_weights) = self.attn.forward(&x, head_mask)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.ln_2.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok(((residual + x)?, attn_weights))
    }
}

/// GPT-2 model with per-head ablation and attention capture
pub struct HapiGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    n_layers: usize,
    n_heads: usize,
    hidden_size: usize,
    vocab_size: usize,
    max_positions: usize,
}

impl HapiGpt2 {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading GPT-2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} heads, {} hidden, {} vocab",
            config.n_layer, config.n_head, config.n_embd, config.vocab_size
        );

        let weights_paths = fetch_safetensors(&repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::new(&config, vb)
    }

    /// Build the model from a config and a weight source
    ///
    /// Accepts both the bare layout (`wte.weight`, `h.0...`) and the
    /// `transformer.`-prefixed layout used by some exports.
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        if config.n_embd % config.n_head != 0 {
            anyhow::bail!(
                "n_embd {} is not divisible by n_head {}",
                config.n_embd,
                config.n_head
            );
        }

        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), config)?);
        }

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        info!(
            "Model loaded successfully with {} layers x {} heads",
            config.n_layer, config.n_head
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            n_layers: config.n_layer,
            n_heads: config.n_head,
            hidden_size: config.n_embd,
            vocab_size: config.vocab_size,
            max_positions: config.n_positions,
        })
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_positions {
            anyhow::bail!(
                "Sequence length {seq_len} exceeds the model context of {} tokens",
                self.max_positions
            );
        }
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tokens = self.wte.forward(input_ids)?;
        let positions = self.wpe.forward(&positions)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    fn run(
        &self,
        input_ids: &Tensor,
        mask: Option<&HeadMask>,
        mut attn_cache: Option<&mut AttentionCache>,
    ) -> Result<Tensor> {
        if let Some(m) = mask {
            m.validate(self.n_layers, self.n_heads)?;
        }

        let mut hidden = self.embed(input_ids)?;
        for (i, block) in self.blocks.iter().enumerate() {
            let head_mask = match mask {
                Some(m) => m.layer_tensor(i, hidden.device(), hidden.dtype())?,
                None => None,
            };
            let (out, attn_weights) = block.forward(&hidden, head_mask.as_ref())?;
            if let Some(cache) = attn_cache.as_deref_mut() {
                cache.push(attn_weights);
            }
            hidden = out;
        }

        let hidden = self.ln_f.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    /// Forward pass with the masked heads zeroed; returns logits [batch, seq, vocab]
    pub fn forward_with_head_mask(
        &self,
        input_ids: &Tensor,
        mask: Option<&HeadMask>,
    ) -> Result<Tensor> {
        self.run(input_ids, mask, None)
    }

    /// Forward pass that also returns every layer's attention pattern
    pub fn forward_with_attention(
        &self,
        input_ids: &Tensor,
        mask: Option<&HeadMask>,
    ) -> Result<(Tensor, AttentionCache)> {
        let mut cache = AttentionCache::with_capacity(self.n_layers);
        let logits = self.run(input_ids, mask, Some(&mut cache))?;
        Ok((logits, cache))
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn d_model(&self) -> usize {
        self.hidden_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl HapiBackend for HapiGpt2 {
    fn n_layers(&self) -> usize {
        self.n_layers()
    }
    fn n_heads(&self) -> usize {
        self.n_heads()
    }
    fn d_model(&self) -> usize {
        self.d_model()
    }
    fn vocab_size(&self) -> usize {
        self.vocab_size()
    }

    fn forward_with_head_mask(&self, input_ids: &Tensor, mask: Option<&HeadMask>) -> Result<Tensor> {
        self.forward_with_head_mask(input_ids, mask)
    }

    fn forward_with_attention(
        &self,
        input_ids: &Tensor,
        mask: Option<&HeadMask>,
    ) -> Result<(Tensor, AttentionCache)> {
        self.forward_with_attention(input_ids, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ablation::HeadId;
    use candle_nn::VarMap;
    use serial_test::serial;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            n_embd: 16,
            n_head: 4,
            n_layer: 2,
            n_positions: 32,
            vocab_size: 50,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
        }
    }

    fn tiny_model() -> (HapiGpt2, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = HapiGpt2::new(&tiny_config(), vb).unwrap();
        (model, varmap)
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn input() -> Tensor {
        Tensor::new(&[[1u32, 7, 3, 9, 4, 7]], &Device::Cpu).unwrap()
    }

    #[test]
    #[serial]
    fn test_logits_shape() {
        let (model, _vm) = tiny_model();
        let logits = model.forward_with_head_mask(&input(), None).unwrap();
        assert_eq!(logits.dims(), &[1, 6, 50]);
    }

    #[test]
    #[serial]
    fn test_full_mask_matches_unmasked() {
        let (model, _vm) = tiny_model();
        let base = model.forward_with_head_mask(&input(), None).unwrap();
        let full = HeadMask::full(2, 4);
        let masked = model.forward_with_head_mask(&input(), Some(&full)).unwrap();
        assert_eq!(max_abs_diff(&base, &masked), 0.0);
    }

    #[test]
    #[serial]
    fn test_ablation_changes_logits() {
        let (model, _vm) = tiny_model();
        let base = model.forward_with_head_mask(&input(), None).unwrap();
        let none = HeadMask::none(2, 4);
        let ablated = model.forward_with_head_mask(&input(), Some(&none)).unwrap();
        assert!(max_abs_diff(&base, &ablated) > 1e-6);
    }

    #[test]
    #[serial]
    fn test_attention_patterns_unaffected_upstream_of_ablation() {
        let (model, _vm) = tiny_model();
        let mask = HeadMask::all_except(2, 4, &[HeadId::new(0, 1)]).unwrap();

        let (_, base) = model.forward_with_attention(&input(), None).unwrap();
        let (_, ablated) = model.forward_with_attention(&input(), Some(&mask)).unwrap();
        assert_eq!(base.n_layers(), 2);

        // Layer 0 patterns are computed before any head output is zeroed
        let diff = max_abs_diff(base.get_layer(0).unwrap(), ablated.get_layer(0).unwrap());
        assert_eq!(diff, 0.0);

        // Rows are probability distributions
        let rows = base.head_pattern(1, 2).unwrap();
        for row in rows {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    #[serial]
    fn test_mask_shape_mismatch_rejected() {
        let (model, _vm) = tiny_model();
        let wrong = HeadMask::full(3, 4);
        assert!(model.forward_with_head_mask(&input(), Some(&wrong)).is_err());
    }

    #[test]
    #[serial]
    fn test_context_overflow_rejected() {
        let (model, _vm) = tiny_model();
        let ids: Vec<u32> = (0..40).map(|i| i % 50).collect();
        let long = Tensor::new(ids.as_slice(), &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap();
        assert!(model.forward_with_head_mask(&long, None).is_err());
    }
}
