//! Head ablation masks for HAPI-rs
//!
//! A [`HeadMask`] records, for every attention head of the model, whether the
//! head is retained or ablated. Ablated heads have their per-head attention
//! output (`z`, before the output projection) multiplied by zero, removing
//! their contribution to the residual stream while leaving the output
//! projection bias in place.
//!
//! ## Example
//!
//! ```ignore
//! use hapi_rs::{HapiModel, HeadId, HeadMask};
//! use rand::SeedableRng;
//!
//! let model = HapiModel::from_pretrained("openai-community/gpt2")?;
//! let (n_layers, n_heads) = (model.n_layers(), model.n_heads());
//!
//! // Knock out 90% of heads at random
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//! let mask = HeadMask::sample(n_layers, n_heads, 0.9, &mut rng)?;
//!
//! // Keep only two candidate induction heads
//! let mask = HeadMask::only(n_layers, n_heads, &[HeadId::new(5, 1), HeadId::new(6, 9)])?;
//! ```

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one attention head: (layer, head-within-layer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeadId {
    pub layer: usize,
    pub head: usize,
}

impl HeadId {
    pub fn new(layer: usize, head: usize) -> Self {
        Self { layer, head }
    }

    /// Rebuild a head id from its layer-major flat index
    pub fn from_index(index: usize, n_heads: usize) -> Self {
        Self {
            layer: index / n_heads,
            head: index % n_heads,
        }
    }

    /// Layer-major flat index: `layer * n_heads + head`
    pub fn index(&self, n_heads: usize) -> usize {
        self.layer * n_heads + self.head
    }
}

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}H{}", self.layer, self.head)
    }
}

/// Binary retention mask over all heads of a model (`true` = retained)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHeadMask")]
pub struct HeadMask {
    n_layers: usize,
    n_heads: usize,
    retained: Vec<bool>,
}

/// Unchecked serialized form of [`HeadMask`]
#[derive(Deserialize)]
struct RawHeadMask {
    n_layers: usize,
    n_heads: usize,
    retained: Vec<bool>,
}

impl TryFrom<RawHeadMask> for HeadMask {
    type Error = anyhow::Error;

    fn try_from(raw: RawHeadMask) -> Result<Self> {
        if raw.retained.len() != raw.n_layers * raw.n_heads {
            anyhow::bail!(
                "Mask has {} flags for {}x{} heads",
                raw.retained.len(),
                raw.n_layers,
                raw.n_heads
            );
        }
        Ok(Self {
            n_layers: raw.n_layers,
            n_heads: raw.n_heads,
            retained: raw.retained,
        })
    }
}

impl HeadMask {
    /// Every head retained (the unablated model)
    pub fn full(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            retained: vec![true; n_layers * n_heads],
        }
    }

    /// Every head ablated
    pub fn none(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            retained: vec![false; n_layers * n_heads],
        }
    }

    /// Retain only the given heads
    pub fn only(n_layers: usize, n_heads: usize, heads: &[HeadId]) -> Result<Self> {
        let mut mask = Self::none(n_layers, n_heads);
        for &head in heads {
            mask.set(head, true)?;
        }
        Ok(mask)
    }

    /// Ablate only the given heads
    pub fn all_except(n_layers: usize, n_heads: usize, heads: &[HeadId]) -> Result<Self> {
        let mut mask = Self::full(n_layers, n_heads);
        for &head in heads {
            mask.set(head, false)?;
        }
        Ok(mask)
    }

    /// Sample a random mask: each head is ablated independently with
    /// probability `ablation_rate`.
    pub fn sample<R: Rng>(
        n_layers: usize,
        n_heads: usize,
        ablation_rate: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if !(0.0..=1.0).contains(&ablation_rate) {
            anyhow::bail!("Ablation rate must be in [0, 1], got {ablation_rate}");
        }
        let retained = (0..n_layers * n_heads)
            .map(|_| !rng.gen_bool(ablation_rate))
            .collect();
        Ok(Self {
            n_layers,
            n_heads,
            retained,
        })
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Total number of heads covered by the mask
    pub fn total_heads(&self) -> usize {
        self.retained.len()
    }

    fn check(&self, head: HeadId) -> Result<()> {
        if head.layer >= self.n_layers || head.head >= self.n_heads {
            anyhow::bail!(
                "Head {head} out of range (mask covers {} layers x {} heads)",
                self.n_layers,
                self.n_heads
            );
        }
        Ok(())
    }

    /// Mark a head as retained (`true`) or ablated (`false`)
    pub fn set(&mut self, head: HeadId, retained: bool) -> Result<()> {
        self.check(head)?;
        let idx = head.index(self.n_heads);
        self.retained[idx] = retained;
        Ok(())
    }

    /// Whether a head is retained; out-of-range heads report `false`
    pub fn is_retained(&self, head: HeadId) -> bool {
        if head.layer >= self.n_layers || head.head >= self.n_heads {
            return false;
        }
        self.retained[head.index(self.n_heads)]
    }

    /// Retention flags in layer-major order
    pub fn as_slice(&self) -> &[bool] {
        &self.retained
    }

    pub fn retained_heads(&self) -> Vec<HeadId> {
        self.heads_where(true)
    }

    pub fn ablated_heads(&self) -> Vec<HeadId> {
        self.heads_where(false)
    }

    fn heads_where(&self, retained: bool) -> Vec<HeadId> {
        self.retained
            .iter()
            .enumerate()
            .filter(|&(_, &r)| r == retained)
            .map(|(i, _)| HeadId::from_index(i, self.n_heads))
            .collect()
    }

    pub fn n_retained(&self) -> usize {
        self.retained.iter().filter(|&&r| r).count()
    }

    pub fn n_ablated(&self) -> usize {
        self.total_heads() - self.n_retained()
    }

    /// True when no head of `layer` is ablated
    pub fn layer_is_full(&self, layer: usize) -> bool {
        self.layer_slice(layer).iter().all(|&r| r)
    }

    fn layer_slice(&self, layer: usize) -> &[bool] {
        let start = layer * self.n_heads;
        &self.retained[start..start + self.n_heads]
    }

    /// Per-head multiplier for one layer, shape `[1, n_heads, 1, 1]`
    ///
    /// Returns `None` when the layer is fully retained so the forward pass
    /// can skip the multiply entirely.
    pub fn layer_tensor(
        &self,
        layer: usize,
        device: &Device,
        dtype: DType,
    ) -> Result<Option<Tensor>> {
        if layer >= self.n_layers {
            anyhow::bail!(
                "Layer {layer} out of range (mask covers {} layers)",
                self.n_layers
            );
        }
        if self.layer_is_full(layer) {
            return Ok(None);
        }
        let values: Vec<f32> = self
            .layer_slice(layer)
            .iter()
            .map(|&r| if r { 1.0 } else { 0.0 })
            .collect();
        let tensor = Tensor::from_vec(values, (1, self.n_heads, 1, 1), device)?.to_dtype(dtype)?;
        Ok(Some(tensor))
    }

    /// Validate the mask against model dimensions
    pub fn validate(&self, n_layers: usize, n_heads: usize) -> Result<()> {
        if self.n_layers != n_layers || self.n_heads != n_heads {
            anyhow::bail!(
                "Mask shape {}x{} does not match model shape {}x{}",
                self.n_layers,
                self.n_heads,
                n_layers,
                n_heads
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_head_id_index_roundtrip() {
        let head = HeadId::new(3, 7);
        assert_eq!(head.index(12), 43);
        assert_eq!(HeadId::from_index(43, 12), head);
        assert_eq!(head.to_string(), "L3H7");
    }

    #[test]
    fn test_full_and_none() {
        let full = HeadMask::full(2, 3);
        assert_eq!(full.n_retained(), 6);
        assert_eq!(full.n_ablated(), 0);
        assert!(full.layer_is_full(0) && full.layer_is_full(1));

        let none = HeadMask::none(2, 3);
        assert_eq!(none.n_retained(), 0);
        assert_eq!(none.ablated_heads().len(), 6);
    }

    #[test]
    fn test_only_and_all_except_are_complements() {
        let heads = [HeadId::new(0, 1), HeadId::new(1, 2)];
        let only = HeadMask::only(2, 3, &heads).unwrap();
        let except = HeadMask::all_except(2, 3, &heads).unwrap();

        assert_eq!(only.retained_heads(), heads.to_vec());
        assert_eq!(except.ablated_heads(), heads.to_vec());
        for (a, b) in only.as_slice().iter().zip(except.as_slice()) {
            assert_ne!(a, b);
        }
    }

    #[test]
    fn test_out_of_range_head_rejected() {
        assert!(HeadMask::only(2, 3, &[HeadId::new(2, 0)]).is_err());
        assert!(HeadMask::all_except(2, 3, &[HeadId::new(0, 3)]).is_err());
        assert!(!HeadMask::full(2, 3).is_retained(HeadId::new(5, 5)));
    }

    #[test]
    fn test_sample_extreme_rates() {
        let mut rng = StdRng::seed_from_u64(7);
        let keep_all = HeadMask::sample(4, 4, 0.0, &mut rng).unwrap();
        assert_eq!(keep_all, HeadMask::full(4, 4));

        let drop_all = HeadMask::sample(4, 4, 1.0, &mut rng).unwrap();
        assert_eq!(drop_all, HeadMask::none(4, 4));

        assert!(HeadMask::sample(4, 4, 1.5, &mut rng).is_err());
        assert!(HeadMask::sample(4, 4, -0.1, &mut rng).is_err());
    }

    #[test]
    fn test_sample_is_reproducible() {
        let a = HeadMask::sample(12, 12, 0.5, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = HeadMask::sample(12, 12, 0.5, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_sample_rate_roughly_respected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mask = HeadMask::sample(40, 25, 0.8, &mut rng).unwrap();
        let frac = mask.n_ablated() as f64 / mask.total_heads() as f64;
        assert!((frac - 0.8).abs() < 0.05, "ablated fraction {frac}");
    }

    #[test]
    fn test_layer_tensor() {
        let mask = HeadMask::all_except(2, 3, &[HeadId::new(1, 1)]).unwrap();
        assert!(mask
            .layer_tensor(0, &Device::Cpu, DType::F32)
            .unwrap()
            .is_none());

        let t = mask
            .layer_tensor(1, &Device::Cpu, DType::F32)
            .unwrap()
            .unwrap();
        assert_eq!(t.dims(), &[1, 3, 1, 1]);
        let values: Vec<f32> = t.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![1.0, 0.0, 1.0]);

        assert!(mask.layer_tensor(2, &Device::Cpu, DType::F32).is_err());
    }

    #[test]
    fn test_deserialize_checks_flag_count() {
        let ok: HeadMask =
            serde_json::from_str(r#"{"n_layers": 1, "n_heads": 2, "retained": [true, false]}"#)
                .unwrap();
        assert_eq!(ok.ablated_heads(), vec![HeadId::new(0, 1)]);

        let short = serde_json::from_str::<HeadMask>(
            r#"{"n_layers": 2, "n_heads": 3, "retained": [true, true, true, true, true]}"#,
        );
        assert!(short.is_err());
    }

    #[test]
    fn test_validate() {
        let mask = HeadMask::full(12, 12);
        assert!(mask.validate(12, 12).is_ok());
        assert!(mask.validate(12, 16).is_err());
    }
}
