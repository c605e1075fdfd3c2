//! Attention pattern capture for HAPI-rs
//!
//! Stores the post-softmax attention patterns of every layer so individual
//! heads can be inspected (e.g. for the induction-score scan).

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp, Tensor};

/// Cache for storing attention weights from each layer
#[derive(Debug)]
pub struct AttentionCache {
    /// Attention weights per layer: [batch, heads, seq, seq]
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    /// Create new cache with expected capacity
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    /// Add attention pattern for a layer
    pub fn push(&mut self, pattern: Tensor) {
        self.patterns.push(pattern);
    }

    /// Number of layers captured
    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Get attention pattern for a specific layer
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.patterns.get(layer)
    }

    /// Full `[seq, seq]` pattern of one head (first batch element), as f32 rows
    pub fn head_pattern(&self, layer: usize, head: usize) -> Result<Vec<Vec<f32>>> {
        let pattern = self
            .patterns
            .get(layer)
            .with_context(|| format!("No attention pattern cached for layer {layer}"))?;
        let n_heads = pattern.dim(1)?;
        if head >= n_heads {
            anyhow::bail!("Head {head} out of range (layer has {n_heads} heads)");
        }
        let rows = pattern.i((0, head))?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok(rows)
    }

    /// Attention weight from query position `from` to key position `to`
    pub fn weight(&self, layer: usize, head: usize, from: usize, to: usize) -> Result<f32> {
        let pattern = self
            .patterns
            .get(layer)
            .with_context(|| format!("No attention pattern cached for layer {layer}"))?;
        let value = pattern
            .i((0, head, from, to))?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_attention_cache_empty() {
        let cache = AttentionCache::with_capacity(12);
        assert_eq!(cache.n_layers(), 0);
        assert!(cache.is_empty());
        assert!(cache.head_pattern(0, 0).is_err());
    }

    #[test]
    fn test_head_pattern_extraction() {
        // [batch=1, heads=2, seq=2, seq=2]
        let data: Vec<f32> = vec![1.0, 0.0, 0.5, 0.5, 1.0, 0.0, 0.25, 0.75];
        let pattern = Tensor::from_vec(data, (1, 2, 2, 2), &Device::Cpu).unwrap();
        let mut cache = AttentionCache::with_capacity(1);
        cache.push(pattern);

        let head1 = cache.head_pattern(0, 1).unwrap();
        assert_eq!(head1, vec![vec![1.0, 0.0], vec![0.25, 0.75]]);
        assert_eq!(cache.weight(0, 0, 1, 0).unwrap(), 0.5);
        assert!(cache.head_pattern(0, 2).is_err());
    }
}
