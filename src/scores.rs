//! Per-head scalar maps (importance, exclusion penalty, induction score)

use serde::{Deserialize, Serialize};

use crate::ablation::HeadId;

/// One scalar per attention head, stored layer-major
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadScores {
    n_layers: usize,
    n_heads: usize,
    values: Vec<f64>,
}

impl HeadScores {
    /// All-zero map
    pub fn zeros(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            values: vec![0.0; n_layers * n_heads],
        }
    }

    /// Build from layer-major values; fails if the length does not match
    pub fn from_values(n_layers: usize, n_heads: usize, values: Vec<f64>) -> anyhow::Result<Self> {
        if values.len() != n_layers * n_heads {
            anyhow::bail!(
                "Expected {} scores for {n_layers}x{n_heads} heads, got {}",
                n_layers * n_heads,
                values.len()
            );
        }
        Ok(Self {
            n_layers,
            n_heads,
            values,
        })
    }

    /// Wrap values already laid out layer-major for `n_layers x n_heads`
    pub(crate) fn from_layer_major(n_layers: usize, n_heads: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), n_layers * n_heads);
        Self {
            n_layers,
            n_heads,
            values,
        }
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn get(&self, head: HeadId) -> Option<f64> {
        if head.layer >= self.n_layers || head.head >= self.n_heads {
            return None;
        }
        self.values.get(head.index(self.n_heads)).copied()
    }

    pub fn set(&mut self, head: HeadId, value: f64) {
        if head.layer < self.n_layers && head.head < self.n_heads {
            self.values[head.index(self.n_heads)] = value;
        }
    }

    /// Scores of one layer, in head order
    pub fn layer(&self, layer: usize) -> &[f64] {
        let start = layer * self.n_heads;
        &self.values[start..start + self.n_heads]
    }

    /// (head, score) pairs in layer-major order
    pub fn iter(&self) -> impl Iterator<Item = (HeadId, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &v)| (HeadId::from_index(i, self.n_heads), v))
    }

    /// Highest-scoring heads, descending; ties keep layer-major order
    pub fn top_k(&self, k: usize) -> Vec<(HeadId, f64)> {
        let mut ranked: Vec<(HeadId, f64)> = self.iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(k);
        ranked
    }

    pub fn max(&self) -> f64 {
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn min(&self) -> f64 {
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }
}
