//! Shared attention mask utilities for HAPI-rs
//!
//! Provides the cached causal mask used by every model backend (GPT-2, LLaMA).
//!
//! ## Caching Strategy
//!
//! Masks are cached by `(seq_len, device kind, dtype)`. A Monte Carlo run performs
//! thousands of forward passes over a handful of prompt lengths, so the same
//! few masks are requested over and over. Cache hits are shallow clones
//! (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

type MaskKey = (usize, usize, DType);

/// Causal masks by (seq_len, device kind, dtype)
static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// The cache only holds immutable tensors, so a poisoned lock is still usable
fn cache() -> MutexGuard<'static, HashMap<MaskKey, Tensor>> {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// One device per kind is assumed
fn device_kind(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Row-major `seq_len x seq_len` additive mask: 0 where key <= query, -inf above
fn causal_mask_values(seq_len: usize) -> Vec<f32> {
    let mut values = vec![0.0; seq_len * seq_len];
    for query in 0..seq_len {
        values[query * seq_len + query + 1..(query + 1) * seq_len].fill(f32::NEG_INFINITY);
    }
    values
}

/// Causal mask `[1, 1, seq_len, seq_len]`, built once per key and reused
///
/// For seq_len=3:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_kind(device), dtype);
    if let Some(mask) = cache().get(&key) {
        return Ok(mask.clone());
    }

    let mask = Tensor::from_vec(causal_mask_values(seq_len), (1, 1, seq_len, seq_len), device)?
        .to_dtype(dtype)?;
    cache().insert(key, mask.clone());
    Ok(mask)
}

/// Clear all cached masks
pub fn clear_mask_caches() {
    cache().clear();
}

/// Number of masks currently cached
pub fn mask_cache_size() -> usize {
    cache().len()
}
