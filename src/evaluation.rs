//! Scoring prompts under a head mask
//!
//! [`CompletionEvaluator`] is the seam between the trial loop and the model:
//! [`crate::HapiModel`] implements it with real forward passes, tests
//! implement it with synthetic circuits.

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::ablation::{HeadId, HeadMask};
use crate::prompts::{PromptPair, PromptSet};

/// Anything that can say whether a prompt is completed correctly under a mask
pub trait CompletionEvaluator {
    /// (n_layers, n_heads)
    fn head_dims(&self) -> (usize, usize);

    /// True when the expected completion is produced with `mask` applied
    fn is_correct(&self, pair: &PromptPair, mask: &HeadMask) -> Result<bool>;
}

/// Accuracy of one mask over a prompt set
#[derive(Debug, Clone, Serialize)]
pub struct MaskEvaluation {
    pub label: String,
    pub n_retained: usize,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

/// Score every prompt of `prompts` under `mask`
pub fn evaluate_mask<E: CompletionEvaluator + ?Sized>(
    evaluator: &E,
    prompts: &PromptSet,
    mask: &HeadMask,
    label: &str,
) -> Result<MaskEvaluation> {
    let mut correct = 0;
    for pair in prompts.pairs() {
        if evaluator.is_correct(pair, mask)? {
            correct += 1;
        }
    }
    let total = prompts.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };

    info!(
        "Mask '{}' ({} heads retained): {}/{} correct",
        label,
        mask.n_retained(),
        correct,
        total
    );

    Ok(MaskEvaluation {
        label: label.to_string(),
        n_retained: mask.n_retained(),
        correct,
        total,
        accuracy,
    })
}

/// Evaluate the three fixed masks: outliers only, outliers ablated, full model
pub fn evaluate_outlier_masks<E: CompletionEvaluator + ?Sized>(
    evaluator: &E,
    prompts: &PromptSet,
    outliers: &[HeadId],
) -> Result<Vec<MaskEvaluation>> {
    let (n_layers, n_heads) = evaluator.head_dims();
    let only = HeadMask::only(n_layers, n_heads, outliers)?;
    let ablated = HeadMask::all_except(n_layers, n_heads, outliers)?;
    let full = HeadMask::full(n_layers, n_heads);

    Ok(vec![
        evaluate_mask(evaluator, prompts, &only, "outliers only")?,
        evaluate_mask(evaluator, prompts, &ablated, "outliers ablated")?,
        evaluate_mask(evaluator, prompts, &full, "full model")?,
    ])
}
