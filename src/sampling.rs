//! Monte Carlo ablation trials
//!
//! Each trial draws a random retention mask, scores a batch of prompts with
//! the masked heads zeroed, and records whether the trial succeeded. Two
//! per-head statistics fall out of the tallies:
//!
//! - **importance**: `P(success | head retained)`, measured at a high
//!   ablation rate where most heads are gone and success depends on the few
//!   that survive.
//! - **exclusion penalty**: `P(failure | head ablated)`, measured at a low
//!   ablation rate where most heads survive and a failure points at the few
//!   that were removed.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ablation::{HeadId, HeadMask};
use crate::evaluation::CompletionEvaluator;
use crate::prompts::PromptSet;
use crate::scores::HeadScores;

/// Which statistic a batch of trials feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    /// High ablation rate, builds importance scores
    Importance,
    /// Low ablation rate, builds exclusion penalties
    Exclusion,
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrialPhase::Importance => write!(f, "importance"),
            TrialPhase::Exclusion => write!(f, "exclusion"),
        }
    }
}

/// Parameters of one batch of trials
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialConfig {
    pub n_trials: usize,
    /// Probability that each head is ablated in a trial
    pub ablation_rate: f64,
    /// Prompts scored per trial (`None` = every prompt)
    pub prompts_per_trial: Option<usize>,
    /// Minimum accuracy over the scored prompts for a trial to count as a success
    pub success_threshold: f64,
}

impl TrialConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.ablation_rate) {
            anyhow::bail!(
                "Ablation rate must be in [0, 1], got {}",
                self.ablation_rate
            );
        }
        if !(0.0..=1.0).contains(&self.success_threshold) {
            anyhow::bail!(
                "Success threshold must be in [0, 1], got {}",
                self.success_threshold
            );
        }
        if self.prompts_per_trial == Some(0) {
            anyhow::bail!("prompts_per_trial must be at least 1");
        }
        Ok(())
    }
}

/// One row of the trial dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub phase: TrialPhase,
    pub trial: usize,
    pub ablation_rate: f64,
    pub ablated: Vec<HeadId>,
    pub evaluated: usize,
    pub correct: usize,
    pub success: bool,
}

/// Per-head counters accumulated across trials
#[derive(Debug, Clone, Serialize)]
pub struct HeadTally {
    n_layers: usize,
    n_heads: usize,
    pub retained_trials: Vec<u32>,
    pub retained_successes: Vec<u32>,
    pub ablated_trials: Vec<u32>,
    pub ablated_failures: Vec<u32>,
}

impl HeadTally {
    pub fn new(n_layers: usize, n_heads: usize) -> Self {
        let n = n_layers * n_heads;
        Self {
            n_layers,
            n_heads,
            retained_trials: vec![0; n],
            retained_successes: vec![0; n],
            ablated_trials: vec![0; n],
            ablated_failures: vec![0; n],
        }
    }

    /// Fold one trial outcome into the counters
    pub fn record(&mut self, mask: &HeadMask, success: bool) {
        for (i, &retained) in mask.as_slice().iter().enumerate() {
            if retained {
                self.retained_trials[i] += 1;
                if success {
                    self.retained_successes[i] += 1;
                }
            } else {
                self.ablated_trials[i] += 1;
                if !success {
                    self.ablated_failures[i] += 1;
                }
            }
        }
    }

    fn ratio(num: &[u32], den: &[u32]) -> Vec<f64> {
        num.iter()
            .zip(den)
            .map(|(&n, &d)| if d == 0 { 0.0 } else { f64::from(n) / f64::from(d) })
            .collect()
    }

    /// `P(success | retained)` per head; 0 for heads never retained
    pub fn importance(&self) -> HeadScores {
        let values = Self::ratio(&self.retained_successes, &self.retained_trials);
        HeadScores::from_layer_major(self.n_layers, self.n_heads, values)
    }

    /// `P(failure | ablated)` per head; 0 for heads never ablated
    pub fn exclusion_penalty(&self) -> HeadScores {
        let values = Self::ratio(&self.ablated_failures, &self.ablated_trials);
        HeadScores::from_layer_major(self.n_layers, self.n_heads, values)
    }
}

/// Everything produced by one batch of trials
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase: TrialPhase,
    pub config: TrialConfig,
    pub tally: HeadTally,
    pub records: Vec<TrialRecord>,
}

impl PhaseOutcome {
    pub fn n_successes(&self) -> usize {
        self.records.iter().filter(|r| r.success).count()
    }

    pub fn success_rate(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.n_successes() as f64 / self.records.len() as f64
    }

    /// The statistic this phase was run for
    pub fn scores(&self) -> HeadScores {
        match self.phase {
            TrialPhase::Importance => self.tally.importance(),
            TrialPhase::Exclusion => self.tally.exclusion_penalty(),
        }
    }
}

/// Run `config.n_trials` independent ablation trials
pub fn run_trials<E, R>(
    evaluator: &E,
    prompts: &PromptSet,
    config: &TrialConfig,
    phase: TrialPhase,
    rng: &mut R,
) -> Result<PhaseOutcome>
where
    E: CompletionEvaluator + ?Sized,
    R: Rng,
{
    config.validate()?;
    if prompts.is_empty() {
        anyhow::bail!("No prompts to score: every prompt was filtered out");
    }

    let (n_layers, n_heads) = evaluator.head_dims();
    let per_trial = config.prompts_per_trial.unwrap_or(prompts.len());
    let mut tally = HeadTally::new(n_layers, n_heads);
    let mut records = Vec::with_capacity(config.n_trials);

    info!(
        "Running {} {} trials at ablation rate {:.2} ({} prompts each)",
        config.n_trials,
        phase,
        config.ablation_rate,
        per_trial.min(prompts.len())
    );

    let report_every = (config.n_trials / 10).max(1);
    for trial in 0..config.n_trials {
        let mask = HeadMask::sample(n_layers, n_heads, config.ablation_rate, rng)?;
        let batch = prompts.sample(per_trial, rng);

        let mut correct = 0;
        for pair in &batch {
            if evaluator.is_correct(pair, &mask)? {
                correct += 1;
            }
        }
        let accuracy = correct as f64 / batch.len() as f64;
        let success = accuracy >= config.success_threshold;

        tally.record(&mask, success);
        debug!(
            "{} trial {}: {} heads ablated, {}/{} correct",
            phase,
            trial,
            mask.n_ablated(),
            correct,
            batch.len()
        );

        records.push(TrialRecord {
            phase,
            trial,
            ablation_rate: config.ablation_rate,
            ablated: mask.ablated_heads(),
            evaluated: batch.len(),
            correct,
            success,
        });

        if (trial + 1) % report_every == 0 {
            let successes = records.iter().filter(|r| r.success).count();
            info!(
                "  {} trials {}/{} ({} successes)",
                phase,
                trial + 1,
                config.n_trials,
                successes
            );
        }
    }

    Ok(PhaseOutcome {
        phase,
        config: *config,
        tally,
        records,
    })
}
