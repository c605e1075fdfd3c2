//! Terminal rendering and the optional trial dump

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use tracing::info;

use crate::ablation::HeadId;
use crate::evaluation::MaskEvaluation;
use crate::experiment::{ExperimentConfig, ExperimentResults};
use crate::outliers::z_scores;
use crate::sampling::TrialRecord;
use crate::scores::HeadScores;

/// Shading ramp from lowest to highest value
const SHADES: [char; 5] = [' ', '░', '▒', '▓', '█'];

fn shade(value: f64, min: f64, max: f64) -> char {
    if !value.is_finite() || max <= min {
        return SHADES[0];
    }
    let t = ((value - min) / (max - min)).clamp(0.0, 1.0);
    let idx = (t * (SHADES.len() - 1) as f64).round() as usize;
    SHADES[idx]
}

/// Layers x heads heatmap; each cell is two shade characters wide
pub fn render_heatmap(title: &str, scores: &HeadScores) -> String {
    let (min, max) = (scores.min(), scores.max());
    let mut out = format!("{title}  (min {min:.3}, max {max:.3})\n      ");
    for h in 0..scores.n_heads() {
        out.push_str(&format!("{h:>2}"));
    }
    out.push('\n');

    for layer in 0..scores.n_layers() {
        out.push_str(&format!("  L{layer:<2} "));
        for &v in scores.layer(layer) {
            let c = shade(v, min, max);
            out.push(c);
            out.push(c);
        }
        out.push('\n');
    }
    out
}

fn format_heads(heads: &[HeadId]) -> String {
    if heads.is_empty() {
        return "(none)".to_string();
    }
    heads
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_top(title: &str, scores: &HeadScores, k: usize) {
    let z = z_scores(scores);
    println!("{title}:");
    for (rank, (head, value)) in scores.top_k(k).iter().enumerate() {
        println!(
            "  {:>2}. {:<7} {:.3}  (z = {:+.2})",
            rank + 1,
            head.to_string(),
            value,
            z.get(*head).unwrap_or(0.0)
        );
    }
}

fn print_mask_table(evaluations: &[MaskEvaluation]) {
    println!("┌──────────────────────┬──────────┬──────────┬──────────┐");
    println!("│ Mask                 │ Retained │ Correct  │ Accuracy │");
    println!("├──────────────────────┼──────────┼──────────┼──────────┤");
    for e in evaluations {
        println!(
            "│ {:<20} │ {:>8} │ {:>3}/{:<4} │ {:>7.1}% │",
            e.label,
            e.n_retained,
            e.correct,
            e.total,
            e.accuracy * 100.0
        );
    }
    println!("└──────────────────────┴──────────┴──────────┴──────────┘");
}

/// Print the experiment summary to stdout
pub fn print_summary(results: &ExperimentResults, show_heatmaps: bool) {
    println!("\n═══════════════════════════════════════════════════════════════════");
    println!("  HAPI-rs: Head Ablation Results");
    println!("═══════════════════════════════════════════════════════════════════\n");

    println!(
        "Model: {} ({} layers x {} heads = {} heads)",
        results.model_id,
        results.n_layers,
        results.n_heads,
        results.n_layers * results.n_heads
    );
    println!(
        "Prompts: {} answered correctly by the unablated model ({} rejected)\n",
        results.n_prompts, results.n_rejected
    );

    for outcome in [&results.importance, &results.exclusion] {
        println!(
            "{:<10} phase: {} trials at ablation rate {:.2}, success rate {:.1}%",
            outcome.phase.to_string(),
            outcome.records.len(),
            outcome.config.ablation_rate,
            outcome.success_rate() * 100.0
        );
    }
    println!();

    if show_heatmaps {
        println!("{}", render_heatmap("Importance score", &results.importance_scores));
        println!("{}", render_heatmap("Exclusion penalty", &results.exclusion_penalties));
        if let Some(induction) = &results.induction_scores {
            println!("{}", render_heatmap("Induction score", induction));
        }
    }

    print_top("Top heads by importance", &results.importance_scores, 10);
    println!();
    print_top("Top heads by exclusion penalty", &results.exclusion_penalties, 10);
    println!();
    if let Some(induction) = &results.induction_scores {
        print_top("Top heads by induction score", induction, 10);
        println!();
    }

    let outliers = &results.outliers;
    println!(
        "Outliers (> {:.0}th percentile): importance threshold {:.3}, exclusion threshold {:.3}",
        outliers.percentile, outliers.importance_threshold, outliers.exclusion_threshold
    );
    println!(
        "  importance: {}",
        format_heads(&outliers.importance_outliers)
    );
    println!("  exclusion:  {}", format_heads(&outliers.exclusion_outliers));
    println!("  both:       {}", format_heads(&outliers.agreed()));
    println!("  combined:   {}\n", format_heads(&outliers.combined));

    print_mask_table(&results.mask_evaluations);
}

/// Run metadata stored alongside the trial records
#[derive(Debug, Serialize)]
pub struct DumpMetadata<'a> {
    pub model_id: &'a str,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_prompts: usize,
    pub config: &'a ExperimentConfig,
    pub importance_scores: &'a HeadScores,
    pub exclusion_penalties: &'a HeadScores,
    pub outliers: &'a [HeadId],
}

/// Flat dump: metadata plus every trial of both phases
#[derive(Debug, Serialize)]
pub struct TrialDump<'a> {
    pub metadata: DumpMetadata<'a>,
    pub trials: Vec<&'a TrialRecord>,
}

impl<'a> TrialDump<'a> {
    pub fn new(results: &'a ExperimentResults, config: &'a ExperimentConfig) -> Self {
        let trials = results
            .importance
            .records
            .iter()
            .chain(results.exclusion.records.iter())
            .collect();
        Self {
            metadata: DumpMetadata {
                model_id: &results.model_id,
                n_layers: results.n_layers,
                n_heads: results.n_heads,
                n_prompts: results.n_prompts,
                config,
                importance_scores: &results.importance_scores,
                exclusion_penalties: &results.exclusion_penalties,
                outliers: &results.outliers.combined,
            },
            trials,
        }
    }
}

/// Write the trial dump as pretty JSON, creating parent directories
pub fn write_dump(
    results: &ExperimentResults,
    config: &ExperimentConfig,
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let dump = TrialDump::new(results, config);
    let json = serde_json::to_string_pretty(&dump)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!(
        "Wrote {} trial records to {}",
        dump.trials.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shade_extremes() {
        assert_eq!(shade(0.0, 0.0, 1.0), ' ');
        assert_eq!(shade(1.0, 0.0, 1.0), '█');
        assert_eq!(shade(0.5, 0.5, 0.5), ' ');
        assert_eq!(shade(f64::NAN, 0.0, 1.0), ' ');
    }

    #[test]
    fn test_heatmap_layout() {
        let mut scores = HeadScores::zeros(2, 3);
        scores.set(HeadId::new(1, 2), 1.0);
        let text = render_heatmap("Importance", &scores);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Importance"));
        assert_eq!(lines[1], "       0 1 2");
        assert!(lines[3].starts_with("  L1"));
        assert!(lines[3].ends_with("██"));
        assert_eq!(lines[2].trim_end(), "  L0");
    }

    #[test]
    fn test_format_heads() {
        assert_eq!(format_heads(&[]), "(none)");
        assert_eq!(
            format_heads(&[HeadId::new(5, 1), HeadId::new(6, 9)]),
            "L5H1, L6H9"
        );
    }
}
