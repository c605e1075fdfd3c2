//! Outlier head detection by percentile threshold
//!
//! A head is an outlier for a statistic when its score lies strictly above
//! the chosen percentile of that statistic across all heads. Strict
//! comparison means a flat distribution (every head tied) has no outliers.

use anyhow::Result;
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics, Statistics};

use crate::ablation::HeadId;
use crate::scores::HeadScores;

/// Percentile of `values` (0-100), using statrs' quantile estimator
pub fn percentile_threshold(values: &[f64], percentile: f64) -> Result<f64> {
    if values.is_empty() {
        anyhow::bail!("Cannot take a percentile of an empty score set");
    }
    if !(0.0..=100.0).contains(&percentile) {
        anyhow::bail!("Percentile must be in [0, 100], got {percentile}");
    }
    let mut data = Data::new(values.to_vec());
    Ok(data.quantile(percentile / 100.0))
}

/// Heads scoring strictly above the percentile threshold, highest first
pub fn detect_outliers(scores: &HeadScores, percentile: f64) -> Result<(f64, Vec<HeadId>)> {
    let threshold = percentile_threshold(scores.values(), percentile)?;
    let mut outliers: Vec<(HeadId, f64)> = scores.iter().filter(|&(_, v)| v > threshold).collect();
    outliers.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    Ok((threshold, outliers.into_iter().map(|(h, _)| h).collect()))
}

/// Standard scores `(x - mean) / std_dev`; all zero when the spread is zero
pub fn z_scores(scores: &HeadScores) -> HeadScores {
    let values = scores.values();
    let mean = values.iter().mean();
    let std_dev = values.iter().std_dev();

    let mut z = HeadScores::zeros(scores.n_layers(), scores.n_heads());
    if std_dev.is_finite() && std_dev > 0.0 {
        for (head, v) in scores.iter() {
            z.set(head, (v - mean) / std_dev);
        }
    }
    z
}

/// Outliers of both statistics
#[derive(Debug, Clone, Serialize)]
pub struct OutlierReport {
    pub percentile: f64,
    pub importance_threshold: f64,
    pub exclusion_threshold: f64,
    pub importance_outliers: Vec<HeadId>,
    pub exclusion_outliers: Vec<HeadId>,
    /// Union of both sets, sorted by (layer, head)
    pub combined: Vec<HeadId>,
}

impl OutlierReport {
    pub fn from_scores(
        importance: &HeadScores,
        exclusion: &HeadScores,
        percentile: f64,
    ) -> Result<Self> {
        let (importance_threshold, importance_outliers) = detect_outliers(importance, percentile)?;
        let (exclusion_threshold, exclusion_outliers) = detect_outliers(exclusion, percentile)?;

        let mut combined: Vec<HeadId> = importance_outliers
            .iter()
            .chain(exclusion_outliers.iter())
            .copied()
            .collect();
        combined.sort();
        combined.dedup();

        Ok(Self {
            percentile,
            importance_threshold,
            exclusion_threshold,
            importance_outliers,
            exclusion_outliers,
            combined,
        })
    }

    /// Heads flagged by both statistics
    pub fn agreed(&self) -> Vec<HeadId> {
        self.combined
            .iter()
            .filter(|h| self.importance_outliers.contains(h) && self.exclusion_outliers.contains(h))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spike(n_layers: usize, n_heads: usize, at: HeadId, value: f64) -> HeadScores {
        let mut scores = HeadScores::from_values(
            n_layers,
            n_heads,
            vec![0.1; n_layers * n_heads],
        )
        .unwrap();
        scores.set(at, value);
        scores
    }

    #[test]
    fn test_single_spike_detected() {
        let scores = spike(4, 5, HeadId::new(2, 3), 0.9);
        let (threshold, outliers) = detect_outliers(&scores, 90.0).unwrap();
        assert!((threshold - 0.1).abs() < 1e-12);
        assert_eq!(outliers, vec![HeadId::new(2, 3)]);
    }

    #[test]
    fn test_flat_distribution_has_no_outliers() {
        let scores = HeadScores::from_values(3, 3, vec![0.4; 9]).unwrap();
        let (_, outliers) = detect_outliers(&scores, 95.0).unwrap();
        assert!(outliers.is_empty());
    }

    #[test]
    fn test_percentile_bounds() {
        assert!(percentile_threshold(&[], 50.0).is_err());
        assert!(percentile_threshold(&[1.0, 2.0], 101.0).is_err());
        let max = percentile_threshold(&[1.0, 2.0, 3.0], 100.0).unwrap();
        assert!((max - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_z_scores() {
        let scores = HeadScores::from_values(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let z = z_scores(&scores);
        let sum: f64 = z.values().iter().sum();
        assert!(sum.abs() < 1e-12);
        assert!(z.values()[3] > 1.0);

        let flat = HeadScores::from_values(1, 3, vec![0.5; 3]).unwrap();
        assert!(z_scores(&flat).values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_report_union_and_agreement() {
        let importance = spike(4, 5, HeadId::new(1, 1), 0.8);
        let mut exclusion = spike(4, 5, HeadId::new(3, 0), 0.7);
        exclusion.set(HeadId::new(1, 1), 0.9);

        let report = OutlierReport::from_scores(&importance, &exclusion, 80.0).unwrap();
        assert_eq!(report.importance_outliers, vec![HeadId::new(1, 1)]);
        assert_eq!(
            report.exclusion_outliers,
            vec![HeadId::new(1, 1), HeadId::new(3, 0)]
        );
        assert_eq!(report.combined, vec![HeadId::new(1, 1), HeadId::new(3, 0)]);
        assert_eq!(report.agreed(), vec![HeadId::new(1, 1)]);
    }
}
