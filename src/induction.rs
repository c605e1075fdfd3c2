//! Induction-score scan
//!
//! Feeds the model a random token sequence repeated twice and measures, for
//! every head, how much attention each position of the second copy pays to
//! the token right after its earlier occurrence. Induction heads score close
//! to 1; other heads stay near 0. The scan is an attention-pattern
//! cross-check for the ablation-derived importance scores.

use anyhow::Result;
use rand::Rng;
use tracing::info;

use crate::ablation::HeadId;
use crate::model::HapiModel;
use crate::scores::HeadScores;

/// Lowest token id drawn for the random sequence (skips byte/control tokens)
const MIN_RANDOM_TOKEN: u32 = 256;

/// Build `[bos?] + r + r` for a random `r` of length `half_len`
///
/// Returns the sequence and the offset of the first copy.
pub fn repeated_sequence<R: Rng>(
    half_len: usize,
    vocab_size: usize,
    bos: Option<u32>,
    rng: &mut R,
) -> Result<(Vec<u32>, usize)> {
    if half_len < 2 {
        anyhow::bail!("Repeated sequence needs at least 2 tokens per copy, got {half_len}");
    }
    let upper = vocab_size as u32;
    if upper <= MIN_RANDOM_TOKEN {
        anyhow::bail!("Vocabulary of {vocab_size} tokens is too small for the induction scan");
    }

    let half: Vec<u32> = (0..half_len)
        .map(|_| rng.gen_range(MIN_RANDOM_TOKEN..upper))
        .collect();

    let mut seq = Vec::with_capacity(2 * half_len + 1);
    let offset = match bos {
        Some(id) => {
            seq.push(id);
            1
        }
        None => 0,
    };
    seq.extend_from_slice(&half);
    seq.extend_from_slice(&half);
    Ok((seq, offset))
}

/// Mean attention from each second-copy position `q` to `q - half_len + 1`
///
/// `pattern` is one head's `[seq, seq]` attention matrix.
pub fn induction_score(pattern: &[Vec<f32>], offset: usize, half_len: usize) -> Result<f64> {
    let end = offset + 2 * half_len;
    if pattern.len() < end {
        anyhow::bail!(
            "Pattern has {} rows, expected at least {end}",
            pattern.len()
        );
    }

    let mut total = 0.0;
    for q in offset + half_len..end {
        let key = q + 1 - half_len;
        total += f64::from(pattern[q][key]);
    }
    Ok(total / half_len as f64)
}

/// Induction scores for every head of `model`, averaged over `n_sequences`
pub fn scan<R: Rng>(
    model: &HapiModel,
    half_len: usize,
    n_sequences: usize,
    rng: &mut R,
) -> Result<HeadScores> {
    let (n_layers, n_heads) = (model.n_layers(), model.n_heads());
    let n_sequences = n_sequences.max(1);
    let mut totals = vec![0.0; n_layers * n_heads];

    info!(
        "Induction scan: {} sequences of 2 x {} random tokens",
        n_sequences, half_len
    );

    for _ in 0..n_sequences {
        let (seq, offset) = repeated_sequence(half_len, model.vocab_size(), model.bos_token_id(), rng)?;
        let cache = model.attention_patterns(&seq, None)?;

        for layer in 0..n_layers {
            for head in 0..n_heads {
                let pattern = cache.head_pattern(layer, head)?;
                totals[HeadId::new(layer, head).index(n_heads)] +=
                    induction_score(&pattern, offset, half_len)?;
            }
        }
    }

    let means = totals.into_iter().map(|t| t / n_sequences as f64).collect();
    HeadScores::from_values(n_layers, n_heads, means)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_repeated_sequence_layout() {
        let mut rng = StdRng::seed_from_u64(4);
        let (seq, offset) = repeated_sequence(5, 1000, Some(999), &mut rng).unwrap();
        assert_eq!(offset, 1);
        assert_eq!(seq.len(), 11);
        assert_eq!(seq[0], 999);
        assert_eq!(seq[1..6], seq[6..11]);
        assert!(seq[1..].iter().all(|&t| (MIN_RANDOM_TOKEN..1000).contains(&t)));

        assert!(repeated_sequence(1, 1000, None, &mut rng).is_err());
        assert!(repeated_sequence(5, 100, None, &mut rng).is_err());
    }

    /// A perfect induction head: second-copy position q attends only to q - L + 1
    fn perfect_pattern(offset: usize, half_len: usize) -> Vec<Vec<f32>> {
        let n = offset + 2 * half_len;
        (0..n)
            .map(|q| {
                let mut row = vec![0.0; n];
                if q >= offset + half_len {
                    row[q + 1 - half_len] = 1.0;
                } else {
                    row[q] = 1.0;
                }
                row
            })
            .collect()
    }

    #[test]
    fn test_perfect_induction_head_scores_one() {
        let pattern = perfect_pattern(1, 4);
        let score = induction_score(&pattern, 1, 4).unwrap();
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_self_attending_head_scores_zero() {
        let n = 9;
        let pattern: Vec<Vec<f32>> = (0..n)
            .map(|q| {
                let mut row = vec![0.0; n];
                row[q] = 1.0;
                row
            })
            .collect();
        assert_eq!(induction_score(&pattern, 1, 4).unwrap(), 0.0);
        assert!(induction_score(&pattern, 1, 5).is_err());
    }
}
