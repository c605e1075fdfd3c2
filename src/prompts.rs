//! Induction prompts for HAPI-rs experiments
//!
//! Each prompt repeats a token sequence (a name, a phrase) so that the
//! correct completion can only be produced by copying from the earlier
//! occurrence.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::ablation::HeadMask;
use crate::evaluation::CompletionEvaluator;

/// A prompt and the completion the model is expected to produce
///
/// The completion carries its own leading whitespace (e.g. `" Dursley"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    pub prompt: String,
    pub expected: String,
}

impl PromptPair {
    pub fn new(prompt: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            expected: expected.into(),
        }
    }
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct PromptFile {
    prompts: Vec<PromptPair>,
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

const BUILTIN_PROMPTS: &[(&str, &str)] = &[
    (
        "Mr and Mrs Dursley, of number four, Privet Drive, were proud to say that they were perfectly normal, thank you very much. Mr and Mrs",
        " Dursley",
    ),
    (
        "The quick brown fox jumps over the lazy dog. The quick brown fox jumps over the lazy",
        " dog",
    ),
    (
        "Our guest today is Professor Hannah Okonkwo from the physics department. Please give a warm welcome to Professor Hannah",
        " Ok",
    ),
    (
        "Alice Whitaker went to the market to buy apples. On the way home, Alice",
        " Whit",
    ),
    (
        "The treaty was signed in the city of Valparaiso in 1904. Decades later, historians still visit the archives in",
        " Val",
    ),
    (
        "Password: tangerine helicopter velvet. Please repeat the password: tangerine helicopter",
        " velvet",
    ),
    (
        "The committee was chaired by Dr. Ingrid Solberg. After the vote, Dr. Ingrid",
        " Sol",
    ),
    (
        "copper lantern violin zebra marble. copper lantern violin zebra",
        " marble",
    ),
    (
        "The ship was named the Esmeralda Fortune, and the Esmeralda",
        " Fortune",
    ),
    (
        "Bartholomew Quinlan signed the letter. Everyone in town trusted Bartholomew",
        " Quin",
    ),
    (
        "1 2 3 4 5 apple 6 7 8 9. Again: 1 2 3 4 5 apple 6 7 8",
        " 9",
    ),
    (
        "The password for the vault is crimson falcon. To open the vault, say crimson",
        " falcon",
    ),
];

/// Collection of prompt/completion pairs
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptSet {
    pairs: Vec<PromptPair>,
}

impl PromptSet {
    pub fn new(pairs: Vec<PromptPair>) -> Self {
        Self { pairs }
    }

    /// Built-in induction prompts
    pub fn builtin() -> Self {
        Self {
            pairs: BUILTIN_PROMPTS
                .iter()
                .map(|(p, e)| PromptPair::new(*p, *e))
                .collect(),
        }
    }

    /// Load prompts from a JSON file: `{"prompts": [{"prompt", "expected"}]}`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
        let file: PromptFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse prompt file: {}", path.display()))?;

        for (i, pair) in file.prompts.iter().enumerate() {
            if pair.prompt.is_empty() || pair.expected.is_empty() {
                anyhow::bail!("Prompt {i} in {} has an empty prompt or completion", path.display());
            }
        }

        Ok(Self {
            pairs: file.prompts,
        })
    }

    /// Keep only the pairs the unablated model completes correctly
    ///
    /// Returns the filtered set and the number of rejected pairs.
    pub fn filter_correct<E: CompletionEvaluator + ?Sized>(
        &self,
        evaluator: &E,
    ) -> Result<(Self, usize)> {
        let (n_layers, n_heads) = evaluator.head_dims();
        let full = HeadMask::full(n_layers, n_heads);

        let mut kept = Vec::with_capacity(self.pairs.len());
        for pair in &self.pairs {
            if evaluator.is_correct(pair, &full)? {
                kept.push(pair.clone());
            } else {
                debug!("Rejected prompt (unablated model misses it): {:?}", pair.prompt);
            }
        }

        let rejected = self.pairs.len() - kept.len();
        info!(
            "Prompt filter: kept {} of {} prompts",
            kept.len(),
            self.pairs.len()
        );
        Ok((Self { pairs: kept }, rejected))
    }

    /// Random subset of `k` pairs (all pairs when `k >= len`)
    pub fn sample<R: Rng>(&self, k: usize, rng: &mut R) -> Vec<&PromptPair> {
        if k >= self.pairs.len() {
            return self.pairs.iter().collect();
        }
        self.pairs.choose_multiple(rng, k).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[PromptPair] {
        &self.pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_builtin_prompts_are_well_formed() {
        let set = PromptSet::builtin();
        assert!(set.len() >= 10);
        for pair in set.pairs() {
            assert!(!pair.prompt.is_empty());
            assert!(pair.expected.starts_with(' '));
        }
    }

    #[test]
    fn test_sample_subset() {
        let set = PromptSet::builtin();
        let mut rng = StdRng::seed_from_u64(3);

        let subset = set.sample(4, &mut rng);
        assert_eq!(subset.len(), 4);

        let all = set.sample(100, &mut rng);
        assert_eq!(all.len(), set.len());
    }
}
