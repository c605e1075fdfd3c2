//! Integration tests for HAPI-rs
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use anyhow::Result;
use hapi_rs::{
    induction, write_dump, CompletionEvaluator, Experiment, ExperimentConfig, HapiModel, HeadId,
    HeadMask, PromptPair, PromptSet,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::Write;
use tempfile::NamedTempFile;

/// Synthetic 4x4 model: answers correctly iff both circuit heads survive
struct TwoHeadCircuit;

const CIRCUIT: [HeadId; 2] = [HeadId { layer: 1, head: 2 }, HeadId { layer: 3, head: 0 }];

impl CompletionEvaluator for TwoHeadCircuit {
    fn head_dims(&self) -> (usize, usize) {
        (4, 4)
    }

    fn is_correct(&self, pair: &PromptPair, mask: &HeadMask) -> Result<bool> {
        if pair.expected == " ???" {
            return Ok(false);
        }
        Ok(CIRCUIT.iter().all(|&h| mask.is_retained(h)))
    }
}

fn circuit_prompts() -> PromptSet {
    PromptSet::new(vec![
        PromptPair::new("Mr and Mrs Dursley. Mr and Mrs", " Dursley"),
        PromptPair::new("alpha beta gamma alpha beta", " gamma"),
        PromptPair::new("red green blue red green", " blue"),
        PromptPair::new("no pattern here", " ???"),
    ])
}

fn circuit_config() -> ExperimentConfig {
    ExperimentConfig {
        model_id: "synthetic/two-head-circuit".to_string(),
        n_trials: 400,
        percentile: 85.0,
        seed: 1234,
        ..Default::default()
    }
}

/// Test prompt loading from JSON
#[test]
fn test_prompt_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{
        "metadata": {{"task": "induction"}},
        "prompts": [
            {{"prompt": "Mr and Mrs Dursley. Mr and Mrs", "expected": " Dursley"}},
            {{"prompt": "A B C A B", "expected": " C"}}
        ]
    }}"#
    )
    .unwrap();

    let prompts = PromptSet::load(file.path()).unwrap();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts.pairs()[0].expected, " Dursley");
    assert_eq!(prompts.pairs()[1].prompt, "A B C A B");
}

/// Empty completions cannot be scored
#[test]
fn test_prompt_loading_rejects_empty_completion() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"prompts": [{{"prompt": "A B A", "expected": ""}}]}}"#
    )
    .unwrap();

    assert!(PromptSet::load(file.path()).is_err());
}

/// Test that the bundled prompt file parses
#[test]
fn test_bundled_prompt_file() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/corpus/induction_prompts.json");
    let prompts = PromptSet::load(path).unwrap();
    assert!(!prompts.is_empty());
    assert!(prompts
        .pairs()
        .iter()
        .all(|p| p.expected.starts_with(' ')));
}

/// Test experiment config defaults
#[test]
fn test_experiment_config_defaults() {
    let config = ExperimentConfig::default();
    assert_eq!(config.model_id, "openai-community/gpt2");
    assert!(config.high_ablation_rate > config.low_ablation_rate);
    assert_eq!(config.percentile, 95.0);
    assert_eq!(config.seed, 42);
    assert!(config.prompts_path.is_none());
    assert!(config.dump_path.is_none());
}

/// Partial config files keep defaults for missing fields
#[test]
fn test_experiment_config_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"n_trials": 50, "seed": 7, "low_ablation_rate": 0.05}}"#).unwrap();

    let config = ExperimentConfig::load(file.path()).unwrap();
    assert_eq!(config.n_trials, 50);
    assert_eq!(config.seed, 7);
    assert_eq!(config.low_ablation_rate, 0.05);
    assert_eq!(
        config.high_ablation_rate,
        ExperimentConfig::default().high_ablation_rate
    );

    let mut bad = NamedTempFile::new().unwrap();
    writeln!(bad, r#"{{"high_ablation_rate": 1.5}}"#).unwrap();
    assert!(ExperimentConfig::load(bad.path()).is_err());
}

/// End-to-end run recovers a planted two-head circuit
#[test]
fn test_experiment_recovers_circuit() {
    let experiment = Experiment::new(TwoHeadCircuit, circuit_config());
    let results = experiment.run(&circuit_prompts()).unwrap();

    assert_eq!(results.n_prompts, 3);
    assert_eq!(results.n_rejected, 1);
    assert_eq!(results.importance.records.len(), 400);
    assert_eq!(results.exclusion.records.len(), 400);

    // Ablating a circuit head always breaks the task
    for head in CIRCUIT {
        assert_eq!(results.exclusion_penalties.get(head), Some(1.0));
        assert!(results.outliers.combined.contains(&head), "{head} missed");
    }

    let mut top_penalty: Vec<HeadId> = results
        .exclusion_penalties
        .top_k(2)
        .into_iter()
        .map(|(h, _)| h)
        .collect();
    top_penalty.sort();
    assert_eq!(top_penalty, CIRCUIT.to_vec());

    let mut top_importance: Vec<HeadId> = results
        .importance_scores
        .top_k(2)
        .into_iter()
        .map(|(h, _)| h)
        .collect();
    top_importance.sort();
    assert_eq!(top_importance, CIRCUIT.to_vec());

    let evals = &results.mask_evaluations;
    assert_eq!(evals.len(), 3);
    assert_eq!(evals[0].label, "outliers only");
    assert_eq!(evals[0].accuracy, 1.0);
    assert_eq!(evals[1].label, "outliers ablated");
    assert_eq!(evals[1].accuracy, 0.0);
    assert_eq!(evals[2].label, "full model");
    assert_eq!(evals[2].accuracy, 1.0);
    assert_eq!(evals[2].n_retained, 16);
}

/// Same seed, same trials
#[test]
fn test_experiment_is_reproducible() {
    let a = Experiment::new(TwoHeadCircuit, circuit_config())
        .run(&circuit_prompts())
        .unwrap();
    let b = Experiment::new(TwoHeadCircuit, circuit_config())
        .run(&circuit_prompts())
        .unwrap();

    assert_eq!(a.importance_scores, b.importance_scores);
    assert_eq!(a.exclusion_penalties, b.exclusion_penalties);
    assert_eq!(a.outliers.combined, b.outliers.combined);
}

/// A model that answers nothing leaves no prompts to score
#[test]
fn test_experiment_fails_without_prompts() {
    let prompts = PromptSet::new(vec![PromptPair::new("no pattern here", " ???")]);
    let experiment = Experiment::new(TwoHeadCircuit, circuit_config());
    assert!(experiment.run(&prompts).is_err());
}

/// Trial dump holds metadata and both phases' trials
#[test]
fn test_trial_dump() {
    let config = ExperimentConfig {
        n_trials: 25,
        ..circuit_config()
    };
    let experiment = Experiment::new(TwoHeadCircuit, config);
    let results = experiment.run(&circuit_prompts()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dumps").join("trials.json");
    write_dump(&results, experiment.config(), &path).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["metadata"]["model_id"], "synthetic/two-head-circuit");
    assert_eq!(json["metadata"]["n_layers"], 4);
    assert_eq!(json["metadata"]["config"]["seed"], 1234);

    let trials = json["trials"].as_array().unwrap();
    assert_eq!(trials.len(), 50);
    assert_eq!(trials[0]["phase"], "importance");
    assert_eq!(trials[49]["phase"], "exclusion");
    assert_eq!(trials[0]["evaluated"], 3);
}

#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    let model = HapiModel::from_pretrained_with_device("openai-community/gpt2", Some(true))
        .expect("Failed to load model");

    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.n_heads(), 12);
    assert_eq!(model.d_model(), 768);
}

#[test]
#[ignore = "requires model download"]
fn test_gpt2_completes_builtin_prompts() {
    let model = HapiModel::from_pretrained_with_device("openai-community/gpt2", Some(true))
        .expect("Failed to load model");

    let (kept, rejected) = PromptSet::builtin().filter_correct(&model).unwrap();
    assert!(!kept.is_empty());
    assert_eq!(kept.len() + rejected, PromptSet::builtin().len());

    // Removing every head destroys in-context copying
    let none = HeadMask::none(model.n_layers(), model.n_heads());
    let check = model.check_completion(&kept.pairs()[0], Some(&none)).unwrap();
    assert!(!check.correct);
}

#[test]
#[ignore = "requires model download"]
fn test_gpt2_has_induction_heads() {
    let model = HapiModel::from_pretrained_with_device("openai-community/gpt2", Some(true))
        .expect("Failed to load model");

    let mut rng = StdRng::seed_from_u64(0);
    let scores = induction::scan(&model, 30, 2, &mut rng).unwrap();
    assert!(scores.max() > 0.4);
    // Layer 0 has no earlier layer to build the previous-token signal
    assert!(scores.layer(0).iter().all(|&v| v < 0.4));
}
