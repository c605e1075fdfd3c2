//! HAPI-rs CLI: Head Ablation Probing for Induction

use anyhow::Result;
use clap::Parser;
use hapi_rs::{induction, print_summary, write_dump, Experiment, ExperimentConfig, HapiModel};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "hapi-rs")]
#[command(about = "Monte Carlo head ablation probing for induction circuits")]
#[command(version)]
struct Cli {
    /// JSON experiment config; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace` (e.g., "openai-community/gpt2")
    #[arg(short, long)]
    model: Option<String>,

    /// Path to prompts JSON file (default: built-in prompts)
    #[arg(short, long)]
    prompts: Option<PathBuf>,

    /// Trials per phase
    #[arg(short = 'n', long)]
    trials: Option<usize>,

    /// Ablation rate of the importance phase
    #[arg(long)]
    high_rate: Option<f64>,

    /// Ablation rate of the exclusion phase
    #[arg(long)]
    low_rate: Option<f64>,

    /// Outlier percentile (0-100)
    #[arg(long)]
    percentile: Option<f64>,

    /// Minimum per-trial accuracy counted as a success
    #[arg(long)]
    success_threshold: Option<f64>,

    /// Prompts scored per trial (default: all)
    #[arg(long)]
    prompts_per_trial: Option<usize>,

    /// Random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Output directory for the results JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write every trial record to this JSON file
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Skip the heatmaps in the summary
    #[arg(long)]
    no_heatmaps: bool,

    /// Also run the attention-pattern induction scan
    #[arg(long)]
    induction_scan: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn experiment_config(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model_id.clone_from(model);
        }
        if let Some(prompts) = &self.prompts {
            config.prompts_path = Some(prompts.clone());
        }
        if let Some(n) = self.trials {
            config.n_trials = n;
        }
        if let Some(rate) = self.high_rate {
            config.high_ablation_rate = rate;
        }
        if let Some(rate) = self.low_rate {
            config.low_ablation_rate = rate;
        }
        if let Some(p) = self.percentile {
            config.percentile = p;
        }
        if let Some(t) = self.success_threshold {
            config.success_threshold = t;
        }
        if let Some(k) = self.prompts_per_trial {
            config.prompts_per_trial = Some(k);
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(dump) = &self.dump {
            config.dump_path = Some(dump.clone());
        }
        if self.no_heatmaps {
            config.show_heatmaps = false;
        }
        if self.induction_scan {
            config.induction_scan = true;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.experiment_config()?;

    println!("=== HAPI-rs: Head Ablation Probing for Induction ===");
    println!("Model:   {}", config.model_id);
    match &config.prompts_path {
        Some(path) => println!("Prompts: {}", path.display()),
        None => println!("Prompts: built-in"),
    }
    println!(
        "Trials:  {} per phase (rates {:.2} / {:.2}), seed {}",
        config.n_trials, config.high_ablation_rate, config.low_ablation_rate, config.seed
    );
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    // Load model
    info!("Loading model...");
    let mut model = HapiModel::from_pretrained_with_device(&config.model_id, Some(cli.cpu))?;
    model.set_prepend_bos(config.prepend_bos);
    info!(
        "Model: {} layers x {} heads, {} hidden",
        model.n_layers(),
        model.n_heads(),
        model.d_model()
    );

    let prompts = config.load_prompts()?;
    info!("Prompts: {} pairs", prompts.len());

    // Run experiment
    let experiment = Experiment::new(model, config);
    let mut results = experiment.run(&prompts)?;
    let config = experiment.config();

    if config.induction_scan {
        let mut rng = StdRng::seed_from_u64(config.seed);
        results.induction_scores = Some(induction::scan(
            experiment.evaluator(),
            config.induction_half_len,
            config.induction_sequences,
            &mut rng,
        )?);
    }

    print_summary(&results, config.show_heatmaps);

    if let Some(path) = &config.dump_path {
        write_dump(&results, config, path)?;
    }

    // Save results
    if let Some(output) = &cli.output {
        std::fs::create_dir_all(output)?;
        let results_path = output.join("hapi_results.json");
        std::fs::write(&results_path, serde_json::to_string_pretty(&results)?)?;
        info!("Results saved to {}", results_path.display());
    }

    Ok(())
}
