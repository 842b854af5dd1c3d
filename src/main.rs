use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use outcome_engine::commands::{explain, train, InputArgs};
use outcome_engine::config::PipelineConfig;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

const SETTINGS_ENV_PREFIX: &str = "OUTCOME_ENGINE_";
const DEFAULT_MODEL_PATH: &str = "outcome_model.txt";

#[derive(Parser)]
#[command(name = "outcome-engine")]
#[command(about = "Train and explain outcome models from per-entity performance records")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Engineer features, select, search hyperparameters and train a model
    Train {
        #[command(flatten)]
        input: InputArgs,
        /// Destination for the trained model text
        #[arg(long, value_name = "PATH", default_value = DEFAULT_MODEL_PATH)]
        model_out: PathBuf,
        /// Destination for the augmented dataset with predicted outcomes
        #[arg(long, value_name = "PATH")]
        predictions_out: Option<PathBuf>,
        /// Number of features to keep
        #[arg(long = "features")]
        selected_feature_count: Option<usize>,
        /// Hyperparameter search iterations
        #[arg(long)]
        iterations: Option<usize>,
        /// Cross-validation folds
        #[arg(long)]
        folds: Option<usize>,
        /// Fraction of rows held out for evaluation (0..1)
        #[arg(long)]
        holdout: Option<f64>,
        /// Random seed
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Print per-feature attributions for the most recent rows of a dataset
    Explain {
        #[command(flatten)]
        input: InputArgs,
        /// Trained model text
        #[arg(long, value_name = "PATH", default_value = DEFAULT_MODEL_PATH)]
        model: PathBuf,
        /// Only explain rows of this entity
        #[arg(long)]
        entity: Option<String>,
        /// Number of most recent rows to explain
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = PipelineConfig::from_settings_map(&settings_from_env())?;

    match cli.command {
        Commands::Train {
            input,
            model_out,
            predictions_out,
            selected_feature_count,
            iterations,
            folds,
            holdout,
            seed,
        } => {
            info!("Starting outcome-engine train");
            let overrides = train::TrainOverrides {
                selected_feature_count,
                search_iterations: iterations,
                cv_folds: folds,
                holdout_fraction: holdout,
                seed,
            };
            train::run(config, &input, &overrides, &model_out, predictions_out)?;
        }
        Commands::Explain {
            input,
            model,
            entity,
            limit,
        } => {
            info!("Starting outcome-engine explain");
            explain::run(config.features, &input, &model, entity.as_deref(), limit)?;
        }
    }

    Ok(())
}

/// Settings keys come from `OUTCOME_ENGINE_*` variables with the prefix
/// stripped, e.g. `OUTCOME_ENGINE_CV_FOLDS=5`.
fn settings_from_env() -> HashMap<String, String> {
    env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(SETTINGS_ENV_PREFIX)
                .map(|name| (name.to_string(), value))
        })
        .collect()
}
