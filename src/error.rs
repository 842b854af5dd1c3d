use thiserror::Error;

/// Failures surfaced by the pipeline to its caller.
///
/// The first five variants are the stage-level failure kinds a boundary layer
/// is expected to translate; the rest describe configuration, I/O and
/// internal fitting problems.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input data unavailable: {0}")]
    DataUnavailable(String),

    #[error("insufficient features: {0}")]
    FeatureDeficiency(String),

    #[error("hyperparameter search exhausted: {0}")]
    OptimizationExhausted(String),

    #[error("training data insufficient: {0}")]
    TrainingDataInsufficient(String),

    #[error("explanation unavailable: {0}")]
    ExplanationUnavailable(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("pipeline cancelled before {stage}")]
    Cancelled { stage: &'static str },

    #[error("model fit failed: {0}")]
    FitFailed(String),

    #[error("invalid model text: {0}")]
    ModelFormat(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
