use crate::error::{PipelineError, Result};
use crate::search_space::{IntRange, LogRange, SearchSpace};
use std::collections::HashMap;
use std::time::Duration;

/// Which records a rolling window covers relative to the current row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowAlignment {
    /// The W most recent records up to and including the current one.
    #[default]
    Inclusive,
    /// The W records strictly before the current one.
    Exclusive,
}

impl WindowAlignment {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "inclusive" => Ok(Self::Inclusive),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(invalid(format!(
                "ROLLING_ALIGNMENT must be INCLUSIVE or EXCLUSIVE (value: {})",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Inclusive => "inclusive",
            Self::Exclusive => "exclusive",
        }
    }
}

/// Series a streak counter runs over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreakSource {
    Outcome,
    Field(String),
}

impl StreakSource {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("STREAK_SOURCE must not be empty".to_string()));
        }
        if trimmed.eq_ignore_ascii_case("outcome") {
            Ok(Self::Outcome)
        } else {
            Ok(Self::Field(trimmed.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Outcome => "outcome",
            Self::Field(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchObjective {
    #[default]
    Accuracy,
    LogLoss,
}

impl SearchObjective {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accuracy" => Ok(Self::Accuracy),
            "logloss" | "log_loss" => Ok(Self::LogLoss),
            other => Err(invalid(format!(
                "SEARCH_OBJECTIVE must be ACCURACY or LOG_LOSS (value: {})",
                other
            ))),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::LogLoss => "negative log-loss",
        }
    }
}

/// Feature Engineer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub window: usize,
    /// Statistic columns to aggregate; empty means every statistic column.
    pub rolling_fields: Vec<String>,
    pub alignment: WindowAlignment,
    pub streak: Option<StreakSource>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window: 5,
            rolling_fields: Vec::new(),
            alignment: WindowAlignment::Inclusive,
            streak: None,
        }
    }
}

/// Parameters for one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub features: FeatureConfig,
    pub selected_feature_count: usize,
    pub selector_trees: usize,
    pub search_iterations: usize,
    pub initial_points: usize,
    pub cv_folds: usize,
    pub objective: SearchObjective,
    pub boosting_rounds: usize,
    pub holdout_fraction: f64,
    pub seed: u64,
    pub search_time_budget: Option<Duration>,
    pub search_space: SearchSpace,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            selected_feature_count: 10,
            selector_trees: 100,
            search_iterations: 20,
            initial_points: 10,
            cv_folds: 3,
            objective: SearchObjective::Accuracy,
            boosting_rounds: 100,
            holdout_fraction: 0.2,
            seed: 42,
            search_time_budget: None,
            search_space: SearchSpace::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.features.window == 0 {
            return Err(invalid("ROLLING_WINDOW must be >= 1".to_string()));
        }
        if self.selected_feature_count == 0 {
            return Err(invalid("SELECTED_FEATURE_COUNT must be >= 1".to_string()));
        }
        if self.selector_trees == 0 {
            return Err(invalid("SELECTOR_TREES must be >= 1".to_string()));
        }
        if self.search_iterations == 0 {
            return Err(invalid("SEARCH_ITERATIONS must be >= 1".to_string()));
        }
        if self.cv_folds < 2 {
            return Err(invalid(format!(
                "CV_FOLDS must be >= 2 (value: {})",
                self.cv_folds
            )));
        }
        if self.boosting_rounds == 0 {
            return Err(invalid("BOOSTING_ROUNDS must be >= 1".to_string()));
        }
        if !(self.holdout_fraction > 0.0 && self.holdout_fraction < 1.0) {
            return Err(invalid(format!(
                "HOLDOUT_FRACTION must be in (0, 1) (value: {})",
                self.holdout_fraction
            )));
        }
        self.search_space.validate()
    }

    /// Builds a configuration from upper-case settings keys. Absent or blank
    /// keys keep their defaults.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let window = optional_setting_usize(settings, "ROLLING_WINDOW", 1)?
            .unwrap_or(defaults.features.window);
        let rolling_fields = optional_setting(settings, "ROLLING_FIELDS")
            .map(parse_name_list)
            .unwrap_or_default();
        let alignment = optional_setting(settings, "ROLLING_ALIGNMENT")
            .map(WindowAlignment::parse)
            .transpose()?
            .unwrap_or_default();
        let streak = optional_setting(settings, "STREAK_SOURCE")
            .map(StreakSource::parse)
            .transpose()?;

        let selected_feature_count = optional_setting_usize(settings, "SELECTED_FEATURE_COUNT", 1)?
            .unwrap_or(defaults.selected_feature_count);
        let selector_trees = optional_setting_usize(settings, "SELECTOR_TREES", 1)?
            .unwrap_or(defaults.selector_trees);
        let search_iterations = optional_setting_usize(settings, "SEARCH_ITERATIONS", 1)?
            .unwrap_or(defaults.search_iterations);
        let initial_points = optional_setting_usize(settings, "SEARCH_INITIAL_POINTS", 1)?
            .unwrap_or(defaults.initial_points);
        let cv_folds =
            optional_setting_usize(settings, "CV_FOLDS", 2)?.unwrap_or(defaults.cv_folds);
        let objective = optional_setting(settings, "SEARCH_OBJECTIVE")
            .map(SearchObjective::parse)
            .transpose()?
            .unwrap_or_default();
        let boosting_rounds = optional_setting_usize(settings, "BOOSTING_ROUNDS", 1)?
            .unwrap_or(defaults.boosting_rounds);
        let holdout_fraction =
            optional_setting_f64(settings, "HOLDOUT_FRACTION", Some(0.0), Some(1.0))?
                .unwrap_or(defaults.holdout_fraction);
        let seed = optional_setting_usize(settings, "RANDOM_SEED", 0)?
            .map(|value| value as u64)
            .unwrap_or(defaults.seed);
        let search_time_budget =
            optional_setting_f64(settings, "SEARCH_TIME_BUDGET_SECS", Some(0.0), None)?
                .map(|secs| {
                    Duration::try_from_secs_f64(secs).map_err(|_| {
                        invalid(format!(
                            "Setting SEARCH_TIME_BUDGET_SECS is too large (value: {})",
                            secs
                        ))
                    })
                })
                .transpose()?;

        let search_space = SearchSpace {
            max_depth: IntRange {
                min: optional_setting_usize(settings, "MAX_DEPTH_MIN", 1)?
                    .unwrap_or(defaults.search_space.max_depth.min),
                max: optional_setting_usize(settings, "MAX_DEPTH_MAX", 1)?
                    .unwrap_or(defaults.search_space.max_depth.max),
            },
            learning_rate: LogRange {
                min: optional_setting_f64(settings, "LEARNING_RATE_MIN", Some(0.0), None)?
                    .unwrap_or(defaults.search_space.learning_rate.min),
                max: optional_setting_f64(settings, "LEARNING_RATE_MAX", Some(0.0), None)?
                    .unwrap_or(defaults.search_space.learning_rate.max),
            },
        };

        let config = Self {
            features: FeatureConfig {
                window,
                rolling_fields,
                alignment,
                streak,
            },
            selected_feature_count,
            selector_trees,
            search_iterations,
            initial_points,
            cv_folds,
            objective,
            boosting_rounds,
            holdout_fraction,
            seed,
            search_time_budget,
            search_space,
        };
        config.validate()?;
        Ok(config)
    }
}

fn invalid(message: String) -> PipelineError {
    PipelineError::InvalidConfiguration(message)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn parse_name_list(raw: &str) -> Vec<String> {
    raw.trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| invalid(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() {
        return Err(invalid(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(invalid(format!(
                "Setting {} must be >= {} (value: {})",
                key, min_value, raw
            )));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(invalid(format!(
                "Setting {} must be <= {} (value: {})",
                key, max_value, raw
            )));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| invalid(format!("Setting {} must be a number (value: {})", key, raw)))?;
    if !value.is_finite() {
        return Err(invalid(format!(
            "Setting {} must be finite (value: {})",
            key, raw
        )));
    }
    if value.fract() != 0.0 {
        return Err(invalid(format!(
            "Setting {} must be an integer (value: {})",
            key, raw
        )));
    }
    if value < min as f64 {
        return Err(invalid(format!(
            "Setting {} must be >= {} (value: {})",
            key, min, raw
        )));
    }
    Ok(Some(value as usize))
}
