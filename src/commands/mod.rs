pub mod explain;
pub mod train;

use crate::config::{FeatureConfig, StreakSource, WindowAlignment};
use crate::dataset::InputSchema;
use crate::error::Result;
use clap::Args;
use std::path::PathBuf;

/// Input file and feature-engineering flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct InputArgs {
    /// Delimited input file with one record per line
    #[arg(short, long, value_name = "PATH")]
    pub input: PathBuf,
    /// Column holding the entity (team or player) identifier
    #[arg(long, default_value = "team")]
    pub entity_column: String,
    /// Column holding the record timestamp
    #[arg(long, default_value = "match_date")]
    pub timestamp_column: String,
    /// Column holding the outcome label
    #[arg(long, default_value = "outcome")]
    pub outcome_column: String,
    /// Statistic columns to read (defaults to every numeric column)
    #[arg(long, value_delimiter = ',')]
    pub stat_columns: Vec<String>,
    /// Rolling window size
    #[arg(long)]
    pub window: Option<usize>,
    /// Statistic columns to aggregate over the rolling window
    #[arg(long, value_delimiter = ',')]
    pub rolling_fields: Vec<String>,
    /// Rolling window alignment (inclusive or exclusive)
    #[arg(long)]
    pub alignment: Option<String>,
    /// Streak source: "outcome" or a statistic column
    #[arg(long)]
    pub streak_source: Option<String>,
}

impl InputArgs {
    pub fn schema(&self) -> InputSchema {
        InputSchema {
            entity_column: self.entity_column.clone(),
            timestamp_column: self.timestamp_column.clone(),
            outcome_column: self.outcome_column.clone(),
            stat_columns: if self.stat_columns.is_empty() {
                None
            } else {
                Some(self.stat_columns.clone())
            },
        }
    }

    /// Overrides `features` with any flags that were given.
    pub fn apply(&self, features: &mut FeatureConfig) -> Result<()> {
        if let Some(window) = self.window {
            features.window = window;
        }
        if !self.rolling_fields.is_empty() {
            features.rolling_fields = self.rolling_fields.clone();
        }
        if let Some(alignment) = &self.alignment {
            features.alignment = WindowAlignment::parse(alignment)?;
        }
        if let Some(source) = &self.streak_source {
            features.streak = Some(StreakSource::parse(source)?);
        }
        Ok(())
    }
}
