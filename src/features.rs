use crate::config::{FeatureConfig, StreakSource};
use crate::error::{PipelineError, Result};
use crate::indicators::{rolling_mean, streak_lengths};
use crate::models::{FeatureFrame, FeatureRow, RecordTable};
use log::{debug, info};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Turns raw records into causal feature rows.
///
/// Each output row carries the record's statistic values followed by one
/// rolling mean per configured field and, when configured, a streak counter.
/// Rows whose engineered values are undefined are dropped.
pub struct FeatureEngineer {
    config: FeatureConfig,
}

enum StreakSeries {
    Outcome,
    Column(usize),
}

impl FeatureEngineer {
    pub fn new(config: FeatureConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn transform(&self, table: &RecordTable) -> Result<FeatureFrame> {
        if table.is_empty() {
            return Err(PipelineError::DataUnavailable(
                "input table has no records".to_string(),
            ));
        }

        let rolling_indices = self.rolling_indices(table)?;
        let streak = self.streak_series(table)?;

        let mut columns = table.columns.clone();
        for &index in &rolling_indices {
            columns.push(format!(
                "{}_rolling_mean_{}",
                table.columns[index], self.config.window
            ));
        }
        if let Some(source) = &self.config.streak {
            columns.push(format!("{}_streak", source.name()));
        }

        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (index, record) in table.records.iter().enumerate() {
            groups.entry(record.entity.as_str()).or_default().push(index);
        }
        let groups: Vec<(&str, Vec<usize>)> = groups.into_iter().collect();

        let per_entity: Vec<Vec<FeatureRow>> = groups
            .par_iter()
            .map(|(entity, indices)| {
                self.engineer_entity(table, entity, indices, &rolling_indices, streak.as_ref())
            })
            .collect();

        let rows: Vec<FeatureRow> = per_entity.into_iter().flatten().collect();
        info!(
            "Engineered {} feature rows ({} columns) from {} records across {} entities",
            rows.len(),
            columns.len(),
            table.records.len(),
            groups.len()
        );

        Ok(FeatureFrame { columns, rows })
    }

    fn rolling_indices(&self, table: &RecordTable) -> Result<Vec<usize>> {
        if self.config.rolling_fields.is_empty() {
            return Ok((0..table.columns.len()).collect());
        }
        self.config
            .rolling_fields
            .iter()
            .map(|field| {
                table.column_index(field).ok_or_else(|| {
                    PipelineError::FeatureDeficiency(format!(
                        "rolling field {} is not a statistic column",
                        field
                    ))
                })
            })
            .collect()
    }

    fn streak_series(&self, table: &RecordTable) -> Result<Option<StreakSeries>> {
        match &self.config.streak {
            None => Ok(None),
            Some(StreakSource::Outcome) => Ok(Some(StreakSeries::Outcome)),
            Some(StreakSource::Field(field)) => table
                .column_index(field)
                .map(|index| Some(StreakSeries::Column(index)))
                .ok_or_else(|| {
                    PipelineError::FeatureDeficiency(format!(
                        "streak field {} is not a statistic column",
                        field
                    ))
                }),
        }
    }

    fn engineer_entity(
        &self,
        table: &RecordTable,
        entity: &str,
        indices: &[usize],
        rolling_indices: &[usize],
        streak: Option<&StreakSeries>,
    ) -> Vec<FeatureRow> {
        let mut ordered = indices.to_vec();
        ordered.sort_by_key(|&index| table.records[index].timestamp);
        let records: Vec<_> = ordered.iter().map(|&index| &table.records[index]).collect();

        let rolling: Vec<Vec<Option<f64>>> = rolling_indices
            .iter()
            .map(|&column| {
                let series: Vec<f64> = records.iter().map(|record| record.values[column]).collect();
                rolling_mean(&series, self.config.window, self.config.alignment)
            })
            .collect();

        let streaks = streak.map(|series| match series {
            StreakSeries::Outcome => {
                let labels: Vec<&str> = records.iter().map(|r| r.outcome.as_str()).collect();
                streak_lengths(&labels)
            }
            StreakSeries::Column(column) => {
                let values: Vec<f64> = records.iter().map(|r| r.values[*column]).collect();
                streak_lengths(&values)
            }
        });

        let mut rows = Vec::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            let mut values = record.values.clone();
            let mut complete = true;
            for series in &rolling {
                match series[position] {
                    Some(mean) => values.push(mean),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            if let Some(lengths) = &streaks {
                values.push(f64::from(lengths[position]));
            }
            if values.iter().any(|value| !value.is_finite()) {
                continue;
            }
            rows.push(FeatureRow {
                entity: record.entity.clone(),
                timestamp: record.timestamp,
                source_index: ordered[position],
                values,
                outcome: record.outcome.clone(),
            });
        }

        debug!(
            "Entity {}: kept {} of {} records",
            entity,
            rows.len(),
            records.len()
        );
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowAlignment;
    use crate::models::Record;
    use chrono::{Duration, TimeZone, Utc};

    fn table(entities: &[&str], goals: &[f64], outcomes: &[&str]) -> RecordTable {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut records = Vec::new();
        for entity in entities {
            for (day, (goal, outcome)) in goals.iter().zip(outcomes).enumerate() {
                records.push(Record {
                    entity: entity.to_string(),
                    timestamp: start + Duration::days(day as i64),
                    values: vec![*goal],
                    outcome: outcome.to_string(),
                });
            }
        }
        RecordTable::new(vec!["goals".to_string()], records).expect("table")
    }

    fn config(window: usize, streak: Option<StreakSource>) -> FeatureConfig {
        FeatureConfig {
            window,
            rolling_fields: Vec::new(),
            alignment: WindowAlignment::Inclusive,
            streak,
        }
    }

    #[test]
    fn drops_rows_with_incomplete_window() {
        let table = table(
            &["a", "b"],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            &["W", "L", "W", "L", "W", "L"],
        );
        let frame = FeatureEngineer::new(config(3, None))
            .transform(&table)
            .expect("frame");

        assert_eq!(frame.columns, vec!["goals", "goals_rolling_mean_3"]);
        assert_eq!(frame.len(), 8);
        let a_means: Vec<f64> = frame
            .rows
            .iter()
            .filter(|row| row.entity == "a")
            .map(|row| row.values[1])
            .collect();
        assert_eq!(a_means, vec![2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn streak_counts_outcome_runs() {
        let table = table(
            &["a"],
            &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
            &["W", "W", "L", "W", "W", "W"],
        );
        let frame = FeatureEngineer::new(config(1, Some(StreakSource::Outcome)))
            .transform(&table)
            .expect("frame");
        let streaks: Vec<f64> = frame.rows.iter().map(|row| row.values[2]).collect();
        assert_eq!(streaks, vec![1.0, 2.0, 1.0, 1.0, 2.0, 3.0]);
        assert_eq!(frame.columns[2], "outcome_streak");
    }

    #[test]
    fn streak_counts_runs_of_a_statistic_column() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let wins = [1.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let records = wins
            .iter()
            .enumerate()
            .map(|(day, &win)| Record {
                entity: "a".to_string(),
                timestamp: start + Duration::days(day as i64),
                values: vec![2.0, win],
                outcome: if win > 0.0 { "W" } else { "L" }.to_string(),
            })
            .collect();
        let table =
            RecordTable::new(vec!["goals".to_string(), "win".to_string()], records).expect("table");

        let frame = FeatureEngineer::new(config(1, Some(StreakSource::Field("win".to_string()))))
            .transform(&table)
            .expect("frame");
        assert_eq!(frame.columns.last().map(String::as_str), Some("win_streak"));
        let streaks: Vec<f64> = frame
            .rows
            .iter()
            .map(|row| row.values[frame.columns.len() - 1])
            .collect();
        assert_eq!(streaks, vec![1.0, 2.0, 1.0, 2.0, 3.0, 1.0]);
    }

    #[test]
    fn unknown_streak_field_is_deficient() {
        let table = table(&["a"], &[1.0, 2.0], &["W", "L"]);
        let err = FeatureEngineer::new(config(1, Some(StreakSource::Field("win".to_string()))))
            .transform(&table)
            .expect_err("unknown streak field");
        assert!(matches!(err, PipelineError::FeatureDeficiency(_)));
    }

    #[test]
    fn unordered_input_is_sorted_per_entity() {
        let mut table = table(&["a"], &[1.0, 2.0, 3.0, 4.0], &["W", "L", "W", "L"]);
        table.records.reverse();
        let frame = FeatureEngineer::new(config(2, None))
            .transform(&table)
            .expect("frame");
        let means: Vec<f64> = frame.rows.iter().map(|row| row.values[1]).collect();
        assert_eq!(means, vec![1.5, 2.5, 3.5]);
        assert!(frame
            .rows
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn rolling_value_ignores_later_records() {
        let base = table(&["a"], &[1.0, 2.0, 3.0, 4.0, 5.0], &["W"; 5]);
        let mut perturbed = base.clone();
        perturbed.records[4].values[0] = 500.0;

        let engineer = FeatureEngineer::new(config(2, Some(StreakSource::Outcome)));
        let before = engineer.transform(&base).expect("base");
        let after = engineer.transform(&perturbed).expect("perturbed");

        for (left, right) in before.rows.iter().zip(&after.rows).take(3) {
            assert_eq!(left.values, right.values);
        }
    }

    #[test]
    fn empty_table_is_unavailable() {
        let err = FeatureEngineer::new(FeatureConfig::default())
            .transform(&RecordTable::default())
            .expect_err("empty");
        assert!(matches!(err, PipelineError::DataUnavailable(_)));
    }

    #[test]
    fn unknown_rolling_field_is_deficient() {
        let table = table(&["a"], &[1.0, 2.0], &["W", "L"]);
        let mut cfg = config(1, None);
        cfg.rolling_fields = vec!["assists".to_string()];
        let err = FeatureEngineer::new(cfg)
            .transform(&table)
            .expect_err("unknown field");
        assert!(matches!(err, PipelineError::FeatureDeficiency(_)));
    }
}
