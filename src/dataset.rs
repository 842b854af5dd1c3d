//! Delimited-file ingestion and the augmented prediction output.

use crate::error::{PipelineError, Result};
use crate::models::{PredictedRow, Record, RecordTable};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Column roles in an input file.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSchema {
    pub entity_column: String,
    pub timestamp_column: String,
    pub outcome_column: String,
    /// Explicit statistic columns; `None` takes every other numeric column.
    pub stat_columns: Option<Vec<String>>,
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            entity_column: "team".to_string(),
            timestamp_column: "match_date".to_string(),
            outcome_column: "outcome".to_string(),
            stat_columns: None,
        }
    }
}

pub fn load_records(path: &Path, schema: &InputSchema) -> Result<RecordTable> {
    if !path.exists() {
        return Err(PipelineError::DataUnavailable(format!(
            "input file {} does not exist",
            path.display()
        )));
    }
    let file = File::open(path)?;
    let table = read_records(BufReader::new(file), schema)?;
    info!(
        "Loaded {} records with {} statistic columns from {}",
        table.records.len(),
        table.columns.len(),
        path.display()
    );
    Ok(table)
}

pub fn read_records<R: Read>(reader: R, schema: &InputSchema) -> Result<RecordTable> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| PipelineError::DataUnavailable(format!("unreadable header: {}", err)))?
        .iter()
        .map(str::to_string)
        .collect();
    let position = |name: &str| {
        headers.iter().position(|header| header == name).ok_or_else(|| {
            PipelineError::DataUnavailable(format!("input has no column named {}", name))
        })
    };
    let entity_idx = position(schema.entity_column.as_str())?;
    let timestamp_idx = position(schema.timestamp_column.as_str())?;
    let outcome_idx = position(schema.outcome_column.as_str())?;

    let mut rows: Vec<csv::StringRecord> = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|err| {
            PipelineError::DataUnavailable(format!("malformed input row: {}", err))
        })?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(PipelineError::DataUnavailable(
            "input contains a header but no data rows".to_string(),
        ));
    }

    let stat_indices: Vec<usize> = match &schema.stat_columns {
        Some(columns) => columns
            .iter()
            .map(|column| position(column.as_str()))
            .collect::<Result<_>>()?,
        None => (0..headers.len())
            .filter(|&idx| idx != entity_idx && idx != timestamp_idx && idx != outcome_idx)
            .filter(|&idx| is_numeric_column(&rows, idx))
            .collect(),
    };
    let columns: Vec<String> = stat_indices.iter().map(|&idx| headers[idx].clone()).collect();
    debug!("Statistic columns: {}", columns.join(", "));

    let mut records = Vec::with_capacity(rows.len());
    for (line, row) in rows.iter().enumerate() {
        // Header is line 1.
        let line = line + 2;
        let cell = |idx: usize| row.get(idx).unwrap_or("");

        let entity = cell(entity_idx);
        if entity.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "row {} has an empty {}",
                line, schema.entity_column
            )));
        }
        let outcome = cell(outcome_idx);
        if outcome.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "row {} has an empty {}",
                line, schema.outcome_column
            )));
        }
        let timestamp = parse_timestamp(cell(timestamp_idx)).ok_or_else(|| {
            PipelineError::DataUnavailable(format!(
                "row {} has an unparsable {}: {:?}",
                line,
                schema.timestamp_column,
                cell(timestamp_idx)
            ))
        })?;

        let mut values = Vec::with_capacity(stat_indices.len());
        for &idx in &stat_indices {
            let raw = cell(idx);
            let value = if raw.is_empty() {
                f64::NAN
            } else {
                raw.parse::<f64>().map_err(|_| {
                    PipelineError::DataUnavailable(format!(
                        "row {} column {} is not numeric: {:?}",
                        line, headers[idx], raw
                    ))
                })?
            };
            values.push(value);
        }

        records.push(Record {
            entity: entity.to_string(),
            timestamp,
            values,
            outcome: outcome.to_string(),
        });
    }

    RecordTable::new(columns, records)
}

fn is_numeric_column(rows: &[csv::StringRecord], idx: usize) -> bool {
    let mut seen = false;
    for row in rows {
        match row.get(idx) {
            Some("") | None => {}
            Some(raw) => {
                if raw.parse::<f64>().is_err() {
                    return false;
                }
                seen = true;
            }
        }
    }
    seen
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD` (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(parsed.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

/// Writes the augmented dataset, one line per predicted row.
pub fn write_predictions(path: &Path, rows: &[PredictedRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Wrote {} predicted rows to {}", rows.len(), path.display());
    Ok(())
}
