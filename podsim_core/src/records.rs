//! Glucose and manual injection records.
//!
//! Both come as CSV files with an RFC 3339 `timestamp` column. Glucose rows
//! carry a sensor reading (`mgdl`), a manual meter reading (`mbg`), or both.
//! The series is resampled to one value per minute; short interior gaps are
//! bridged linearly, longer ones stay gaps.

use crate::series::{minute_of, TimeSeries};
use crate::types::ManualInjection;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Sensor readings outside this range are treated as errors, mg/dl
const VALID_GLUCOSE: std::ops::RangeInclusive<f64> = 40.0..=400.0;

#[derive(Debug, Deserialize)]
struct GlucoseRow {
    timestamp: String,
    #[serde(default)]
    mgdl: Option<f64>,
    #[serde(default)]
    mbg: Option<f64>,
}

impl GlucoseRow {
    /// Sensor reading, or the meter reading when manual entries count
    fn value(&self, include_manual: bool) -> Option<f64> {
        match (self.mgdl, self.mbg) {
            (Some(sensor), _) => Some(sensor),
            (None, Some(manual)) if include_manual => Some(manual),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InjectionRow {
    timestamp: String,
    units: f64,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid timestamp {:?}: {}", raw, e)))
}

/// Read glucose samples as a per-minute series
///
/// Samples in the same minute are averaged. Interior gaps of up to
/// `max_fill` minutes are interpolated. Meter readings are only used when
/// `include_manual` is set.
pub fn load_glucose(path: &Path, max_fill: usize, include_manual: bool) -> Result<TimeSeries<f64>> {
    if !path.exists() {
        tracing::info!("No glucose file at {:?}", path);
        return Ok(TimeSeries::empty(0));
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut minutes: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    let mut rejected = 0;
    for result in reader.deserialize::<GlucoseRow>() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!("Failed to deserialize glucose row: {}", e);
                continue;
            }
        };
        let at = match parse_timestamp(&row.timestamp) {
            Ok(at) => at,
            Err(e) => {
                tracing::warn!("Failed to parse glucose row: {}", e);
                continue;
            }
        };
        let Some(mgdl) = row.value(include_manual) else {
            continue;
        };
        if !VALID_GLUCOSE.contains(&mgdl) {
            rejected += 1;
            continue;
        }
        let slot = minutes.entry(minute_of(at)).or_insert((0.0, 0));
        slot.0 += mgdl;
        slot.1 += 1;
    }

    if rejected > 0 {
        tracing::debug!("Dropped {} out-of-range glucose readings", rejected);
    }

    let mut series = TimeSeries::empty(0);
    for (minute, (sum, count)) in &minutes {
        series.set(*minute, sum / *count as f64);
    }
    let series = fill_gaps(&series, max_fill);

    tracing::info!(
        "Loaded {} glucose minutes from {:?}",
        minutes.len(),
        path
    );
    Ok(series)
}

/// Linearly bridge interior gaps no longer than `max_fill` minutes
pub fn fill_gaps(series: &TimeSeries<f64>, max_fill: usize) -> TimeSeries<f64> {
    let mut values = series.values().to_vec();
    let mut previous: Option<usize> = None;

    for i in 0..values.len() {
        let Some(current) = values[i] else {
            continue;
        };
        if let Some(p) = previous {
            let gap = i - p - 1;
            if gap > 0 && gap <= max_fill {
                if let Some(before) = values[p] {
                    let step = (current - before) / (i - p) as f64;
                    for (k, slot) in values[p + 1..i].iter_mut().enumerate() {
                        *slot = Some(before + step * (k + 1) as f64);
                    }
                }
            }
        }
        previous = Some(i);
    }

    TimeSeries::from_options(series.start(), values)
}

/// Read manual injections, dropping non-positive doses
pub fn load_injections(path: &Path) -> Result<Vec<ManualInjection>> {
    if !path.exists() {
        tracing::info!("No injection file at {:?}", path);
        return Ok(Vec::new());
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut injections = Vec::new();
    for result in reader.deserialize::<InjectionRow>() {
        match result {
            Ok(row) if row.units > 0.0 => match parse_timestamp(&row.timestamp) {
                Ok(timestamp) => injections.push(ManualInjection {
                    timestamp,
                    units: row.units,
                }),
                Err(e) => tracing::warn!("Failed to parse injection row: {}", e),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to deserialize injection row: {}", e),
        }
    }

    injections.sort_by_key(|i| i.timestamp);
    tracing::info!("Loaded {} injections from {:?}", injections.len(), path);
    Ok(injections)
}

/// Keep the injections within `[from, to]`
pub fn injections_between(
    injections: &[ManualInjection],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<ManualInjection> {
    injections
        .iter()
        .filter(|i| i.timestamp >= from && i.timestamp <= to)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_glucose_resamples_and_fills() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_file(
            temp_dir.path(),
            "glucose.csv",
            "timestamp,mgdl\n\
             2024-03-01T10:00:10Z,100\n\
             2024-03-01T10:00:40Z,110\n\
             2024-03-01T10:04:00Z,125\n\
             2024-03-01T10:05:00Z,not-a-number\n\
             2024-03-01T10:06:00Z,20\n\
             2024-03-01T10:30:00Z,130\n",
        );

        let series = load_glucose(&path, 15, true).unwrap();
        let start = series.start();

        assert_eq!(series.get(start), Some(&105.0));
        // three missing minutes bridged towards 125
        assert_eq!(series.get(start + 1), Some(&110.0));
        assert_eq!(series.get(start + 3), Some(&120.0));
        assert_eq!(series.get(start + 4), Some(&125.0));
        // the 26 minute gap is too long to bridge
        assert_eq!(series.get(start + 10), None);
        assert_eq!(series.get(start + 30), Some(&130.0));
    }

    #[test]
    fn test_manual_entries_fill_sensor_gaps() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_file(
            temp_dir.path(),
            "glucose.csv",
            "timestamp,mgdl,mbg\n\
             2024-03-01T10:00:00Z,100,\n\
             2024-03-01T10:30:00Z,,140\n\
             2024-03-01T10:31:00Z,150,90\n\
             2024-03-01T11:00:00Z,120,\n",
        );

        let series = load_glucose(&path, 5, true).unwrap();
        let start = series.start();
        assert_eq!(series.get(start + 30), Some(&140.0));
        // the sensor wins when both are present
        assert_eq!(series.get(start + 31), Some(&150.0));

        let sensor_only = load_glucose(&path, 5, false).unwrap();
        assert_eq!(sensor_only.get(start + 30), None);
        assert_eq!(sensor_only.get(start + 31), Some(&150.0));
    }

    #[test]
    fn test_fill_gaps_leaves_edges() {
        let series = TimeSeries::from_options(0, vec![None, Some(1.0), None, Some(3.0), None]);
        let filled = fill_gaps(&series, 5);
        assert_eq!(
            filled.values(),
            &[None, Some(1.0), Some(2.0), Some(3.0), None]
        );
    }

    #[test]
    fn test_load_injections() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = write_file(
            temp_dir.path(),
            "injections.csv",
            "timestamp,units\n\
             2024-03-01T12:00:00Z,4.5\n\
             2024-03-01T08:00:00+02:00,2\n\
             2024-03-01T13:00:00Z,0\n\
             garbage,1\n",
        );

        let injections = load_injections(&path).unwrap();
        assert_eq!(injections.len(), 2);
        assert_eq!(injections[0].timestamp.to_rfc3339(), "2024-03-01T06:00:00+00:00");
        assert_eq!(injections[1].units, 4.5);

        let from = parse_timestamp("2024-03-01T11:00:00Z").unwrap();
        let to = parse_timestamp("2024-03-01T23:00:00Z").unwrap();
        assert_eq!(injections_between(&injections, from, to).len(), 1);
    }

    #[test]
    fn test_missing_files_are_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(load_glucose(&temp_dir.path().join("none.csv"), 15, true)
            .unwrap()
            .is_empty());
        assert!(load_injections(&temp_dir.path().join("none.csv"))
            .unwrap()
            .is_empty());
    }
}
