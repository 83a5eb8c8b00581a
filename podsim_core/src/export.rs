//! CSV export of the data model.
//!
//! The file is written to a temp file in the target directory, synced, and
//! renamed over the destination, so readers never see a partial export.

use crate::model::DataModel;
use crate::{Error, Result};
use fs2::FileExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Write one CSV row per model minute to `path`
pub fn write_model_csv(path: &Path, model: &DataModel) -> Result<usize> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let temp = NamedTempFile::new_in(parent)?;
    temp.as_file().lock_exclusive()?;

    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(true)
            .from_writer(temp.as_file());
        for row in &model.rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
    }

    temp.as_file().sync_all()?;
    temp.as_file().unlock()?;
    temp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::info!("Wrote {} model rows to {:?}", model.rows.len(), path);
    Ok(model.rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelRow, ModelWindow};
    use crate::series::minute_start;

    fn row(minute: i64, glucose: Option<f64>) -> ModelRow {
        ModelRow {
            timestamp: minute_start(minute),
            glucose,
            glucose_rate: None,
            glucose_acceleration: None,
            infusion_rate: Some(1.0),
            bolus: None,
            infusion_total: 0.5,
            absorbed_total: 0.25,
            plasma: 0.01,
            hepatic: 0.0,
            interstitial: 0.0,
            liver_bound: 0.0,
            peripheral_bound: 0.0,
            insulin_on_board: 0.01,
            effect: None,
            effect_forecast: Some(-0.5),
        }
    }

    #[test]
    fn test_write_model_csv() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out").join("model.csv");
        let model = DataModel {
            window: ModelWindow {
                start: 28_000_000,
                now: 28_000_001,
                end: 28_000_001,
            },
            rows: vec![row(28_000_000, Some(110.0)), row(28_000_001, None)],
            effect_floor: -0.5,
        };

        let written = write_model_csv(&path, &model).unwrap();
        assert_eq!(written, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,glucose,glucose_rate"));
        assert!(lines[1].contains(",110.0,"));
        assert!(lines[2].ends_with(",-0.5"));
    }

    #[test]
    fn test_export_replaces_existing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("model.csv");
        std::fs::write(&path, "stale contents that are longer than the export\n".repeat(50))
            .unwrap();

        let model = DataModel {
            window: ModelWindow {
                start: 0,
                now: 0,
                end: 0,
            },
            rows: vec![row(0, None)],
            effect_floor: 0.0,
        };
        write_model_csv(&path, &model).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("stale"));
        assert_eq!(contents.lines().count(), 2);
    }
}
