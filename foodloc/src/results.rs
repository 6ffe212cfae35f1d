//! JSON crop list written by `localize` and read back by `evaluate`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::crop::{BestCrop, CropRect};

/// Winning scale of the ensemble for one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSummary {
    pub factor: f64,
    pub heat_h: usize,
    pub heat_w: usize,
    pub crop_row: usize,
    pub crop_col: usize,
    pub score: f32,
    pub agreement: usize,
    #[serde(default)]
    pub per_model_agreement: Vec<bool>,
}

/// Localization result of one dataset image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRecord {
    pub filename: PathBuf,
    pub label: String,
    pub ensemble: EnsembleSummary,
    pub rect: CropRect,
    pub in_bounds: bool,
}

impl CropRecord {
    pub fn new(filename: PathBuf, label: String, best: &BestCrop, in_bounds: bool) -> Self {
        let candidate = &best.candidate;
        Self {
            filename,
            label,
            ensemble: EnsembleSummary {
                factor: candidate.scale_factor,
                heat_h: candidate.heatmap_shape.0,
                heat_w: candidate.heatmap_shape.1,
                crop_row: candidate.best_cell.0,
                crop_col: candidate.best_cell.1,
                score: candidate.aggregate_score,
                agreement: candidate.agreement_count,
                per_model_agreement: candidate.per_model_agreement.clone(),
            },
            rect: best.rect,
            in_bounds,
        }
    }
}

/// Write records as pretty-printed JSON, creating parent directories.
pub fn write_records(path: &Path, records: &[CropRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(records).context("Failed to serialize crop records")?;
    fs::write(path, json)
        .with_context(|| format!("Failed to write crop records: {}", path.display()))?;
    Ok(())
}

pub fn read_records(path: &Path) -> Result<Vec<CropRecord>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read crop records: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse crop records: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localization::ScaleCandidate;
    use tempfile::tempdir;

    fn best_crop() -> BestCrop {
        BestCrop {
            candidate: ScaleCandidate {
                scale_factor: 0.8848,
                heatmap_shape: (6, 2),
                best_cell: (3, 1),
                aggregate_score: 0.71,
                agreement_count: 3,
                per_model_agreement: vec![true, true, false, true],
            },
            rect: CropRect {
                top: 108,
                left: 36,
                side: 333,
            },
        }
    }

    #[test]
    fn test_record_flattens_candidate() {
        let record = CropRecord::new(
            PathBuf::from("test/pizza/1.jpg"),
            "pizza".to_string(),
            &best_crop(),
            false,
        );
        assert_eq!(record.ensemble.heat_h, 6);
        assert_eq!(record.ensemble.crop_col, 1);
        assert_eq!(record.ensemble.agreement, 3);
        assert!(!record.in_bounds);
    }

    #[test]
    fn test_write_and_read_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("crops.json");
        let record = CropRecord::new(
            PathBuf::from("test/pizza/1.jpg"),
            "pizza".to_string(),
            &best_crop(),
            true,
        );

        write_records(&path, std::slice::from_ref(&record)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"crop_row\": 3"));

        let loaded = read_records(&path).unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn test_read_records_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_records(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read crop records"));
    }
}
