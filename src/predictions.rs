use std::path::{Path, PathBuf};

use crate::{
    data::{DiseaseClass, NUM_CLASSES},
    error::{OdirError, Result},
};

pub const PREDICTIONS_FILE: &str = "odir_predictions.csv";
pub const GROUND_TRUTH_FILE: &str = "odir_ground_truth.csv";

fn header() -> Vec<&'static str> {
    std::iter::once("ID")
        .chain(DiseaseClass::ALL.iter().map(|c| c.code()))
        .collect()
}

/// Writes per-image class probabilities in the ODIR submission layout.
pub struct PredictionWriter {
    predictions: Vec<[f32; NUM_CLASSES]>,
    ids: Vec<String>,
    folder: PathBuf,
}

impl PredictionWriter {
    pub fn new(predictions: Vec<[f32; NUM_CLASSES]>, ids: Vec<String>, folder: &Path) -> Result<Self> {
        if predictions.len() != ids.len() {
            return Err(OdirError::RowCount {
                expected: ids.len(),
                actual: predictions.len(),
            });
        }

        Ok(Self {
            predictions,
            ids,
            folder: folder.to_path_buf(),
        })
    }

    /// `odir_predictions.csv`: one probability row per image.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.folder.join(PREDICTIONS_FILE);
        let rows = self.predictions.iter().map(|row| row.map(|p| p.to_string()));
        write_rows(&path, &self.ids, rows)?;
        log::info!("Predictions written to {:?}", path);
        Ok(path)
    }

    /// `odir_ground_truth.csv`: the matching multi-hot labels.
    pub fn save_all(&self, targets: &[[u8; NUM_CLASSES]]) -> Result<PathBuf> {
        if targets.len() != self.ids.len() {
            return Err(OdirError::RowCount {
                expected: self.ids.len(),
                actual: targets.len(),
            });
        }

        let path = self.folder.join(GROUND_TRUTH_FILE);
        let rows = targets.iter().map(|row| row.map(|v| v.to_string()));
        write_rows(&path, &self.ids, rows)?;
        log::info!("Ground truth written to {:?}", path);
        Ok(path)
    }
}

fn write_rows(path: &Path, ids: &[String], rows: impl Iterator<Item = [String; NUM_CLASSES]>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header())?;
    for (id, row) in ids.iter().zip(rows) {
        writer.write_record(std::iter::once(id.as_str()).chain(row.iter().map(String::as_str)))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a file written by [`PredictionWriter`] back as `(id, values)` rows.
pub fn read_rows(path: &Path) -> Result<Vec<(String, [f32; NUM_CLASSES])>> {
    if !path.exists() {
        return Err(OdirError::PathNotFound(path.to_path_buf()));
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() != NUM_CLASSES + 1 {
            return Err(OdirError::RowWidth {
                expected: NUM_CLASSES + 1,
                actual: record.len(),
            });
        }

        let mut values = [0f32; NUM_CLASSES];
        for (dst, field) in values.iter_mut().zip(record.iter().skip(1)) {
            *dst = field
                .trim()
                .parse()
                .map_err(|_| OdirError::InvalidValue(field.to_string()))?;
        }
        rows.push((record[0].to_string(), values));
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_submission_layout() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PredictionWriter::new(
            vec![[0.5, 0.25, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0]],
            vec!["1_left".to_string()],
            dir.path(),
        )
        .unwrap();

        let path = writer.save().unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("ID,N,D,G,C,A,H,M,O"));
        assert_eq!(lines.next(), Some("1_left,0.5,0.25,0,0,0,0,0,1"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn ground_truth_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PredictionWriter::new(
            vec![[0.0; NUM_CLASSES], [0.0; NUM_CLASSES]],
            vec!["a".to_string(), "b".to_string()],
            dir.path(),
        )
        .unwrap();
        writer.save_all(&[[1, 0, 0, 0, 0, 0, 0, 0], [0, 0, 0, 1, 0, 0, 0, 1]]).unwrap();

        let rows = read_rows(&dir.path().join(GROUND_TRUTH_FILE)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].0, "b");
        assert_eq!(rows[1].1[3], 1.0);
        assert_eq!(rows[1].1[7], 1.0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            PredictionWriter::new(vec![[0.0; NUM_CLASSES]], vec![], dir.path()),
            Err(OdirError::RowCount { expected: 0, actual: 1 })
        ));

        let writer = PredictionWriter::new(vec![[0.0; NUM_CLASSES]], vec!["a".to_string()], dir.path()).unwrap();
        assert!(writer.save_all(&[]).is_err());
    }

    #[test]
    fn final_score_from_run_folder() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PredictionWriter::new(
            vec![[0.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], [0.1, 0.8, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]],
            vec!["a".to_string(), "b".to_string()],
            dir.path(),
        )
        .unwrap();
        writer.save().unwrap();
        writer.save_all(&[[1, 0, 0, 0, 0, 0, 0, 0], [0, 1, 0, 0, 0, 0, 0, 0]]).unwrap();

        let score = crate::metrics::FinalScore::from_folder(dir.path()).unwrap();
        assert!((score.score - 1.0).abs() < 1e-9);
    }
}
