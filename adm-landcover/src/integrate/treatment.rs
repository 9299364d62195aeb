use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::integrate::table::{MergedRecord, MergedTable, ResolvedTable};

/// Treatment flag of one fine polygon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreatmentRecord {
    pub shape_id: String,
    /// 0 or 1
    pub treatment: u8,
}

/// Parse a treatment cell. `None` for an empty cell.
fn parse_treatment(shape_id: &str, raw: &str) -> Result<Option<u8>, PipelineError> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(v) if v == 0.0 => Ok(Some(0)),
        Ok(v) if v == 1.0 => Ok(Some(1)),
        _ => Err(PipelineError::InvalidTreatment {
            shape_id: shape_id.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Read the id and treatment columns of a CSV file.
///
/// An id may appear only once, whether or not its value is empty.
pub fn read_treatment_csv(path: &Path, id_column: &str, value_column: &str) -> Result<Vec<TreatmentRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open treatment file: {}", path.display()))?;
    let headers = reader.headers()?.clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .with_context(|| format!("Column `{}` not found in {}", name, path.display()))
    };
    let id_idx = position(id_column)?;
    let value_idx = position(value_column)?;

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("Malformed row {} in {}", line + 2, path.display()))?;
        let shape_id = row.get(id_idx).unwrap_or_default().trim().to_string();
        // Rows with an empty value still claim their id
        if !seen.insert(shape_id.clone()) {
            return Err(PipelineError::DuplicateKey {
                key: shape_id,
                table: "treatment".to_string(),
            }
            .into());
        }
        let raw = row.get(value_idx).unwrap_or_default();
        match parse_treatment(&shape_id, raw)? {
            Some(treatment) => records.push(TreatmentRecord { shape_id, treatment }),
            None => warn!(shape_id = %shape_id, "empty treatment value, record skipped"),
        }
    }

    info!(path = %path.display(), records = records.len(), "loaded treatment table");
    Ok(records)
}

/// Left join of the resolved table with the treatment records on the fine id
///
/// Rows without a record keep `treatment = None`. The row count never changes.
pub fn merge_treatment(resolved: ResolvedTable, records: &[TreatmentRecord]) -> Result<MergedTable, PipelineError> {
    let mut lookup: HashMap<&str, u8> = HashMap::with_capacity(records.len());
    for record in records {
        if lookup.insert(record.shape_id.as_str(), record.treatment).is_some() {
            return Err(PipelineError::DuplicateKey {
                key: record.shape_id.clone(),
                table: "treatment".to_string(),
            });
        }
    }

    let merged = MergedTable {
        schema: resolved.schema,
        records: resolved
            .records
            .into_iter()
            .map(|r| MergedRecord {
                treatment: lookup.get(r.child.id.as_str()).copied(),
                child: r.child,
                parent: r.parent,
                overlap_fraction: r.overlap_fraction,
            })
            .collect(),
    };

    info!(
        rows = merged.len(),
        unmatched = merged.unmatched(),
        "merged treatment"
    );
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::table::tests::resolved;
    use tempfile::TempDir;

    fn record(id: &str, treatment: u8) -> TreatmentRecord {
        TreatmentRecord {
            shape_id: id.to_string(),
            treatment,
        }
    }

    #[test]
    fn test_parse_treatment() {
        assert_eq!(parse_treatment("A", "1").unwrap(), Some(1));
        assert_eq!(parse_treatment("A", " 0.0 ").unwrap(), Some(0));
        assert_eq!(parse_treatment("A", "").unwrap(), None);
        assert!(matches!(
            parse_treatment("A", "2"),
            Err(PipelineError::InvalidTreatment { ref value, .. }) if value == "2"
        ));
        assert!(parse_treatment("A", "yes").is_err());
    }

    #[test]
    fn test_missing_treatment_is_none() {
        let merged = merge_treatment(resolved(), &[record("B", 1)]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.records[0].child.id, "A");
        assert_eq!(merged.records[0].treatment, None);
        assert_eq!(merged.records[1].treatment, Some(1));
        assert_eq!(merged.unmatched(), 1);
    }

    #[test]
    fn test_row_count_preserved_with_extra_records() {
        let merged = merge_treatment(resolved(), &[record("A", 0), record("B", 1), record("Z", 1)]).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.unmatched(), 0);
    }

    #[test]
    fn test_duplicate_key() {
        let err = merge_treatment(resolved(), &[record("A", 0), record("A", 1)]).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateKey { ref key, .. } if key == "A"));
    }

    #[test]
    fn test_read_treatment_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("treatment.csv");
        std::fs::write(&path, "shapeName,shapeID,treatment\nAlpha,A,1\nBravo,B,\nCharlie,C,0.0\n").unwrap();
        let records = read_treatment_csv(&path, "shapeID", "treatment").unwrap();
        assert_eq!(records, vec![record("A", 1), record("C", 0)]);

        std::fs::write(&path, "shapeID,treatment\nA,3\n").unwrap();
        let err = read_treatment_csv(&path, "shapeID", "treatment").unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());

        assert!(read_treatment_csv(&path, "id", "treatment").is_err());
    }

    #[test]
    fn test_duplicate_id_with_empty_value_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("treatment.csv");
        std::fs::write(&path, "shapeID,treatment\nA,1\nA,\n").unwrap();
        let err = read_treatment_csv(&path, "shapeID", "treatment").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DuplicateKey { key, .. }) if key == "A"
        ));

        std::fs::write(&path, "shapeID,treatment\nA,\nB,0\nA,\n").unwrap();
        assert!(read_treatment_csv(&path, "shapeID", "treatment").is_err());
    }
}
