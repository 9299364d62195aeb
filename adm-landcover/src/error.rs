use std::path::PathBuf;

use thiserror::Error;

/// Data-quality and consistency failures of the integration pipeline.
///
/// Every variant is fatal: the pipeline stops before any output file is
/// committed. Each one names the offending identifier so the failure can be
/// traced back to the input data.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("polygon `{child_id}` does not intersect any parent polygon")]
    NoParent { child_id: String },

    #[error("polygon `{id}` has zero area")]
    EmptyGeometry { id: String },

    #[error("duplicate polygon id `{id}` in level {level} layer")]
    DuplicatePolygonId { id: String, level: u8 },

    #[error(
        "overlap below threshold {threshold} for {} polygon(s): {}",
        offenders.len(),
        format_offenders(offenders)
    )]
    OverlapBelowThreshold {
        threshold: f64,
        offenders: Vec<(String, f64)>,
    },

    #[error("duplicate key `{key}` in {table}")]
    DuplicateKey { key: String, table: String },

    #[error("invalid treatment value `{value}` for `{shape_id}` (expected 0 or 1)")]
    InvalidTreatment { shape_id: String, value: String },

    #[error("raster `{raster_id}` is in EPSG:{found}, polygons are in EPSG:{expected}")]
    CrsMismatch {
        raster_id: String,
        found: u32,
        expected: u32,
    },

    #[error("export incomplete: {written:?} was written but {failed:?} was not: {reason}")]
    PartialExport {
        written: PathBuf,
        failed: PathBuf,
        reason: String,
    },
}

fn format_offenders(offenders: &[(String, f64)]) -> String {
    offenders
        .iter()
        .map(|(id, fraction)| format!("{id} ({fraction:.4})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_error_names_every_offender() {
        let err = PipelineError::OverlapBelowThreshold {
            threshold: 0.5,
            offenders: vec![("B".to_string(), 0.4), ("C".to_string(), 0.5)],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 polygon(s)"));
        assert!(msg.contains("B (0.4000)"));
        assert!(msg.contains("C (0.5000)"));
    }

    #[test]
    fn test_duplicate_key_message() {
        let err = PipelineError::DuplicateKey {
            key: "GHA-1".to_string(),
            table: "treatment table".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate key `GHA-1` in treatment table");
    }
}
