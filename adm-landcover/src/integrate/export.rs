use anyhow::{Context, Result};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::info;

use crate::commons::basic_functions::ensure_parent_dir;
use crate::error::PipelineError;
use crate::integrate::table::{json_to_cell, IntegratedTable};

/// Write the table as CSV (no geometry)
pub fn write_csv<W: Write>(table: &IntegratedTable, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(table.column_names())?;
    for record in &table.records {
        let cells = table
            .row_values(record)
            .iter()
            .map(|v| json_to_cell(v).unwrap_or_default())
            .collect::<Vec<String>>();
        csv_writer.write_record(&cells)?;
    }
    csv_writer.flush()?;
    Ok(())
}

/// Same rows as the CSV plus the fine geometry, properties in column order
pub fn to_feature_collection(table: &IntegratedTable) -> FeatureCollection {
    let columns = table.column_names();
    let features = table
        .records
        .iter()
        .map(|record| {
            let properties: JsonObject = columns
                .iter()
                .cloned()
                .zip(table.row_values(record))
                .collect();
            Feature {
                bbox: None,
                geometry: Some(geojson::Geometry::new(geojson::Value::from(
                    &record.child.geometry,
                ))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn temp_in(path: &Path) -> Result<NamedTempFile> {
    ensure_parent_dir(path)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    NamedTempFile::new_in(dir).with_context(|| format!("Failed to create temp file in {}", dir.display()))
}

/// Write the CSV and the GeoJSON.
///
/// Both files are fully written to temporary files next to their targets
/// before either is moved into place.
pub fn export(table: &IntegratedTable, csv_path: &Path, geojson_path: &Path) -> Result<()> {
    let mut csv_tmp = temp_in(csv_path)?;
    write_csv(table, csv_tmp.as_file_mut())
        .with_context(|| format!("Failed to write CSV for {}", csv_path.display()))?;
    csv_tmp.as_file().sync_all()?;

    let mut geojson_tmp = temp_in(geojson_path)?;
    let text = GeoJson::from(to_feature_collection(table)).to_string();
    geojson_tmp
        .write_all(text.as_bytes())
        .with_context(|| format!("Failed to write GeoJSON for {}", geojson_path.display()))?;
    geojson_tmp.as_file().sync_all()?;

    csv_tmp
        .persist(csv_path)
        .with_context(|| format!("Failed to move CSV into place: {}", csv_path.display()))?;
    geojson_tmp.persist(geojson_path).map_err(|e| PipelineError::PartialExport {
        written: csv_path.to_path_buf(),
        failed: geojson_path.to_path_buf(),
        reason: e.error.to_string(),
    })?;

    info!(
        csv = %csv_path.display(),
        geojson = %geojson_path.display(),
        rows = table.len(),
        "exported integrated table"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrate::table::tests::resolved;
    use crate::integrate::treatment::{merge_treatment, TreatmentRecord};
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn table() -> IntegratedTable {
        let merged = merge_treatment(
            resolved(),
            &[TreatmentRecord {
                shape_id: "B".to_string(),
                treatment: 1,
            }],
        )
        .unwrap();
        let mut table = IntegratedTable::from(merged);
        table.count_columns = vec!["esa_lc_2020_forest".to_string(), "esa_lc_2020_urban".to_string()];
        table.records[0].counts = vec![12, 0];
        table.records[1].counts = vec![0, 7];
        table
    }

    #[test]
    fn test_csv_round_trip() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("out").join("data.csv");
        let geojson_path = dir.path().join("out").join("data.geojson");
        export(&table(), &csv_path, &geojson_path).unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(headers, table().column_names());

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "A");
        assert_eq!(&rows[0][1], "Alpha");
        assert_eq!(&rows[0][2], "X");
        assert_relative_eq!(rows[0][4].parse::<f64>().unwrap(), 1.0, epsilon = 1e-9);
        assert_eq!(&rows[0][5], "");
        assert_eq!(&rows[0][6], "12");
        assert_eq!(&rows[1][5], "1");
        assert_relative_eq!(rows[1][4].parse::<f64>().unwrap(), 0.6, epsilon = 1e-9);
        assert_eq!(&rows[1][7], "7");
    }

    #[test]
    fn test_geojson_matches_csv_rows() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("data.csv");
        let geojson_path = dir.path().join("data.geojson");
        export(&table(), &csv_path, &geojson_path).unwrap();

        let text = std::fs::read_to_string(&geojson_path).unwrap();
        let fc = match text.parse::<GeoJson>().unwrap() {
            GeoJson::FeatureCollection(fc) => fc,
            _ => panic!("expected a FeatureCollection"),
        };
        assert_eq!(fc.features.len(), 2);
        let props = fc.features[0].properties.as_ref().unwrap();
        let keys: Vec<&String> = props.keys().collect();
        assert_eq!(keys, table().column_names().iter().collect::<Vec<_>>());
        assert!(props["treatment"].is_null());
        assert!(fc.features[0].geometry.is_some());
    }

    #[test]
    fn test_partial_export_is_reported() {
        let dir = TempDir::new().unwrap();
        let csv_path = dir.path().join("data.csv");
        // A directory in the way makes the second rename fail
        let geojson_path = dir.path().join("blocked");
        std::fs::create_dir(&geojson_path).unwrap();
        std::fs::write(geojson_path.join("keep"), "x").unwrap();

        let err = export(&table(), &csv_path, &geojson_path).unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::PartialExport { .. }));
        assert!(csv_path.exists());
    }
}
