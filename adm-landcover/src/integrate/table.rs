use geojson::{JsonObject, JsonValue};
use std::collections::{BTreeMap, HashMap};

use crate::error::PipelineError;
use crate::geometric::overlap::OverlapAssignment;
use crate::geometric::polygon_layer::{PolygonFeature, PolygonLayer};

/// Output column names, derived from the configured fields and levels
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnNaming {
    pub id_field: String,
    pub name_field: String,
    pub treatment_column: String,
    fine_suffix: String,
    coarse_suffix: String,
}

impl ColumnNaming {
    pub fn new(
        id_field: &str,
        name_field: &str,
        treatment_column: &str,
        fine_level: u8,
        coarse_level: u8,
    ) -> Self {
        ColumnNaming {
            id_field: id_field.to_string(),
            name_field: name_field.to_string(),
            treatment_column: treatment_column.to_string(),
            fine_suffix: format!("_adm{}", fine_level),
            coarse_suffix: format!("_adm{}", coarse_level),
        }
    }

    pub fn fine(&self, field: &str) -> String {
        format!("{}{}", field, self.fine_suffix)
    }

    pub fn coarse(&self, field: &str) -> String {
        format!("{}{}", field, self.coarse_suffix)
    }

    /// `shapeID_adm2`, the join key of every stage
    pub fn key_column(&self) -> String {
        self.fine(&self.id_field)
    }

    /// `overlap_adm1`
    pub fn overlap_column(&self) -> String {
        format!("overlap{}", self.coarse_suffix)
    }
}

/// Coarse polygon carried next to its child, without geometry
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRef {
    pub id: String,
    pub name: Option<String>,
    pub attributes: JsonObject,
}

#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub child: PolygonFeature,
    pub parent: ParentRef,
    pub overlap_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct MergedRecord {
    pub child: PolygonFeature,
    pub parent: ParentRef,
    pub overlap_fraction: f64,
    pub treatment: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct IntegratedRecord {
    pub child: PolygonFeature,
    pub parent: ParentRef,
    pub overlap_fraction: f64,
    pub treatment: Option<u8>,
    /// Aligned with `IntegratedTable::count_columns`
    pub counts: Vec<u64>,
}

/// Attribute columns shared by every stage
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub naming: ColumnNaming,
    pub fine_attributes: Vec<String>,
    pub coarse_attributes: Vec<String>,
}

impl TableSchema {
    fn base_columns(&self) -> Vec<String> {
        let n = &self.naming;
        let mut columns = vec![n.fine(&n.id_field), n.fine(&n.name_field)];
        columns.extend(self.fine_attributes.iter().map(|a| n.fine(a)));
        columns.push(n.coarse(&n.id_field));
        columns.push(n.coarse(&n.name_field));
        columns.extend(self.coarse_attributes.iter().map(|a| n.coarse(a)));
        columns.push(n.overlap_column());
        columns
    }
}

/// Fine polygons with their selected parent, ordered by child id
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub schema: TableSchema,
    pub records: Vec<ResolvedRecord>,
}

impl ResolvedTable {
    /// Attach each fine polygon to the parent chosen by the overlap resolver
    pub fn from_assignments(
        fine: &PolygonLayer,
        coarse: &PolygonLayer,
        assignments: &BTreeMap<String, OverlapAssignment>,
        naming: ColumnNaming,
    ) -> Result<Self, PipelineError> {
        let parents: HashMap<&str, &PolygonFeature> =
            coarse.iter().map(|f| (f.id.as_str(), f)).collect();

        let mut children: Vec<&PolygonFeature> = fine.iter().collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));

        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let no_parent = || PipelineError::NoParent {
                child_id: child.id.clone(),
            };
            let assignment = assignments.get(&child.id).ok_or_else(no_parent)?;
            let parent = parents
                .get(assignment.parent_id.as_str())
                .ok_or_else(no_parent)?;
            records.push(ResolvedRecord {
                child: child.clone(),
                parent: ParentRef {
                    id: parent.id.clone(),
                    name: parent.name.clone(),
                    attributes: parent.attributes.clone(),
                },
                overlap_fraction: assignment.overlap_fraction,
            });
        }

        Ok(ResolvedTable {
            schema: TableSchema {
                naming,
                fine_attributes: fine.attribute_names(),
                coarse_attributes: coarse.attribute_names(),
            },
            records,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Resolved table left-joined with the treatment flags
#[derive(Debug, Clone)]
pub struct MergedTable {
    pub schema: TableSchema,
    pub records: Vec<MergedRecord>,
}

impl MergedTable {
    pub fn column_names(&self) -> Vec<String> {
        let mut columns = self.schema.base_columns();
        columns.push(self.schema.naming.treatment_column.clone());
        columns
    }

    /// Rows without a treatment record
    pub fn unmatched(&self) -> usize {
        self.records.iter().filter(|r| r.treatment.is_none()).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Final table: one row per fine polygon that survived every zonal join
#[derive(Debug, Clone)]
pub struct IntegratedTable {
    pub schema: TableSchema,
    /// `{raster_id}_{label}` columns, in fold order
    pub count_columns: Vec<String>,
    pub records: Vec<IntegratedRecord>,
}

impl From<MergedTable> for IntegratedTable {
    fn from(merged: MergedTable) -> Self {
        IntegratedTable {
            schema: merged.schema,
            count_columns: Vec::new(),
            records: merged
                .records
                .into_iter()
                .map(|r| IntegratedRecord {
                    child: r.child,
                    parent: r.parent,
                    overlap_fraction: r.overlap_fraction,
                    treatment: r.treatment,
                    counts: Vec::new(),
                })
                .collect(),
        }
    }
}

impl IntegratedTable {
    /// Every non-geometry column, in export order
    pub fn column_names(&self) -> Vec<String> {
        let mut columns = self.schema.base_columns();
        columns.push(self.schema.naming.treatment_column.clone());
        columns.extend(self.count_columns.iter().cloned());
        columns
    }

    /// Values of one record, aligned with `column_names()`
    pub fn row_values(&self, record: &IntegratedRecord) -> Vec<JsonValue> {
        let schema = &self.schema;
        let name = |n: &Option<String>| n.clone().map(JsonValue::String).unwrap_or(JsonValue::Null);
        let attr = |attrs: &JsonObject, key: &str| attrs.get(key).cloned().unwrap_or(JsonValue::Null);

        let mut values = vec![
            JsonValue::String(record.child.id.clone()),
            name(&record.child.name),
        ];
        values.extend(
            schema
                .fine_attributes
                .iter()
                .map(|a| attr(&record.child.attributes, a)),
        );
        values.push(JsonValue::String(record.parent.id.clone()));
        values.push(name(&record.parent.name));
        values.extend(
            schema
                .coarse_attributes
                .iter()
                .map(|a| attr(&record.parent.attributes, a)),
        );
        values.push(JsonValue::from(record.overlap_fraction));
        values.push(record.treatment.map(JsonValue::from).unwrap_or(JsonValue::Null));
        values.extend(record.counts.iter().map(|&c| JsonValue::from(c)));
        values
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Non-geometry columns as a polars DataFrame
    #[cfg(feature = "polars")]
    pub fn to_polars_df(&self) -> anyhow::Result<polars::prelude::DataFrame> {
        use anyhow::Context;
        use polars::prelude::*;

        let names = self.column_names();
        let rows: Vec<Vec<JsonValue>> = self.records.iter().map(|r| self.row_values(r)).collect();
        let fixed = names.len() - self.count_columns.len();
        let overlap_idx = fixed - 2;
        let treatment_idx = fixed - 1;

        let columns = names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let name: PlSmallStr = name.as_str().into();
                if idx == overlap_idx {
                    let values: Vec<f64> = rows.iter().map(|r| r[idx].as_f64().unwrap_or(f64::NAN)).collect();
                    Column::new(name, values)
                } else if idx == treatment_idx {
                    let values: Vec<Option<u32>> =
                        rows.iter().map(|r| r[idx].as_u64().map(|v| v as u32)).collect();
                    Column::new(name, values)
                } else if idx > treatment_idx {
                    let values: Vec<u64> = rows.iter().map(|r| r[idx].as_u64().unwrap_or(0)).collect();
                    Column::new(name, values)
                } else {
                    let values: Vec<Option<String>> = rows.iter().map(|r| json_to_cell(&r[idx])).collect();
                    Column::new(name, values)
                }
            })
            .collect::<Vec<Column>>();

        DataFrame::new(columns).context("Failed to create DataFrame")
    }
}

/// Text form of a value, `None` for null
pub fn json_to_cell(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use geo::{MultiPolygon, Rect};

    pub(crate) fn feature(id: &str, name: Option<&str>, level: u8, min: (f64, f64), max: (f64, f64)) -> PolygonFeature {
        PolygonFeature {
            id: id.to_string(),
            name: name.map(str::to_string),
            level,
            geometry: MultiPolygon::new(vec![Rect::new(min, max).to_polygon()]),
            attributes: JsonObject::new(),
        }
    }

    pub(crate) fn naming() -> ColumnNaming {
        ColumnNaming::new("shapeID", "shapeName", "treatment", 2, 1)
    }

    /// Fine A, B under coarse X, Y: A fully in X, B 60% in X
    pub(crate) fn resolved() -> ResolvedTable {
        let fine = PolygonLayer::new(
            2,
            vec![
                feature("B", Some("Bravo"), 2, (0.0, 8.0), (10.0, 9.0)),
                feature("A", Some("Alpha"), 2, (1.0, 1.0), (3.0, 6.0)),
            ],
        )
        .unwrap();
        let coarse = PolygonLayer::new(
            1,
            vec![
                feature("X", Some("Ex"), 1, (0.0, 0.0), (6.0, 10.0)),
                feature("Y", None, 1, (6.0, 0.0), (12.0, 10.0)),
            ],
        )
        .unwrap();
        let assignments = crate::geometric::overlap::resolve(&fine, &coarse).unwrap();
        ResolvedTable::from_assignments(&fine, &coarse, &assignments, naming()).unwrap()
    }

    #[test]
    fn test_naming() {
        let n = naming();
        assert_eq!(n.key_column(), "shapeID_adm2");
        assert_eq!(n.coarse("shapeName"), "shapeName_adm1");
        assert_eq!(n.overlap_column(), "overlap_adm1");
    }

    #[test]
    fn test_resolved_rows_sorted_by_child_id() {
        let table = resolved();
        let ids: Vec<&str> = table.records.iter().map(|r| r.child.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(table.records[1].parent.id, "X");
        assert_eq!(table.records[1].parent.name.as_deref(), Some("Ex"));
    }

    #[test]
    fn test_missing_assignment_is_no_parent() {
        let fine = PolygonLayer::new(2, vec![feature("A", None, 2, (1.0, 1.0), (2.0, 2.0))]).unwrap();
        let coarse = PolygonLayer::new(1, vec![feature("X", None, 1, (0.0, 0.0), (6.0, 10.0))]).unwrap();
        let err = ResolvedTable::from_assignments(&fine, &coarse, &BTreeMap::new(), naming()).unwrap_err();
        assert!(matches!(err, PipelineError::NoParent { .. }));
    }

    #[test]
    fn test_integrated_columns_and_values() {
        let resolved = resolved();
        let merged = MergedTable {
            schema: resolved.schema.clone(),
            records: resolved
                .records
                .into_iter()
                .map(|r| MergedRecord {
                    child: r.child,
                    parent: r.parent,
                    overlap_fraction: r.overlap_fraction,
                    treatment: None,
                })
                .collect(),
        };
        let mut table = IntegratedTable::from(merged);
        table.count_columns.push("esa_lc_2020_forest".to_string());
        for r in &mut table.records {
            r.counts.push(3);
        }

        assert_eq!(
            table.column_names(),
            vec![
                "shapeID_adm2",
                "shapeName_adm2",
                "shapeID_adm1",
                "shapeName_adm1",
                "overlap_adm1",
                "treatment",
                "esa_lc_2020_forest"
            ]
        );
        let values = table.row_values(&table.records[0]);
        assert_eq!(values.len(), 7);
        assert_eq!(values[0], "A");
        assert_eq!(values[2], "X");
        assert!(values[5].is_null());
        assert_eq!(values[6], 3);
    }

    #[cfg(feature = "polars")]
    #[test]
    fn test_to_polars_df() {
        let resolved = resolved();
        let table = IntegratedTable {
            schema: resolved.schema,
            count_columns: vec!["esa_lc_2020_urban".to_string()],
            records: resolved
                .records
                .into_iter()
                .map(|r| IntegratedRecord {
                    child: r.child,
                    parent: r.parent,
                    overlap_fraction: r.overlap_fraction,
                    treatment: Some(1),
                    counts: vec![4],
                })
                .collect(),
        };
        let df = table.to_polars_df().unwrap();
        assert_eq!(df.shape(), (2, 7));
        let urban = df.column("esa_lc_2020_urban").unwrap().u64().unwrap();
        assert_eq!(urban.get(1), Some(4));
        let names = df.column("shapeName_adm1").unwrap().str().unwrap();
        assert_eq!(names.get(0), Some("Ex"));
    }
}
