use std::collections::{BTreeSet, HashMap};
use tracing::{error, info, warn};

use crate::geometric::raster::CategoricalRaster;
use crate::geometric::zonal::{zonal_categorical_count, CategoryMap, PixelInclusion, UNMAPPED_LABEL};
use crate::integrate::table::{IntegratedTable, MergedTable};

/// Category counts of one raster for every polygon it was computed on
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalTable {
    pub raster_id: String,
    /// `{raster_id}_{label}`
    pub columns: Vec<String>,
    /// Polygon id -> counts aligned with `columns`
    pub rows: HashMap<String, Vec<u64>>,
}

impl ZonalTable {
    /// Result set of a raster that could not be read: no rows at all
    pub fn empty(raster_id: &str, category_map: &CategoryMap) -> Self {
        ZonalTable {
            raster_id: raster_id.to_string(),
            columns: column_names(raster_id, category_map, false),
            rows: HashMap::new(),
        }
    }

    /// Count categories of `raster` for every row of `table`
    pub fn compute(
        table: &MergedTable,
        raster: &CategoricalRaster,
        category_map: &CategoryMap,
        inclusion: PixelInclusion,
    ) -> Self {
        let raster_id = raster.id();
        let counts: Vec<(String, _)> = table
            .records
            .iter()
            .map(|r| {
                (
                    r.child.id.clone(),
                    zonal_categorical_count(&r.child.geometry, raster, category_map, inclusion),
                )
            })
            .collect();

        let unmapped_codes: BTreeSet<i64> = counts
            .iter()
            .flat_map(|(_, c)| c.unmapped_codes().iter().copied())
            .collect();
        let with_unmapped = !unmapped_codes.is_empty();
        if with_unmapped {
            warn!(
                raster = raster_id,
                codes = ?unmapped_codes,
                "raster codes missing from the category map, counted as `{}`",
                UNMAPPED_LABEL
            );
        }

        let rows = counts
            .into_iter()
            .map(|(id, c)| {
                let mut values: Vec<u64> = c.iter().map(|(_, n)| n).collect();
                if with_unmapped {
                    values.push(c.unmapped());
                }
                (id, values)
            })
            .collect();

        info!(raster = raster_id, polygons = table.len(), "computed zonal statistics");
        ZonalTable {
            raster_id: raster_id.to_string(),
            columns: column_names(raster_id, category_map, with_unmapped),
            rows,
        }
    }
}

fn column_names(raster_id: &str, category_map: &CategoryMap, with_unmapped: bool) -> Vec<String> {
    let mut columns: Vec<String> = category_map
        .labels()
        .map(|l| format!("{}_{}", raster_id, l))
        .collect();
    if with_unmapped {
        columns.push(format!("{}_{}", raster_id, UNMAPPED_LABEL));
    }
    columns
}

/// Inner-join every zonal table onto `table`, left to right.
///
/// A zonal column whose name is already taken is dropped and the earlier
/// value kept. Rows missing from a zonal table are dropped; their ids are
/// returned and logged.
pub fn fold_zonal(mut table: IntegratedTable, zonal: Vec<ZonalTable>) -> (IntegratedTable, Vec<String>) {
    let key = table.schema.naming.key_column();
    let mut dropped = Vec::new();

    for z in zonal {
        let existing: BTreeSet<String> = table.column_names().into_iter().collect();
        let keep: Vec<usize> = z
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                let taken = existing.contains(*c) && **c != key;
                if taken {
                    warn!(raster = %z.raster_id, column = %c, "column already present, keeping earlier value");
                }
                !taken
            })
            .map(|(i, _)| i)
            .collect();

        let (kept, lost): (Vec<_>, Vec<_>) = table
            .records
            .into_iter()
            .partition(|r| z.rows.contains_key(&r.child.id));
        if !lost.is_empty() {
            let ids: Vec<String> = lost.into_iter().map(|r| r.child.id).collect();
            error!(raster = %z.raster_id, count = ids.len(), ids = ?ids, "rows without zonal statistics dropped");
            dropped.extend(ids);
        }

        table.records = kept
            .into_iter()
            .map(|mut r| {
                if let Some(values) = z.rows.get(&r.child.id) {
                    r.counts.extend(keep.iter().map(|&i| values[i]));
                }
                r
            })
            .collect();
        table
            .count_columns
            .extend(keep.iter().map(|&i| z.columns[i].clone()));
    }

    (table, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::raster::{GeoTransform, RasterSource};
    use crate::integrate::table::tests::resolved;
    use crate::integrate::treatment::merge_treatment;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn category_map() -> CategoryMap {
        let mut m = BTreeMap::new();
        m.insert("forest".to_string(), 1);
        m.insert("urban".to_string(), 2);
        CategoryMap::from_label_codes(&m).unwrap()
    }

    /// 12x10 raster of 1x1 pixels over [0,12]x[0,10]
    fn raster(id: &str, fill: impl Fn(usize, usize) -> i64) -> CategoricalRaster {
        let data = (0..10).flat_map(|r| (0..12).map(move |c| (r, c))).map(|(r, c)| fill(r, c)).collect();
        CategoricalRaster::new(
            RasterSource {
                id: id.to_string(),
                year: 2020,
                path: PathBuf::from(format!("{}.tif", id)),
            },
            GeoTransform::new(0.0, 1.0, 10.0, -1.0),
            12,
            10,
            data,
            Some(0),
            Some(4326),
        )
        .unwrap()
    }

    fn merged() -> MergedTable {
        merge_treatment(resolved(), &[]).unwrap()
    }

    #[test]
    fn test_zero_columns_for_absent_categories() {
        // Only water (code 5, unmapped) and nodata in the raster
        let r = raster("esa_lc_2020", |_, c| if c < 6 { 0 } else { 5 });
        let z = ZonalTable::compute(&merged(), &r, &category_map(), PixelInclusion::AllTouched);
        assert_eq!(
            z.columns,
            vec!["esa_lc_2020_forest", "esa_lc_2020_urban", "esa_lc_2020_unmapped"]
        );
        // A lies in nodata only
        assert_eq!(z.rows["A"], vec![0, 0, 0]);
        assert!(z.rows["B"][2] > 0);
    }

    #[test]
    fn test_unmapped_column_only_when_seen() {
        let r = raster("esa_lc_2019", |_, _| 1);
        let z = ZonalTable::compute(&merged(), &r, &category_map(), PixelInclusion::AllTouched);
        assert_eq!(z.columns.len(), 2);
        // A = [1,3]x[1,6] touches cols 0..=3 and 5 bands of rows plus their neighbours
        assert_eq!(z.rows["A"], vec![4 * 7, 0]);
    }

    #[test]
    fn test_fold_keeps_first_value_on_collision() {
        let m = merged();
        let first = ZonalTable::compute(&m, &raster("esa_lc_2020", |_, _| 1), &category_map(), PixelInclusion::AllTouched);
        let second = ZonalTable::compute(&m, &raster("esa_lc_2020", |_, _| 2), &category_map(), PixelInclusion::AllTouched);
        let (table, dropped) = fold_zonal(IntegratedTable::from(m), vec![first, second]);
        assert!(dropped.is_empty());
        assert_eq!(table.count_columns, vec!["esa_lc_2020_forest", "esa_lc_2020_urban"]);
        assert_eq!(table.records[0].counts, vec![28, 0]);
    }

    #[test]
    fn test_fold_inner_join_drops_missing_rows() {
        let m = merged();
        let full = ZonalTable::compute(&m, &raster("esa_lc_2019", |_, _| 1), &category_map(), PixelInclusion::AllTouched);
        let missing = ZonalTable::empty("esa_lc_2020", &category_map());
        let (table, dropped) = fold_zonal(IntegratedTable::from(m), vec![full, missing]);
        assert!(table.is_empty());
        assert_eq!(dropped, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(table.count_columns.len(), 4);
    }
}
