use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};
#[cfg(feature = "polars")]
use tracing::{debug, warn};

use crate::config::Config;
use crate::geo_core::{BoundingBox, GeoCore};
use crate::geometric::overlap::{enforce_min_overlap, resolve};
use crate::geometric::polygon_layer::{LayerFields, PolygonLayer};
use crate::geometric::raster::{CategoricalRaster, RasterSource};
use crate::geometric::zonal::{CategoryMap, PixelInclusion};
use crate::integrate::export::export;
use crate::integrate::table::{ColumnNaming, IntegratedTable, MergedTable, ResolvedTable};
use crate::integrate::treatment::{merge_treatment, read_treatment_csv, TreatmentRecord};
use crate::integrate::zonal_fold::{fold_zonal, ZonalTable};

/// Outcome of one integration run
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationSummary {
    pub rows: usize,
    pub columns: usize,
    /// Rows exported without a treatment value
    pub unmatched_treatment: usize,
    /// Ids removed by the inner joins of the zonal fold
    pub dropped: Vec<String>,
    pub csv_path: PathBuf,
    pub geojson_path: PathBuf,
}

/// Everything the integration stages need besides the two layers
pub struct IntegrationInputs<'a> {
    pub naming: ColumnNaming,
    pub min_overlap: f64,
    pub treatment: &'a [TreatmentRecord],
    pub rasters: &'a [RasterSource],
    pub category_map: &'a CategoryMap,
    pub inclusion: PixelInclusion,
    pub geo_core: GeoCore,
}

/// Read the window of a raster covering `bbox`
///
/// A missing or unreadable file gives `None`; a CRS mismatch is fatal.
fn load_raster(source: &RasterSource, bbox: &BoundingBox, geo_core: &GeoCore) -> Result<Option<CategoricalRaster>> {
    let raster = match CategoricalRaster::open_window(source, bbox) {
        Ok(raster) => raster,
        Err(e) => {
            error!(raster = %source.id, path = %source.path.display(), "unreadable raster: {:#}", e);
            return Ok(None);
        }
    };
    geo_core.check_raster_crs(&source.id, raster.epsg())?;
    Ok(Some(raster))
}

/// Resolve, merge and fold the zonal statistics of every raster.
///
/// Every fatal check runs here, so nothing is exported unless this succeeds.
pub fn integrate_layers(
    fine: &PolygonLayer,
    coarse: &PolygonLayer,
    inputs: &IntegrationInputs,
) -> Result<(IntegratedTable, Vec<String>)> {
    let assignments = resolve(fine, coarse)?;
    enforce_min_overlap(&assignments, inputs.min_overlap)?;
    let resolved = ResolvedTable::from_assignments(fine, coarse, &assignments, inputs.naming.clone())?;

    let merged: MergedTable = merge_treatment(resolved, inputs.treatment)?;

    let bbox = fine.bounds().context("Fine boundary layer is empty")?;
    let mut zonal = Vec::with_capacity(inputs.rasters.len());
    for source in inputs.rasters {
        let table = match load_raster(source, &bbox, &inputs.geo_core)? {
            Some(raster) => ZonalTable::compute(&merged, &raster, inputs.category_map, inputs.inclusion),
            None => ZonalTable::empty(&source.id, inputs.category_map),
        };
        zonal.push(table);
    }

    Ok(fold_zonal(IntegratedTable::from(merged), zonal))
}

/// Run the integration stage described by `config`
pub fn run(config: &Config) -> Result<IntegrationSummary> {
    let ic = &config.integrate;
    let fields = LayerFields {
        id_field: ic.id_field.clone(),
        name_field: ic.name_field.clone(),
        drop_fields: ic.drop_fields.clone(),
    };
    let fine = PolygonLayer::from_geojson_path(&config.fine_boundary_path(), ic.fine_level, &fields)?;
    let coarse = PolygonLayer::from_geojson_path(&config.coarse_boundary_path(), ic.coarse_level, &fields)?;
    let treatment = read_treatment_csv(&config.treatment_file(), &ic.treatment_id_column, &ic.treatment_column)?;
    let category_map = config.category_map()?;
    let rasters = config.raster_sources();

    let inputs = IntegrationInputs {
        naming: ColumnNaming::new(
            &ic.id_field,
            &ic.name_field,
            &ic.treatment_column,
            ic.fine_level,
            ic.coarse_level,
        ),
        min_overlap: ic.min_overlap,
        treatment: &treatment,
        rasters: &rasters,
        category_map: &category_map,
        inclusion: PixelInclusion::AllTouched,
        geo_core: GeoCore::new(ic.epsg),
    };
    let (table, dropped) = integrate_layers(&fine, &coarse, &inputs)?;

    #[cfg(feature = "polars")]
    match table.to_polars_df() {
        Ok(df) => debug!("integrated table:\n{}", df.head(Some(5))),
        Err(e) => warn!("no table preview: {:#}", e),
    }

    let csv_path = config.output_csv_path();
    let geojson_path = config.output_geojson_path();
    export(&table, &csv_path, &geojson_path)?;

    let summary = IntegrationSummary {
        rows: table.len(),
        columns: table.column_names().len(),
        unmatched_treatment: table.records.iter().filter(|r| r.treatment.is_none()).count(),
        dropped,
        csv_path,
        geojson_path,
    };
    info!(
        rows = summary.rows,
        columns = summary.columns,
        unmatched = summary.unmatched_treatment,
        dropped = summary.dropped.len(),
        "integration finished"
    );
    Ok(summary)
}
