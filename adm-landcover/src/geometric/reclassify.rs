use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Output value for raw codes that no category claims
pub const RECLASS_NODATA: u8 = 0;

/// Raw ESA CCI class code -> output category code
#[derive(Debug, Clone, PartialEq)]
pub struct ReclassTable {
    lookup: HashMap<i64, u8>,
}

/// Pixel tally of one reclassification run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclassStats {
    pub mapped: u64,
    pub unmapped: u64,
    pub unmapped_codes: BTreeSet<i64>,
}

impl ReclassStats {
    pub fn merge(&mut self, other: ReclassStats) {
        self.mapped += other.mapped;
        self.unmapped += other.unmapped;
        self.unmapped_codes.extend(other.unmapped_codes);
    }
}

impl ReclassTable {
    /// Build from `{ out_code = [raw codes] }` as written in the config
    pub fn from_mapping(mapping: &BTreeMap<String, Vec<i64>>) -> Result<Self> {
        let mut lookup = HashMap::new();
        for (out, raws) in mapping {
            let out_code: u8 = out
                .trim()
                .parse()
                .with_context(|| format!("Output category `{}` is not a code in 1..=255", out))?;
            anyhow::ensure!(
                out_code != RECLASS_NODATA,
                "Output category {} is reserved for nodata",
                RECLASS_NODATA
            );
            for &raw in raws {
                if let Some(previous) = lookup.insert(raw, out_code) {
                    anyhow::bail!(
                        "Raw code {} is mapped to both {} and {}",
                        raw,
                        previous,
                        out_code
                    );
                }
            }
        }
        Ok(ReclassTable { lookup })
    }

    pub fn remap(&self, raw: i64) -> Option<u8> {
        self.lookup.get(&raw).copied()
    }

    /// Remap one block; unknown codes become `RECLASS_NODATA`
    pub fn remap_block(&self, raw: &[i64]) -> (Vec<u8>, ReclassStats) {
        let mut stats = ReclassStats::default();
        let out = raw
            .iter()
            .map(|&code| match self.remap(code) {
                Some(value) => {
                    stats.mapped += 1;
                    value
                }
                None => {
                    stats.unmapped += 1;
                    stats.unmapped_codes.insert(code);
                    RECLASS_NODATA
                }
            })
            .collect();
        (out, stats)
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }
}

/// Reclassify the `lccs_class` variable of an ESA CCI NetCDF file into a
/// tiled LZW GeoTIFF of `u8` category codes.
#[cfg(feature = "gdal")]
pub fn reclassify_netcdf(
    nc_path: &std::path::Path,
    output_path: &std::path::Path,
    table: &ReclassTable,
) -> Result<ReclassStats> {
    use crate::collect::global_variables::ESA_LCCS_VARIABLE;
    use gdal::cpl::CslStringList;
    use gdal::raster::Buffer;
    use gdal::{Dataset, DriverManager};
    use tracing::{info, warn};

    let subdataset = format!("netcdf:{}:{}", nc_path.display(), ESA_LCCS_VARIABLE);
    let source = Dataset::open(&subdataset)
        .with_context(|| format!("Failed to open NetCDF variable: {}", subdataset))?;
    let (width, height) = source.raster_size();
    let band = source.rasterband(1).context("Failed to get band 1")?;
    let (block_w, block_h) = band.block_size();

    let driver = DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;
    let mut options = CslStringList::new();
    options.add_string("TILED=YES")?;
    options.add_string("COMPRESS=LZW")?;
    options.add_string("BIGTIFF=IF_SAFER")?;

    let mut output = driver
        .create_with_band_type_with_options::<u8, _>(output_path, width, height, 1, &options)
        .with_context(|| format!("Failed to create GeoTIFF: {}", output_path.display()))?;
    output
        .set_geo_transform(&source.geo_transform()?)
        .context("Failed to set geotransform")?;
    if let Ok(srs) = source.spatial_ref() {
        output
            .set_spatial_ref(&srs)
            .context("Failed to set spatial reference")?;
    }

    let mut out_band = output.rasterband(1).context("Failed to get output band")?;
    let mut stats = ReclassStats::default();

    for y in (0..height).step_by(block_h.max(1)) {
        for x in (0..width).step_by(block_w.max(1)) {
            let w = block_w.min(width - x);
            let h = block_h.min(height - y);
            let raw = band
                .read_as::<i32>((x as isize, y as isize), (w, h), (w, h), None)
                .with_context(|| format!("Failed to read block at ({}, {})", x, y))?;
            let codes: Vec<i64> = raw.data().iter().map(|&v| i64::from(v)).collect();
            let (values, block_stats) = table.remap_block(&codes);
            stats.merge(block_stats);

            let mut buffer = Buffer::new((w, h), values);
            out_band
                .write((x as isize, y as isize), (w, h), &mut buffer)
                .with_context(|| format!("Failed to write block at ({}, {})", x, y))?;
        }
    }
    out_band
        .set_no_data_value(Some(f64::from(RECLASS_NODATA)))
        .context("Failed to set no data value")?;

    if stats.unmapped > 0 {
        warn!(
            path = %nc_path.display(),
            pixels = stats.unmapped,
            codes = ?stats.unmapped_codes,
            "raw codes without a category were written as nodata"
        );
    }
    info!(
        output = %output_path.display(),
        mapped = stats.mapped,
        "reclassified land cover"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> BTreeMap<String, Vec<i64>> {
        let mut mapping = BTreeMap::new();
        mapping.insert("1".to_string(), vec![50, 60, 61, 62]);
        mapping.insert("2".to_string(), vec![190]);
        mapping
    }

    #[test]
    fn test_from_mapping() {
        let table = ReclassTable::from_mapping(&mapping()).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.remap(61), Some(1));
        assert_eq!(table.remap(190), Some(2));
        assert_eq!(table.remap(10), None);
    }

    #[test]
    fn test_rejects_overlapping_raw_codes() {
        let mut m = mapping();
        m.insert("3".to_string(), vec![190]);
        assert!(ReclassTable::from_mapping(&m).is_err());
    }

    #[test]
    fn test_rejects_nodata_and_non_numeric_outputs() {
        let mut m = mapping();
        m.insert("0".to_string(), vec![10]);
        assert!(ReclassTable::from_mapping(&m).is_err());

        let mut m = mapping();
        m.insert("forest".to_string(), vec![10]);
        assert!(ReclassTable::from_mapping(&m).is_err());
    }

    #[test]
    fn test_remap_block() {
        let table = ReclassTable::from_mapping(&mapping()).unwrap();
        let (out, stats) = table.remap_block(&[50, 190, 210, 0, 62]);
        assert_eq!(out, vec![1, 2, RECLASS_NODATA, RECLASS_NODATA, 1]);
        assert_eq!(stats.mapped, 3);
        assert_eq!(stats.unmapped, 2);
        assert_eq!(stats.unmapped_codes.iter().copied().collect::<Vec<_>>(), vec![0, 210]);
    }
}
