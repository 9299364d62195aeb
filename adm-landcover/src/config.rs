use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::collect::global_variables::{BOUNDARY_DIR, CDS_DEFAULT_URL};
use crate::geometric::raster::RasterSource;
use crate::geometric::reclassify::ReclassTable;
use crate::geometric::zonal::CategoryMap;

/// Run configuration, read once from a TOML document and passed by reference
/// to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory for every downloaded, intermediate and output file
    pub base_path: PathBuf,
    /// Treatment CSV, relative to `base_path`
    pub treatment_path: PathBuf,
    pub boundary: BoundaryConfig,
    pub landcover: LandcoverConfig,
    #[serde(default)]
    pub integrate: IntegrateConfig,
}

/// geoBoundaries release selection
#[derive(Debug, Clone, Deserialize)]
pub struct BoundaryConfig {
    pub version: String,
    pub gb_data_hash: String,
    pub gb_web_hash: String,
    #[serde(default)]
    pub overwrite_existing: bool,
    /// ISO3 codes to download; empty or absent downloads the whole catalog
    #[serde(default)]
    pub dl_iso3_list: Option<Vec<String>>,
}

/// ESA CCI land-cover download and reclassification
#[derive(Debug, Clone, Deserialize)]
pub struct LandcoverConfig {
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    /// Years to process, in the order the zonal statistics are folded
    pub years: Vec<i32>,
    /// Name of the environment variable holding the CDS API key
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: String,
    #[serde(default)]
    pub overwrite_download: bool,
    #[serde(default)]
    pub overwrite_processing: bool,
    #[serde(default = "default_cds_url")]
    pub cds_url: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Output category code -> raw ESA class codes
    pub mapping: BTreeMap<String, Vec<i64>>,
    /// Category label -> output category code
    pub category_map: BTreeMap<String, i64>,
}

/// Integration stage parameters. Every field has a default matching the
/// Ghana ADM2/ADM1 setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegrateConfig {
    pub iso3: String,
    pub fine_level: u8,
    pub coarse_level: u8,
    pub id_field: String,
    pub name_field: String,
    /// Boundary attributes removed right after loading
    pub drop_fields: Vec<String>,
    /// Every selected overlap fraction must be strictly greater than this
    pub min_overlap: f64,
    pub treatment_id_column: String,
    pub treatment_column: String,
    /// Raster ids are `{raster_prefix}_{year}`
    pub raster_prefix: String,
    /// EPSG code shared by the boundaries and the rasters
    pub epsg: u32,
    pub output_dir: PathBuf,
    pub output_stem: String,
}

impl Default for IntegrateConfig {
    fn default() -> Self {
        IntegrateConfig {
            iso3: "GHA".to_string(),
            fine_level: 2,
            coarse_level: 1,
            id_field: "shapeID".to_string(),
            name_field: "shapeName".to_string(),
            drop_fields: vec![
                "shapeISO".to_string(),
                "shapeGroup".to_string(),
                "shapeType".to_string(),
            ],
            min_overlap: 0.5,
            treatment_id_column: "shapeID".to_string(),
            treatment_column: "treatment".to_string(),
            raster_prefix: "esa_lc".to_string(),
            epsg: 4326,
            output_dir: PathBuf::from("output"),
            output_stem: "ghana_adm2_data".to_string(),
        }
    }
}

fn default_dataset_name() -> String {
    "esa_landcover".to_string()
}

fn default_api_key_env_var() -> String {
    "CDSAPI_KEY".to_string()
}

fn default_cds_url() -> String {
    CDS_DEFAULT_URL.to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_max_wait_secs() -> u64 {
    6 * 3600
}

impl Config {
    /// Read and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("No TOML config file found at {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.landcover.years.is_empty(),
            "landcover.years must list at least one year"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.integrate.min_overlap),
            "integrate.min_overlap must be in [0, 1), got {}",
            self.integrate.min_overlap
        );
        anyhow::ensure!(
            self.integrate.fine_level != self.integrate.coarse_level,
            "integrate.fine_level and integrate.coarse_level must differ"
        );
        anyhow::ensure!(
            !self.landcover.mapping.is_empty(),
            "landcover.mapping must not be empty"
        );
        // Both lookups reject inconsistent tables
        self.category_map()?;
        self.reclass_table()?;
        Ok(())
    }

    /// Release directory, e.g. `{base}/geoBoundaries/v6_9469f09_57dcd43`
    pub fn boundary_release_dir(&self) -> PathBuf {
        self.base_path.join(BOUNDARY_DIR).join(format!(
            "{}_{}_{}",
            self.boundary.version, self.boundary.gb_data_hash, self.boundary.gb_web_hash
        ))
    }

    /// GeoJSON written by the boundary fetcher for one country and level
    pub fn boundary_path(&self, iso3: &str, level: u8) -> PathBuf {
        let stem = format!("geoBoundaries-{}-ADM{}", iso3, level);
        self.boundary_release_dir()
            .join(&stem)
            .join(format!("{}.geojson", stem))
    }

    pub fn fine_boundary_path(&self) -> PathBuf {
        self.boundary_path(&self.integrate.iso3, self.integrate.fine_level)
    }

    pub fn coarse_boundary_path(&self) -> PathBuf {
        self.boundary_path(&self.integrate.iso3, self.integrate.coarse_level)
    }

    pub fn treatment_file(&self) -> PathBuf {
        self.base_path.join(&self.treatment_path)
    }

    pub fn landcover_dir(&self) -> PathBuf {
        self.base_path.join(&self.landcover.dataset_name)
    }

    pub fn landcover_raw_dir(&self) -> PathBuf {
        self.landcover_dir().join("tmp").join("raw")
    }

    pub fn landcover_process_dir(&self) -> PathBuf {
        self.landcover_dir().join("tmp").join("processed")
    }

    /// Raster id for a year, also the column prefix of its statistics
    pub fn raster_id(&self, year: i32) -> String {
        format!("{}_{}", self.integrate.raster_prefix, year)
    }

    pub fn raster_path(&self, year: i32) -> PathBuf {
        self.landcover_dir()
            .join(format!("{}.tif", self.raster_id(year)))
    }

    /// Raster sources in the configured year order
    pub fn raster_sources(&self) -> Vec<RasterSource> {
        self.landcover
            .years
            .iter()
            .map(|&year| RasterSource {
                id: self.raster_id(year),
                year,
                path: self.raster_path(year),
            })
            .collect()
    }

    pub fn output_csv_path(&self) -> PathBuf {
        self.base_path
            .join(&self.integrate.output_dir)
            .join(format!("{}.csv", self.integrate.output_stem))
    }

    pub fn output_geojson_path(&self) -> PathBuf {
        self.base_path
            .join(&self.integrate.output_dir)
            .join(format!("{}.geojson", self.integrate.output_stem))
    }

    /// Output category code -> label, inverted from `landcover.category_map`
    pub fn category_map(&self) -> Result<CategoryMap> {
        CategoryMap::from_label_codes(&self.landcover.category_map)
    }

    /// Raw ESA code -> output category code
    pub fn reclass_table(&self) -> Result<ReclassTable> {
        ReclassTable::from_mapping(&self.landcover.mapping)
    }
}
