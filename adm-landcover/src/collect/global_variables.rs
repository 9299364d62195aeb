pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Directory name, under `base_path`, that holds every geoBoundaries release
pub const BOUNDARY_DIR: &str = "geoBoundaries";

/// geoBoundaries catalog of every gbOpen boundary, pinned to a gbWeb commit
pub const GB_INDEX_URL_TEMPLATE: &str =
    "https://raw.githubusercontent.com/wmgeolab/gbWeb/{gb_web_hash}/api/current/gbOpen/ALL/ALL/index.json";

pub const GB_CITATION: &str = "Runfola, D. et al. (2020) geoBoundaries: A global database of political administrative boundaries. PLoS ONE 15(4): e0231866. https://doi.org/10.1371/journal.pone.0231866";

pub const CDS_DEFAULT_URL: &str = "https://cds.climate.copernicus.eu/api";
pub const CDS_LANDCOVER_DATASET: &str = "satellite-land-cover";

/// Variable of the ESA CCI NetCDF files holding the land-cover class codes
pub const ESA_LCCS_VARIABLE: &str = "lccs_class";

/// Index URL of the geoBoundaries catalog for a gbWeb commit
pub fn gb_index_url(gb_web_hash: &str) -> String {
    GB_INDEX_URL_TEMPLATE.replace("{gb_web_hash}", gb_web_hash)
}
