use anyhow::{Context, Result};
use geo::BoundingRect;
use geojson::{FeatureCollection, GeoJson, JsonValue};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::collect::global_variables::{gb_index_url, GB_CITATION};
use crate::collect::{FetchReport, ItemOutcome};
use crate::config::Config;
use crate::geo_core::BoundingBox;

/// Entry of the geoBoundaries `index.json` catalog
#[derive(Debug, Clone, Deserialize)]
pub struct GbIndexItem {
    #[serde(rename = "boundaryISO")]
    pub boundary_iso: String,
    #[serde(rename = "boundaryType")]
    pub boundary_type: String,
    #[serde(rename = "boundaryName", default)]
    pub boundary_name: String,
    #[serde(rename = "gjDownloadURL")]
    pub gj_download_url: String,
    /// The whole entry, stored untouched in the metadata sidecar
    #[serde(skip)]
    pub raw: JsonValue,
}

impl GbIndexItem {
    pub fn from_value(raw: JsonValue) -> Result<Self> {
        let mut item: GbIndexItem =
            serde_json::from_value(raw.clone()).context("Malformed geoBoundaries index entry")?;
        item.raw = raw;
        Ok(item)
    }

    /// `gB_v6_GHA_ADM2`
    pub fn name(&self) -> String {
        format!("gB_v6_{}_{}", self.boundary_iso, self.boundary_type)
    }

    /// Level digit of the boundary type, `ADM2` -> 2
    pub fn level(&self) -> Option<u8> {
        self.boundary_type.get(3..).and_then(|s| s.parse().ok())
    }

    /// File stem of the download URL, e.g. `geoBoundaries-GHA-ADM2`
    pub fn file_stem(&self) -> Result<String> {
        Path::new(&self.gj_download_url)
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("No file name in {}", self.gj_download_url))
    }
}

/// Sidecar written next to every downloaded boundary
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BoundaryMetadata {
    pub name: String,
    pub path: String,
    pub file_extension: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub citation: String,
    pub source_name: String,
    pub source_url: String,
    pub other: JsonValue,
    pub group_name: String,
    pub group_title: String,
    pub group_class: String,
    pub group_level: Option<u8>,
    pub spatial_extent: Option<String>,
}

impl BoundaryMetadata {
    pub fn new(item: &GbIndexItem, path: &Path, extent: Option<&BoundingBox>) -> Self {
        let iso3 = &item.boundary_iso;
        let btype = &item.boundary_type;
        BoundaryMetadata {
            name: item.name(),
            path: path.display().to_string(),
            file_extension: ".geojson".to_string(),
            title: format!("geoBoundaries v6 - {} {}", item.boundary_name, btype),
            description: format!(
                "This feature collection represents the {} level boundaries for {} ({}) from geoBoundaries v6.",
                btype, item.boundary_name, iso3
            ),
            tags: vec![
                "geoboundaries".to_string(),
                "administrative".to_string(),
                "boundary".to_string(),
            ],
            citation: GB_CITATION.to_string(),
            source_name: "geoBoundaries".to_string(),
            source_url: "geoboundaries.org".to_string(),
            other: item.raw.clone(),
            group_name: format!("gb_v6_{}", iso3),
            group_title: format!("gB v6 - {}", iso3),
            group_class: if btype == "ADM0" { "parent" } else { "child" }.to_string(),
            group_level: item.level(),
            spatial_extent: extent.map(BoundingBox::to_wkt),
        }
    }
}

/// Downloader for one geoBoundaries release
pub struct GeoBoundaries {
    release_dir: PathBuf,
    index_url: String,
    overwrite_existing: bool,
    dl_iso3_list: Option<Vec<String>>,
    client: Client,
}

impl GeoBoundaries {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(GeoBoundaries {
            release_dir: config.boundary_release_dir(),
            index_url: gb_index_url(&config.boundary.gb_web_hash),
            overwrite_existing: config.boundary.overwrite_existing,
            dl_iso3_list: config.boundary.dl_iso3_list.clone(),
            client,
        })
    }

    /// Fetch the catalog and keep the requested countries
    pub fn prepare(&self) -> Result<Vec<GbIndexItem>> {
        info!(url = %self.index_url, "preparing list of boundaries to download");
        let response = self
            .client
            .get(&self.index_url)
            .send()
            .with_context(|| format!("Failed to fetch geoBoundaries index {}", self.index_url))?;
        if !response.status().is_success() {
            anyhow::bail!(
                "geoBoundaries index returned {}: {}",
                response.status(),
                self.index_url
            );
        }
        let entries: Vec<JsonValue> = response
            .json()
            .context("geoBoundaries index is not a JSON array")?;
        let items = entries
            .into_iter()
            .map(GbIndexItem::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(select_items(items, self.dl_iso3_list.as_deref()))
    }

    /// Download every selected boundary. Only a catalog failure is fatal.
    pub fn run(&self) -> Result<FetchReport> {
        std::fs::create_dir_all(&self.release_dir).with_context(|| {
            format!("Failed to create directory: {}", self.release_dir.display())
        })?;
        let items = self.prepare()?;
        info!(items = items.len(), "running boundary data download");

        #[cfg(feature = "indicatif")]
        let pb = {
            let pb = indicatif::ProgressBar::new(items.len() as u64);
            pb.set_style(crate::collect::progress_style());
            pb.set_message("Boundaries");
            pb
        };

        let fetch = |item: &GbIndexItem| {
            let outcome = self.fetch_item(item);
            #[cfg(feature = "indicatif")]
            pb.inc(1);
            (item.name(), outcome)
        };

        #[cfg(feature = "rayon")]
        let outcomes: Vec<(String, Result<ItemOutcome>)> = items.par_iter().map(fetch).collect();
        #[cfg(not(feature = "rayon"))]
        let outcomes: Vec<(String, Result<ItemOutcome>)> = items.iter().map(fetch).collect();

        #[cfg(feature = "indicatif")]
        pb.finish_with_message("Boundaries done");

        let mut report = FetchReport::default();
        for (name, outcome) in outcomes {
            report.record(name, outcome);
        }
        report.log_summary("geoBoundaries");
        Ok(report)
    }

    /// Download one boundary and write `{stem}.geojson` and `{stem}.meta.json`
    pub fn fetch_item(&self, item: &GbIndexItem) -> Result<ItemOutcome> {
        let stem = item.file_stem()?;
        let dir = self.release_dir.join(&stem);
        let geojson_path = dir.join(format!("{}.geojson", stem));
        let meta_path = dir.join(format!("{}.meta.json", stem));

        if geojson_path.exists() && meta_path.exists() && !self.overwrite_existing {
            info!(path = %geojson_path.display(), "skipping existing file");
            return Ok(ItemOutcome::SkippedExisting);
        }
        info!(name = %item.name(), "processing geoBoundaries item");

        debug!(url = %item.gj_download_url, "downloading boundary");
        let response = self
            .client
            .get(&item.gj_download_url)
            .send()
            .with_context(|| format!("Failed to download {}", item.gj_download_url))?;
        match response.status() {
            StatusCode::NOT_FOUND => anyhow::bail!("404: {}", item.gj_download_url),
            status if !status.is_success() => {
                anyhow::bail!("{}: {}", status, item.gj_download_url)
            }
            _ => {}
        }
        let text = response
            .text()
            .with_context(|| format!("Failed to read body of {}", item.gj_download_url))?;
        let mut collection = match text.parse::<GeoJson>() {
            Ok(GeoJson::FeatureCollection(fc)) => fc,
            Ok(_) => anyhow::bail!("Not a FeatureCollection: {}", item.gj_download_url),
            Err(e) => anyhow::bail!("Invalid GeoJSON from {}: {}", item.gj_download_url, e),
        };

        apply_name_fallback(&mut collection, &item.boundary_type);
        let extent = collection_bounds(&collection);

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        std::fs::write(&geojson_path, GeoJson::from(collection).to_string())
            .with_context(|| format!("Failed to write {}", geojson_path.display()))?;

        let meta = BoundaryMetadata::new(item, &geojson_path, extent.as_ref());
        let meta_json = serde_json::to_string_pretty(&meta)?;
        std::fs::write(&meta_path, meta_json)
            .with_context(|| format!("Failed to write {}", meta_path.display()))?;

        info!(path = %geojson_path.display(), "boundary saved");
        Ok(ItemOutcome::Completed)
    }
}

/// Keep the requested ISO3 codes (all when none given), sorted by ISO3 then type
pub fn select_items(items: Vec<GbIndexItem>, iso3_list: Option<&[String]>) -> Vec<GbIndexItem> {
    let mut selected: Vec<GbIndexItem> = match iso3_list {
        Some(list) if !list.is_empty() => items
            .into_iter()
            .filter(|i| list.contains(&i.boundary_iso))
            .collect(),
        _ => items,
    };
    selected.sort_by(|a, b| {
        a.boundary_iso
            .cmp(&b.boundary_iso)
            .then_with(|| a.boundary_type.cmp(&b.boundary_type))
    });
    selected
}

/// Give every feature a `shapeName`, taken from `{boundaryType}_NAME` when
/// the source layer has no `shapeName` at all.
pub fn apply_name_fallback(collection: &mut FeatureCollection, boundary_type: &str) {
    let has_field = |field: &str| {
        collection
            .features
            .iter()
            .any(|f| f.properties.as_ref().is_some_and(|p| p.contains_key(field)))
    };
    if has_field("shapeName") {
        return;
    }
    let fallback = format!("{}_NAME", boundary_type);
    let use_fallback = has_field(&fallback);
    debug!(field = %fallback, found = use_fallback, "shapeName missing, applying fallback");

    for feature in &mut collection.features {
        let props = feature.properties.get_or_insert_with(Default::default);
        let name = if use_fallback {
            props.get(&fallback).cloned().unwrap_or(JsonValue::Null)
        } else {
            JsonValue::Null
        };
        props.insert("shapeName".to_string(), name);
    }
}

/// Total bounds of every feature geometry
pub fn collection_bounds(collection: &FeatureCollection) -> Option<BoundingBox> {
    collection
        .features
        .iter()
        .filter_map(|f| f.geometry.as_ref())
        .filter_map(|g| geo::Geometry::<f64>::try_from(g).ok())
        .filter_map(|g| g.bounding_rect())
        .map(BoundingBox::from_rect)
        .reduce(|a, b| a.union(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(iso: &str, btype: &str) -> GbIndexItem {
        GbIndexItem::from_value(json!({
            "boundaryID": format!("{}-{}-12345", iso, btype),
            "boundaryName": "Ghana",
            "boundaryISO": iso,
            "boundaryType": btype,
            "gjDownloadURL": format!(
                "https://github.com/wmgeolab/geoBoundaries/raw/9469f09/releaseData/gbOpen/{iso}/{btype}/geoBoundaries-{iso}-{btype}.geojson"
            ),
        }))
        .unwrap()
    }

    #[test]
    fn test_item_helpers() {
        let it = item("GHA", "ADM2");
        assert_eq!(it.name(), "gB_v6_GHA_ADM2");
        assert_eq!(it.level(), Some(2));
        assert_eq!(it.file_stem().unwrap(), "geoBoundaries-GHA-ADM2");
    }

    #[test]
    fn test_select_items_filters_and_sorts() {
        let items = vec![
            item("TGO", "ADM1"),
            item("GHA", "ADM2"),
            item("GHA", "ADM0"),
            item("CIV", "ADM1"),
        ];
        let list = vec!["GHA".to_string(), "TGO".to_string()];
        let names: Vec<String> = select_items(items.clone(), Some(list.as_slice()))
            .iter()
            .map(GbIndexItem::name)
            .collect();
        assert_eq!(names, vec!["gB_v6_GHA_ADM0", "gB_v6_GHA_ADM2", "gB_v6_TGO_ADM1"]);
        assert_eq!(select_items(items, None).len(), 4);
    }

    #[test]
    fn test_metadata() {
        let it = item("GHA", "ADM0");
        let bbox = BoundingBox::new(-3.5, 4.5, 1.5, 11.5);
        let meta = BoundaryMetadata::new(&it, Path::new("/data/x.geojson"), Some(&bbox));
        assert_eq!(meta.group_class, "parent");
        assert_eq!(meta.group_level, Some(0));
        assert_eq!(meta.title, "geoBoundaries v6 - Ghana ADM0");
        assert_eq!(meta.other["boundaryID"], "GHA-ADM0-12345");
        assert_eq!(
            meta.spatial_extent.as_deref(),
            Some("POLYGON ((1.5 4.5, 1.5 11.5, -3.5 11.5, -3.5 4.5, 1.5 4.5))")
        );
        let value = serde_json::to_value(&meta).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.first().map(|k| k.as_str()), Some("name"));
        assert_eq!(keys.last().map(|k| k.as_str()), Some("spatial_extent"));
        assert_eq!(BoundaryMetadata::new(&item("GHA", "ADM1"), Path::new("x"), None).group_class, "child");
    }

    fn collection(props: JsonValue) -> FeatureCollection {
        let text = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": props,
                "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [2, 0], [2, 3], [0, 0]]]}
            }]
        })
        .to_string();
        match text.parse::<GeoJson>().unwrap() {
            GeoJson::FeatureCollection(fc) => fc,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_name_fallback() {
        let mut fc = collection(json!({"ADM2_NAME": "Accra Metropolis"}));
        apply_name_fallback(&mut fc, "ADM2");
        let props = fc.features[0].properties.as_ref().unwrap();
        assert_eq!(props["shapeName"], "Accra Metropolis");

        let mut fc = collection(json!({"other": 1}));
        apply_name_fallback(&mut fc, "ADM2");
        assert!(fc.features[0].properties.as_ref().unwrap()["shapeName"].is_null());

        let mut fc = collection(json!({"shapeName": "Kept", "ADM2_NAME": "Ignored"}));
        apply_name_fallback(&mut fc, "ADM2");
        assert_eq!(fc.features[0].properties.as_ref().unwrap()["shapeName"], "Kept");
    }

    #[test]
    fn test_collection_bounds() {
        let fc = collection(json!({}));
        assert_eq!(collection_bounds(&fc), Some(BoundingBox::new(0.0, 0.0, 2.0, 3.0)));
    }
}
