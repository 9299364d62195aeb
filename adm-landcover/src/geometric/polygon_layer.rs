use anyhow::{Context, Result};
use geo::{Area, Geometry as GeoGeometry, MultiPolygon};
use geojson::{Feature, GeoJson, JsonObject, JsonValue};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::geo_core::BoundingBox;

/// Names of the boundary attributes that carry the id and the display name
#[derive(Debug, Clone)]
pub struct LayerFields {
    pub id_field: String,
    pub name_field: String,
    /// Attributes removed right after loading
    pub drop_fields: Vec<String>,
}

impl Default for LayerFields {
    fn default() -> Self {
        LayerFields {
            id_field: "shapeID".to_string(),
            name_field: "shapeName".to_string(),
            drop_fields: Vec::new(),
        }
    }
}

/// A single administrative region
#[derive(Debug, Clone)]
pub struct PolygonFeature {
    /// Unique within its level
    pub id: String,
    pub name: Option<String>,
    /// Administrative depth (1 for ADM1, 2 for ADM2, ...)
    pub level: u8,
    pub geometry: MultiPolygon<f64>,
    /// Remaining source attributes, in file order
    pub attributes: JsonObject,
}

impl PolygonFeature {
    pub fn area(&self) -> f64 {
        self.geometry.unsigned_area()
    }
}

/// Ordered polygons of one administrative level
#[derive(Debug, Clone)]
pub struct PolygonLayer {
    level: u8,
    features: Vec<PolygonFeature>,
}

impl PolygonLayer {
    /// Build a layer, rejecting duplicate ids
    pub fn new(level: u8, features: Vec<PolygonFeature>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::with_capacity(features.len());
        for feature in &features {
            if !seen.insert(feature.id.as_str()) {
                return Err(PipelineError::DuplicatePolygonId {
                    id: feature.id.clone(),
                    level,
                });
            }
        }
        Ok(PolygonLayer { level, features })
    }

    /// Load a boundary GeoJSON file
    pub fn from_geojson_path(path: &Path, level: u8, fields: &LayerFields) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read boundary file: {}", path.display()))?;
        let geojson: GeoJson = text
            .parse()
            .with_context(|| format!("Failed to parse GeoJSON: {}", path.display()))?;
        let layer = Self::from_geojson(&geojson, level, fields)
            .with_context(|| format!("Invalid boundary layer: {}", path.display()))?;
        info!(
            path = %path.display(),
            level,
            features = layer.len(),
            "loaded boundary layer"
        );
        Ok(layer)
    }

    pub fn from_geojson(geojson: &GeoJson, level: u8, fields: &LayerFields) -> Result<Self> {
        let features = match geojson {
            GeoJson::FeatureCollection(fc) => &fc.features,
            _ => anyhow::bail!("Boundary layer must be a FeatureCollection"),
        };

        let mut polygons = Vec::with_capacity(features.len());
        for (idx, feature) in features.iter().enumerate() {
            polygons.push(
                Self::parse_feature(feature, level, fields)
                    .with_context(|| format!("Invalid feature at index {}", idx))?,
            );
        }

        Ok(Self::new(level, polygons)?)
    }

    fn parse_feature(feature: &Feature, level: u8, fields: &LayerFields) -> Result<PolygonFeature> {
        let mut attributes = feature.properties.clone().unwrap_or_default();

        let id = match attributes.shift_remove(&fields.id_field) {
            Some(JsonValue::String(s)) => s,
            Some(JsonValue::Number(n)) => n.to_string(),
            other => anyhow::bail!(
                "Missing or non-scalar `{}` attribute: {:?}",
                fields.id_field,
                other
            ),
        };

        let name = match attributes.shift_remove(&fields.name_field) {
            Some(JsonValue::String(s)) => Some(s),
            Some(JsonValue::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        for field in &fields.drop_fields {
            attributes.shift_remove(field);
        }

        let geometry = feature
            .geometry
            .as_ref()
            .with_context(|| format!("Feature `{}` has no geometry", id))?;
        let geo_geom: GeoGeometry<f64> = geometry
            .try_into()
            .with_context(|| format!("Failed to convert geometry of `{}`", id))?;
        let geometry = match geo_geom {
            GeoGeometry::Polygon(p) => MultiPolygon::new(vec![p]),
            GeoGeometry::MultiPolygon(mp) => mp,
            _ => anyhow::bail!("Feature `{}` is not a polygon or multipolygon", id),
        };

        debug!(id = %id, level, "parsed polygon feature");

        Ok(PolygonFeature {
            id,
            name,
            level,
            geometry,
            attributes,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn features(&self) -> &[PolygonFeature] {
        &self.features
    }

    pub fn iter(&self) -> impl Iterator<Item = &PolygonFeature> {
        self.features.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&PolygonFeature> {
        self.features.get(idx)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Total bounds of every polygon in the layer
    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::total_bounds(self.features.iter().map(|f| &f.geometry))
    }

    /// Names of the attributes left after projection, in first-seen order
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for feature in &self.features {
            for key in feature.attributes.keys() {
                if !names.iter().any(|n| n == key) {
                    names.push(key.clone());
                }
            }
        }
        names
    }
}
