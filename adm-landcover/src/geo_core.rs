use geo::{BoundingRect, Coord, LineString, MultiPolygon, Polygon, Rect};
use tracing::warn;

use crate::error::PipelineError;

/// Coordinate reference system shared by every layer of a run
///
/// The pipeline never reprojects: boundaries and rasters must already be in
/// the same CRS, and `GeoCore` is the single place that check happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoCore {
    /// EPSG code of the run (4326 for geoBoundaries and ESA CCI)
    pub epsg: u32,
}

impl GeoCore {
    pub fn new(epsg: u32) -> Self {
        GeoCore { epsg }
    }

    pub fn get_epsg(&self) -> u32 {
        self.epsg
    }

    /// Check that a raster is aligned with the polygon CRS
    ///
    /// A raster without CRS information is accepted with a warning.
    pub fn check_raster_crs(&self, raster_id: &str, found: Option<u32>) -> Result<(), PipelineError> {
        match found {
            Some(epsg) if epsg != self.epsg => Err(PipelineError::CrsMismatch {
                raster_id: raster_id.to_string(),
                found: epsg,
                expected: self.epsg,
            }),
            Some(_) => Ok(()),
            None => {
                warn!(
                    raster_id,
                    expected = self.epsg,
                    "raster carries no EPSG code, assuming it matches the polygons"
                );
                Ok(())
            }
        }
    }
}

impl Default for GeoCore {
    fn default() -> Self {
        GeoCore::new(4326)
    }
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64, // min longitude
    pub min_y: f64, // min latitude
    pub max_x: f64, // max longitude
    pub max_y: f64, // max latitude
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_rect(rect: Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    /// Total bounds of a set of geometries, `None` when all are empty
    pub fn total_bounds<'a, I>(geometries: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a MultiPolygon<f64>>,
    {
        geometries
            .into_iter()
            .filter_map(|g| g.bounding_rect())
            .map(BoundingBox::from_rect)
            .reduce(|a, b| a.union(&b))
    }

    pub fn union(&self, other: &BoundingBox) -> Self {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// True when the boxes share at least one point (touching edges count)
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Ring in the same vertex order as shapely's `box()`
    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                Coord { x: self.max_x, y: self.min_y },
                Coord { x: self.max_x, y: self.max_y },
                Coord { x: self.min_x, y: self.max_y },
                Coord { x: self.min_x, y: self.min_y },
                Coord { x: self.max_x, y: self.min_y },
            ]),
            vec![],
        )
    }

    /// WKT polygon of the box, stored as `spatial_extent` in boundary metadata
    pub fn to_wkt(&self) -> String {
        let ring = self
            .to_polygon()
            .exterior()
            .coords()
            .map(|c| format!("{} {}", c.x, c.y))
            .collect::<Vec<_>>()
            .join(", ");
        format!("POLYGON (({}))", ring)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    #[test]
    fn test_geo_core_default() {
        let gc = GeoCore::default();
        assert_eq!(gc.get_epsg(), 4326);
    }

    #[test]
    fn test_check_raster_crs() {
        let gc = GeoCore::new(4326);
        assert!(gc.check_raster_crs("esa_lc_2020", Some(4326)).is_ok());
        assert!(gc.check_raster_crs("esa_lc_2020", None).is_ok());
        let err = gc.check_raster_crs("esa_lc_2020", Some(3857)).unwrap_err();
        assert!(err.to_string().contains("esa_lc_2020"));
    }

    #[test]
    fn test_bounding_box() {
        let bbox: BoundingBox = BoundingBox::new(0.0, 0.0, 1.0, 1.0);
        assert_eq!(bbox.min_x, 0.0);
        assert_eq!(bbox.max_x, 1.0);
        assert!(bbox.intersects(&BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert!(!bbox.intersects(&BoundingBox::new(1.5, 0.0, 2.0, 1.0)));
    }

    #[test]
    fn test_total_bounds() {
        let a: MultiPolygon<f64> = polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)
        ]
        .into();
        let b: MultiPolygon<f64> = polygon![
            (x: 3.0, y: -2.0), (x: 4.0, y: -2.0), (x: 4.0, y: 0.5), (x: 3.0, y: -2.0)
        ]
        .into();
        let bbox = BoundingBox::total_bounds([&a, &b]).unwrap();
        assert_eq!(bbox, BoundingBox::new(0.0, -2.0, 4.0, 1.0));
        assert!(BoundingBox::total_bounds(std::iter::empty()).is_none());
    }

    #[test]
    fn test_to_wkt() {
        let bbox = BoundingBox::new(-3.5, 4.5, 1.5, 11.5);
        assert_eq!(
            bbox.to_wkt(),
            "POLYGON ((1.5 4.5, 1.5 11.5, -3.5 11.5, -3.5 4.5, 1.5 4.5))"
        );
    }
}
