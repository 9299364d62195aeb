use anyhow::Result;
use geo::{BoundingRect, Coord, Line, MultiPolygon};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::geo_core::BoundingBox;
use crate::geometric::raster::{CategoricalRaster, GeoTransform};

/// Label of the bucket collecting codes missing from the category map
pub const UNMAPPED_LABEL: &str = "unmapped";

/// Raster code -> category label, ordered by code
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMap {
    entries: Vec<(i64, String)>,
}

impl CategoryMap {
    /// Invert a `label -> code` table. Codes must be unique.
    pub fn from_label_codes(label_codes: &BTreeMap<String, i64>) -> Result<Self> {
        let mut entries: Vec<(i64, String)> = label_codes
            .iter()
            .map(|(label, &code)| (code, label.clone()))
            .collect();
        entries.sort();

        for pair in entries.windows(2) {
            anyhow::ensure!(
                pair[0].0 != pair[1].0,
                "Category code {} is used by both `{}` and `{}`",
                pair[0].0,
                pair[0].1,
                pair[1].1
            );
        }
        if let Some((_, label)) = entries.iter().find(|(_, l)| l == UNMAPPED_LABEL) {
            anyhow::bail!("Category label `{}` is reserved", label);
        }
        anyhow::ensure!(!entries.is_empty(), "Category map is empty");

        Ok(CategoryMap { entries })
    }

    pub fn label(&self, code: i64) -> Option<&str> {
        self.index_of(code).map(|i| self.entries[i].1.as_str())
    }

    fn index_of(&self, code: i64) -> Option<usize> {
        self.entries.binary_search_by_key(&code, |(c, _)| *c).ok()
    }

    /// Labels in code order, the order of the output columns
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, l)| l.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Which pixels belong to a polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelInclusion {
    /// Every pixel whose footprint intersects the polygon, touching included
    #[default]
    AllTouched,
    /// Only pixels whose center lies inside the polygon
    CenterInside,
}

/// Pixel counts of one polygon, one entry per mapped label
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryCounts {
    counts: Vec<(String, u64)>,
    unmapped: u64,
    unmapped_codes: BTreeSet<i64>,
}

impl CategoryCounts {
    /// All-zero counts for every label of `category_map`
    pub fn zeros(category_map: &CategoryMap) -> Self {
        CategoryCounts {
            counts: category_map.labels().map(|l| (l.to_string(), 0)).collect(),
            unmapped: 0,
            unmapped_codes: BTreeSet::new(),
        }
    }

    fn add(&mut self, category_map: &CategoryMap, code: i64) {
        match category_map.index_of(code) {
            Some(i) => self.counts[i].1 += 1,
            None => {
                self.unmapped += 1;
                self.unmapped_codes.insert(code);
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<u64> {
        if label == UNMAPPED_LABEL {
            return Some(self.unmapped);
        }
        self.counts.iter().find(|(l, _)| l == label).map(|(_, c)| *c)
    }

    /// Mapped labels and their counts, in code order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(l, c)| (l.as_str(), *c))
    }

    pub fn unmapped(&self) -> u64 {
        self.unmapped
    }

    pub fn unmapped_codes(&self) -> &BTreeSet<i64> {
        &self.unmapped_codes
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, c)| c).sum::<u64>() + self.unmapped
    }
}

/// Count the pixels of each category inside `geometry`.
///
/// Nodata pixels are never counted. Codes absent from `category_map` land in
/// the `unmapped` bucket. A polygon that misses the raster gets all zeros.
pub fn zonal_categorical_count(
    geometry: &MultiPolygon<f64>,
    raster: &CategoricalRaster,
    category_map: &CategoryMap,
    inclusion: PixelInclusion,
) -> CategoryCounts {
    let mut counts = CategoryCounts::zeros(category_map);

    let Some(rect) = geometry.bounding_rect() else {
        return counts;
    };
    let bbox = BoundingBox::from_rect(rect);
    if !bbox.intersects(&raster.bounds()) {
        debug!(raster = raster.id(), "polygon outside raster extent");
        return counts;
    }

    for_each_covered_pixel(
        geometry,
        &bbox,
        raster.transform(),
        raster.width(),
        raster.height(),
        inclusion,
        |row, col| {
            if let Some(value) = raster.get(row, col) {
                if !raster.is_nodata(value) {
                    counts.add(category_map, value);
                }
            }
        },
    );
    counts
}

/// Scanline walk over the pixels a polygon covers.
///
/// Pixels crossed by a ring are collected from the clipped edges of each row
/// band; interior pixels from even-odd crossings at the row's center line.
fn for_each_covered_pixel<F>(
    geometry: &MultiPolygon<f64>,
    bbox: &BoundingBox,
    transform: &GeoTransform,
    width: usize,
    height: usize,
    inclusion: PixelInclusion,
    mut visit: F,
) where
    F: FnMut(usize, usize),
{
    let edges: Vec<Line<f64>> = geometry
        .iter()
        .flat_map(|polygon| std::iter::once(polygon.exterior()).chain(polygon.interiors()))
        .flat_map(|ring| ring.lines())
        .collect();

    let (row0, row1, col0, col1) = transform.pixel_window(bbox, width, height);
    if row0 >= row1 || col0 >= col1 {
        return;
    }

    let x0 = transform.origin_x;
    let dx = transform.pixel_width;
    let mut covered = vec![false; col1 - col0];
    let mut crossings: Vec<f64> = Vec::new();

    for row in row0..row1 {
        covered.iter_mut().for_each(|c| *c = false);

        let y_a = transform.origin_y + row as f64 * transform.pixel_height;
        let y_b = y_a + transform.pixel_height;
        let (lo, hi) = (y_a.min(y_b), y_a.max(y_b));

        let mut mark = |c_min: f64, c_max: f64| {
            let first = c_min.max(col0 as f64);
            let last = c_max.min((col1 - 1) as f64);
            if first > last {
                return;
            }
            for col in first as usize..=last as usize {
                covered[col - col0] = true;
            }
        };

        if inclusion == PixelInclusion::AllTouched {
            for edge in &edges {
                if let Some((xa, xb)) = clip_to_band(edge, lo, hi) {
                    mark(((xa - x0) / dx - 1.0).ceil(), ((xb - x0) / dx).floor());
                }
            }
        }

        let yc = (lo + hi) / 2.0;
        crossings.clear();
        crossings.extend(edges.iter().filter_map(|e| crossing_at(e, yc)));
        crossings.sort_by(f64::total_cmp);
        for pair in crossings.chunks_exact(2) {
            mark(
                ((pair[0] - x0) / dx - 0.5).ceil(),
                ((pair[1] - x0) / dx - 0.5).floor(),
            );
        }

        for (offset, _) in covered.iter().enumerate().filter(|(_, c)| **c) {
            visit(row, col0 + offset);
        }
    }
}

/// X range of the part of `edge` lying in the closed band `lo <= y <= hi`
fn clip_to_band(edge: &Line<f64>, lo: f64, hi: f64) -> Option<(f64, f64)> {
    let (a, b) = (edge.start, edge.end);
    if a.y == b.y {
        return (lo <= a.y && a.y <= hi).then(|| (a.x.min(b.x), a.x.max(b.x)));
    }
    let t_lo = (lo - a.y) / (b.y - a.y);
    let t_hi = (hi - a.y) / (b.y - a.y);
    let t_start = t_lo.min(t_hi).max(0.0);
    let t_end = t_lo.max(t_hi).min(1.0);
    if t_start > t_end {
        return None;
    }
    let at = |t: f64| a.x + t * (b.x - a.x);
    let (xa, xb) = (at(t_start), at(t_end));
    Some((xa.min(xb), xa.max(xb)))
}

/// X where `edge` crosses the horizontal line `y`, half-open on the upper end
fn crossing_at(edge: &Line<f64>, y: f64) -> Option<f64> {
    let (a, b): (Coord<f64>, Coord<f64>) = (edge.start, edge.end);
    if (a.y <= y) == (b.y <= y) {
        return None;
    }
    Some(a.x + (y - a.y) * (b.x - a.x) / (b.y - a.y))
}
