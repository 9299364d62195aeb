use geo::{Area, BooleanOps, BoundingRect, Intersects};
use rstar::{RTree, RTreeObject, AABB};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::geometric::polygon_layer::PolygonLayer;

/// Parent chosen for one fine polygon
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapAssignment {
    pub child_id: String,
    pub parent_id: String,
    /// `area(child ∩ parent) / area(child)`, in `[0, 1]`
    pub overlap_fraction: f64,
}

/// Envelope of a coarse polygon, indexed by its position in the layer
struct ParentEnvelope {
    idx: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for ParentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn build_index(layer: &PolygonLayer) -> RTree<ParentEnvelope> {
    let envelopes = layer
        .iter()
        .enumerate()
        .filter_map(|(idx, feature)| {
            let rect = feature.geometry.bounding_rect()?;
            Some(ParentEnvelope {
                idx,
                envelope: AABB::from_corners(
                    [rect.min().x, rect.min().y],
                    [rect.max().x, rect.max().y],
                ),
            })
        })
        .collect();
    RTree::bulk_load(envelopes)
}

/// Better candidate first: larger fraction, then lower parent id
fn rank(a: &OverlapAssignment, b: &OverlapAssignment) -> Ordering {
    b.overlap_fraction
        .total_cmp(&a.overlap_fraction)
        .then_with(|| a.parent_id.cmp(&b.parent_id))
}

/// Assign every fine polygon the coarse polygon it overlaps most.
///
/// Candidates are coarse polygons that intersect the child at all, touching
/// boundaries included (such a candidate scores 0). On exactly equal
/// fractions the lowest parent id wins, whatever the input order.
///
/// A child without any candidate, or with zero area, is a fatal error.
pub fn resolve(
    fine: &PolygonLayer,
    coarse: &PolygonLayer,
) -> Result<BTreeMap<String, OverlapAssignment>, PipelineError> {
    let index = build_index(coarse);
    let mut assignments = BTreeMap::new();

    for child in fine.iter() {
        let child_area = child.area();
        if child_area <= 0.0 {
            return Err(PipelineError::EmptyGeometry {
                id: child.id.clone(),
            });
        }

        let Some(rect) = child.geometry.bounding_rect() else {
            return Err(PipelineError::EmptyGeometry {
                id: child.id.clone(),
            });
        };
        let search = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);

        let best = index
            .locate_in_envelope_intersecting(&search)
            .filter_map(|cand| coarse.get(cand.idx))
            .filter(|parent| parent.geometry.intersects(&child.geometry))
            .map(|parent| {
                let shared = child.geometry.intersection(&parent.geometry).unsigned_area();
                OverlapAssignment {
                    child_id: child.id.clone(),
                    parent_id: parent.id.clone(),
                    overlap_fraction: (shared / child_area).clamp(0.0, 1.0),
                }
            })
            .inspect(|cand| {
                debug!(
                    child = %cand.child_id,
                    parent = %cand.parent_id,
                    fraction = cand.overlap_fraction,
                    "overlap candidate"
                )
            })
            .min_by(rank)
            .ok_or_else(|| PipelineError::NoParent {
                child_id: child.id.clone(),
            })?;

        assignments.insert(child.id.clone(), best);
    }

    info!(
        children = fine.len(),
        parents = coarse.len(),
        "resolved parent polygons"
    );
    Ok(assignments)
}

/// Fail unless every selected fraction is strictly greater than `min_overlap`.
///
/// All offending children are reported, lowest fraction first.
pub fn enforce_min_overlap(
    assignments: &BTreeMap<String, OverlapAssignment>,
    min_overlap: f64,
) -> Result<(), PipelineError> {
    let mut offenders: Vec<(String, f64)> = assignments
        .values()
        .filter(|a| a.overlap_fraction <= min_overlap)
        .map(|a| (a.child_id.clone(), a.overlap_fraction))
        .collect();

    if offenders.is_empty() {
        let lowest = assignments
            .values()
            .map(|a| a.overlap_fraction)
            .fold(f64::INFINITY, f64::min);
        info!(min_overlap, lowest, "overlap gate passed");
        return Ok(());
    }

    offenders.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Err(PipelineError::OverlapBelowThreshold {
        threshold: min_overlap,
        offenders,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::polygon_layer::PolygonFeature;
    use approx::assert_relative_eq;
    use geo::{MultiPolygon, Rect};

    fn square(id: &str, level: u8, min: (f64, f64), max: (f64, f64)) -> PolygonFeature {
        let rect = Rect::new(min, max);
        PolygonFeature {
            id: id.to_string(),
            name: None,
            level,
            geometry: MultiPolygon::new(vec![rect.to_polygon()]),
            attributes: Default::default(),
        }
    }

    /// Coarse X = [0,6]x[0,10], Y = [6,12]x[0,10]
    fn coarse() -> PolygonLayer {
        PolygonLayer::new(
            1,
            vec![
                square("X", 1, (0.0, 0.0), (6.0, 10.0)),
                square("Y", 1, (6.0, 0.0), (12.0, 10.0)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_scenario_full_and_partial_overlap() {
        // A: area 10 inside X. B: area 10, 6 in X and 4 in Y.
        let fine = PolygonLayer::new(
            2,
            vec![
                square("A", 2, (1.0, 1.0), (3.0, 6.0)),
                square("B", 2, (0.0, 8.0), (10.0, 9.0)),
            ],
        )
        .unwrap();

        let assignments = resolve(&fine, &coarse()).unwrap();
        let a = &assignments["A"];
        assert_eq!(a.parent_id, "X");
        assert_relative_eq!(a.overlap_fraction, 1.0, epsilon = 1e-9);

        let b = &assignments["B"];
        assert_eq!(b.parent_id, "X");
        assert_relative_eq!(b.overlap_fraction, 0.6, epsilon = 1e-9);

        assert!(enforce_min_overlap(&assignments, 0.5).is_ok());
    }

    #[test]
    fn test_selected_parent_has_maximal_fraction() {
        let fine = PolygonLayer::new(2, vec![square("C", 2, (4.0, 2.0), (10.0, 3.0))]).unwrap();
        let coarse = coarse();
        let assignments = resolve(&fine, &coarse).unwrap();
        let c = &assignments["C"];
        assert_eq!(c.parent_id, "Y");

        let child = fine.get(0).unwrap();
        for parent in coarse.iter() {
            let fraction =
                child.geometry.intersection(&parent.geometry).unsigned_area() / child.area();
            assert!(fraction <= c.overlap_fraction + 1e-12);
        }
    }

    #[test]
    fn test_touching_parent_is_candidate_but_loses() {
        // Fully inside Y, sharing its left edge with X
        let fine = PolygonLayer::new(2, vec![square("D", 2, (6.0, 1.0), (8.0, 2.0))]).unwrap();
        let assignments = resolve(&fine, &coarse()).unwrap();
        assert_eq!(assignments["D"].parent_id, "Y");
        assert_relative_eq!(assignments["D"].overlap_fraction, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tie_breaks_on_lowest_parent_id() {
        // Exactly half in X, half in Y; coarse layer listed Y first
        let coarse = PolygonLayer::new(
            1,
            vec![
                square("Y", 1, (6.0, 0.0), (12.0, 10.0)),
                square("X", 1, (0.0, 0.0), (6.0, 10.0)),
            ],
        )
        .unwrap();
        let fine = PolygonLayer::new(2, vec![square("E", 2, (5.0, 1.0), (7.0, 2.0))]).unwrap();
        let assignments = resolve(&fine, &coarse).unwrap();
        assert_eq!(assignments["E"].parent_id, "X");
        assert_relative_eq!(assignments["E"].overlap_fraction, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_orphan_child_fails_fast() {
        let fine = PolygonLayer::new(2, vec![square("F", 2, (20.0, 20.0), (21.0, 21.0))]).unwrap();
        let err = resolve(&fine, &coarse()).unwrap_err();
        assert!(matches!(err, PipelineError::NoParent { ref child_id } if child_id == "F"));
    }

    #[test]
    fn test_zero_area_child_is_rejected() {
        // Collinear ring inside X
        let flat = geo::Polygon::new(
            geo::LineString::from(vec![(1.0, 1.0), (2.0, 2.0), (3.0, 3.0), (1.0, 1.0)]),
            vec![],
        );
        let degenerate = PolygonFeature {
            geometry: MultiPolygon::new(vec![flat]),
            ..square("D", 2, (0.0, 0.0), (1.0, 1.0))
        };
        let fine = PolygonLayer::new(2, vec![degenerate]).unwrap();
        let err = resolve(&fine, &coarse()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyGeometry { ref id } if id == "D"));

        let empty = PolygonFeature {
            geometry: MultiPolygon::new(vec![]),
            ..square("Z", 2, (0.0, 0.0), (1.0, 1.0))
        };
        let fine = PolygonLayer::new(2, vec![empty]).unwrap();
        let err = resolve(&fine, &coarse()).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyGeometry { ref id } if id == "Z"));
    }

    #[test]
    fn test_gate_rejects_half_overlap() {
        let fine = PolygonLayer::new(
            2,
            vec![
                square("A", 2, (1.0, 1.0), (3.0, 6.0)),
                square("E", 2, (5.0, 1.0), (7.0, 2.0)),
            ],
        )
        .unwrap();
        let assignments = resolve(&fine, &coarse()).unwrap();
        let err = enforce_min_overlap(&assignments, 0.5).unwrap_err();
        match err {
            PipelineError::OverlapBelowThreshold { offenders, threshold } => {
                assert_eq!(threshold, 0.5);
                assert_eq!(offenders.len(), 1);
                assert_eq!(offenders[0].0, "E");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
