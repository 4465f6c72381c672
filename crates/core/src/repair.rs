//! Repair of invalid polygonal tile geometry.
//!
//! Strategies are tried in a fixed order and the first result that is valid
//! and keeps the area within tolerance wins:
//!
//! 1. zero-width buffer (re-node all rings, non-zero fill)
//! 2. rebuild from rings: polygonize each ring, recombine by symmetric difference
//! 3. union of all polygon parts
//! 4. convex hull
//! 5. area-preserving simplification at the grid tolerance
//!
//! When nothing works the caller keeps the unrepaired geometry.

use std::fmt;

use geo::{Area, ConvexHull, Geometry, MultiPolygon, Polygon};
use i_overlay::core::fill_rule::FillRule;
use i_overlay::core::overlay_rule::OverlayRule;

use crate::config::TilingParameters;
use crate::overlay;
use crate::precision::to_multipolygon;
use crate::simplify::simplify_area_preserving;
use crate::validate::is_valid_geometry;

/// How much a geometry operation may change polygon area.
///
/// A change is accepted when it passes either the relative or the absolute
/// threshold. A zero original area always fails the relative test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AreaTolerance {
    pub max_relative: f64,
    pub max_absolute: f64,
}

impl AreaTolerance {
    pub fn new(max_relative: f64, max_absolute: f64) -> Self {
        Self {
            max_relative,
            max_absolute,
        }
    }

    pub fn from_parameters(params: &TilingParameters) -> Self {
        Self::new(params.max_relative_area_change, params.max_absolute_area_change)
    }

    pub fn accepts(&self, original_area: f64, new_area: f64) -> bool {
        let delta = (new_area - original_area).abs();
        let relative_ok = original_area > 0.0 && delta / original_area <= self.max_relative;
        relative_ok || delta <= self.max_absolute
    }
}

/// Repair strategies in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStrategy {
    ZeroWidthBuffer,
    RebuildFromRings,
    Union,
    ConvexHull,
    AreaPreservingSimplify,
}

impl RepairStrategy {
    pub const ORDER: [RepairStrategy; 5] = [
        RepairStrategy::ZeroWidthBuffer,
        RepairStrategy::RebuildFromRings,
        RepairStrategy::Union,
        RepairStrategy::ConvexHull,
        RepairStrategy::AreaPreservingSimplify,
    ];

    fn apply(&self, mp: &MultiPolygon<f64>, grid_size: f64) -> Geometry<f64> {
        match self {
            RepairStrategy::ZeroWidthBuffer => {
                Geometry::MultiPolygon(overlay::resolve(mp, FillRule::NonZero))
            }
            RepairStrategy::RebuildFromRings => Geometry::MultiPolygon(rebuild_from_rings(mp)),
            RepairStrategy::Union => Geometry::MultiPolygon(union_parts(mp)),
            RepairStrategy::ConvexHull => Geometry::Polygon(mp.convex_hull()),
            RepairStrategy::AreaPreservingSimplify => {
                simplify_area_preserving(&Geometry::MultiPolygon(mp.clone()), grid_size)
            }
        }
    }
}

impl fmt::Display for RepairStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairStrategy::ZeroWidthBuffer => "zero-width buffer",
            RepairStrategy::RebuildFromRings => "rebuild from rings",
            RepairStrategy::Union => "union",
            RepairStrategy::ConvexHull => "convex hull",
            RepairStrategy::AreaPreservingSimplify => "area-preserving simplify",
        };
        f.write_str(name)
    }
}

/// A successful repair
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub geometry: Geometry<f64>,
    pub strategy: RepairStrategy,
}

/// Try each strategy in turn on a polygonal geometry.
///
/// Returns `None` for non-polygonal input or when no strategy produced a
/// valid, non-empty result within `tolerance`.
pub fn repair(geom: &Geometry<f64>, tolerance: &AreaTolerance, grid_size: f64) -> Option<Repaired> {
    if !matches!(geom, Geometry::Polygon(_) | Geometry::MultiPolygon(_)) {
        return None;
    }
    let mp = to_multipolygon(geom);
    let original_area = geom.unsigned_area();

    for strategy in RepairStrategy::ORDER {
        let candidate = strategy.apply(&mp, grid_size);
        if is_empty_polygonal(&candidate) || !is_valid_geometry(&candidate) {
            log::trace!("repair via {strategy}: invalid result");
            continue;
        }
        let area = candidate.unsigned_area();
        if !tolerance.accepts(original_area, area) {
            log::trace!("repair via {strategy}: area {original_area} -> {area} out of tolerance");
            continue;
        }
        log::trace!("repaired polygon via {strategy}");
        return Some(Repaired {
            geometry: candidate,
            strategy,
        });
    }

    None
}

fn is_empty_polygonal(geom: &Geometry<f64>) -> bool {
    match geom {
        Geometry::MultiPolygon(mp) => mp.0.is_empty(),
        Geometry::Polygon(poly) => poly.exterior().0.is_empty(),
        _ => true,
    }
}

/// Polygonize every ring on its own, then combine them with symmetric difference.
///
/// Holes cut out of the shell they sit in; overlapping shells cancel out.
fn rebuild_from_rings(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    mp.0.iter()
        .flat_map(|poly| std::iter::once(poly.exterior()).chain(poly.interiors()))
        .map(|ring| {
            let shell = MultiPolygon::new(vec![Polygon::new(ring.clone(), vec![])]);
            overlay::resolve(&shell, FillRule::EvenOdd)
        })
        .fold(MultiPolygon::new(vec![]), |acc, part| {
            if acc.0.is_empty() {
                part
            } else {
                overlay::overlay(&acc, &part, OverlayRule::Xor)
            }
        })
}

/// Union of every polygon part, each resolved on its own first.
fn union_parts(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    mp.0.iter()
        .map(|poly| overlay::resolve(&MultiPolygon::new(vec![poly.clone()]), FillRule::EvenOdd))
        .fold(MultiPolygon::new(vec![]), |acc, part| {
            if acc.0.is_empty() {
                part
            } else {
                overlay::overlay(&acc, &part, OverlayRule::Union)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, polygon};

    fn tolerance() -> AreaTolerance {
        AreaTolerance::from_parameters(&TilingParameters::default())
    }

    // =========================================================================
    // AREA TOLERANCE
    // =========================================================================

    #[test]
    fn test_relative_or_absolute_suffices() {
        let t = AreaTolerance::new(0.1, 1.0);
        // 5% change, 50 units absolute
        assert!(t.accepts(1000.0, 1050.0));
        // 50% change but only 0.5 units absolute
        assert!(t.accepts(1.0, 1.5));
        // fails both
        assert!(!t.accepts(100.0, 150.0));
    }

    #[test]
    fn test_zero_original_area_uses_absolute_only() {
        let t = AreaTolerance::new(10.0, 1.0);
        assert!(t.accepts(0.0, 0.5));
        assert!(!t.accepts(0.0, 2.0));
    }

    // =========================================================================
    // REPAIR CHAIN
    // =========================================================================

    #[test]
    fn test_spike_repaired_by_zero_width_buffer() {
        let spike = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 4.0, y: 0.0),
            (x: 4.0, y: 4.0),
            (x: 2.0, y: 4.0),
            (x: 2.0, y: 6.0),
            (x: 2.0, y: 4.0),
            (x: 0.0, y: 4.0),
        ]);
        assert!(!is_valid_geometry(&spike));

        let repaired = repair(&spike, &tolerance(), 0.0625).unwrap();
        assert_eq!(repaired.strategy, RepairStrategy::ZeroWidthBuffer);
        assert!(is_valid_geometry(&repaired.geometry));
        assert!((repaired.geometry.unsigned_area() - 16.0).abs() < 1e-6);
    }

    #[test]
    fn test_twisted_notch_repaired_within_tolerance() {
        // Square whose left edge twists into a small self-crossing loop
        let twisted = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 6.0),
            (x: 0.5, y: 4.0),
            (x: 0.5, y: 6.0),
            (x: 0.0, y: 4.0),
        ]);
        assert!(!is_valid_geometry(&twisted));

        let t = tolerance();
        let repaired = repair(&twisted, &t, 0.0625).unwrap();
        assert_eq!(repaired.strategy, RepairStrategy::ZeroWidthBuffer);
        assert!(is_valid_geometry(&repaired.geometry));
        assert!(t.accepts(twisted.unsigned_area(), repaired.geometry.unsigned_area()));
    }

    #[test]
    fn test_symmetric_bowtie_rejected_by_area_tolerance() {
        // Shoelace area is zero, every repair gains 50 units
        let bowtie = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 10.0),
        ]);
        assert!(repair(&bowtie, &tolerance(), 0.0625).is_none());
    }

    #[test]
    fn test_lines_are_not_repaired() {
        let line = Geometry::LineString(geo::line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]);
        assert!(repair(&line, &tolerance(), 0.0625).is_none());
    }

    #[test]
    fn test_rebuild_from_rings_cuts_hole() {
        let poly = polygon!(
            exterior: [(x: 0.0, y: 0.0), (x: 10.0, y: 0.0), (x: 10.0, y: 10.0), (x: 0.0, y: 10.0)],
            interiors: [[(x: 2.0, y: 2.0), (x: 4.0, y: 2.0), (x: 4.0, y: 4.0), (x: 2.0, y: 4.0)]],
        );
        let rebuilt = rebuild_from_rings(&MultiPolygon::new(vec![poly]));
        assert!((rebuilt.unsigned_area() - 96.0).abs() < 1e-6);
    }

    #[test]
    fn test_union_parts_merges_overlaps() {
        let a = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)];
        let b = polygon![(x: 1.0, y: 1.0), (x: 3.0, y: 1.0), (x: 3.0, y: 3.0), (x: 1.0, y: 3.0)];
        let union = union_parts(&MultiPolygon::new(vec![a, b]));
        assert!((union.unsigned_area() - 7.0).abs() < 1e-6);
    }
}
