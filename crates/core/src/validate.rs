//! Validity checks for tile-space geometry.
//!
//! A tile geometry is valid when it can be rendered without ambiguity:
//! - every coordinate is finite
//! - lines have at least 2 points
//! - polygon rings are closed, have at least 3 distinct points and non-zero area
//! - no ring touches or crosses itself (bowties, spikes, folded-back edges)
//! - no two rings of the same polygonal geometry cross each other
//!
//! The transform uses this to decide whether a repair is needed; the encoder
//! uses it for the invalid-geometry policy.
//!
//! # Usage
//!
//! ```
//! use featuretiles_core::validate::is_valid_geometry;
//! use geo::{polygon, Geometry};
//!
//! let bowtie = polygon![
//!     (x: 0.0, y: 0.0),
//!     (x: 10.0, y: 10.0),
//!     (x: 10.0, y: 0.0),
//!     (x: 0.0, y: 10.0),
//! ];
//! assert!(!is_valid_geometry(&Geometry::Polygon(bowtie)));
//! ```

use geo::line_intersection::{line_intersection, LineIntersection};
use geo::{Coord, Geometry, Line, LineString, Polygon};

/// Minimum number of points for a valid polygon ring (3 unique + closing = 4)
pub const MIN_POLYGON_RING_POINTS: usize = 4;

/// Minimum number of points for a valid linestring
pub const MIN_LINESTRING_POINTS: usize = 2;

/// Rings with an absolute area below this are degenerate.
pub const MIN_RING_AREA: f64 = 1e-10;

/// Result of geometry validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid(InvalidReason),
}

/// Reason why a geometry is invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// Geometry is empty (no coordinates)
    EmptyGeometry,
    /// A coordinate is NaN or infinite
    NonFiniteCoordinate,
    LineStringTooFewPoints { point_count: usize },
    /// Polygon ring has fewer than 4 points
    PolygonTooFewPoints { ring_index: usize, point_count: usize },
    UnclosedRing { ring_index: usize },
    /// Ring encloses no area (collinear or coincident points)
    ZeroAreaRing { ring_index: usize },
    /// Ring crosses or touches itself
    RingSelfIntersection { ring_index: usize },
    /// Two rings cross each other or share an edge
    RingsIntersect { first: usize, second: usize },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn is_invalid(&self) -> bool {
        !self.is_valid()
    }
}

/// Check if a geometry is valid.
pub fn is_valid_geometry(geom: &Geometry<f64>) -> bool {
    validate_geometry(geom).is_valid()
}

/// Validate a geometry and return the first problem found.
pub fn validate_geometry(geom: &Geometry<f64>) -> ValidationResult {
    match validate_inner(geom) {
        Ok(()) => ValidationResult::Valid,
        Err(reason) => ValidationResult::Invalid(reason),
    }
}

fn validate_inner(geom: &Geometry<f64>) -> Result<(), InvalidReason> {
    match geom {
        Geometry::Point(p) => check_finite(std::iter::once(p.0)),
        Geometry::MultiPoint(mp) => {
            if mp.0.is_empty() {
                return Err(InvalidReason::EmptyGeometry);
            }
            check_finite(mp.0.iter().map(|p| p.0))
        }
        Geometry::LineString(ls) => validate_linestring(ls),
        Geometry::MultiLineString(mls) => {
            if mls.0.is_empty() {
                return Err(InvalidReason::EmptyGeometry);
            }
            mls.0.iter().try_for_each(validate_linestring)
        }
        Geometry::Polygon(poly) => validate_polygons(std::slice::from_ref(poly)),
        Geometry::MultiPolygon(mp) => {
            if mp.0.is_empty() {
                return Err(InvalidReason::EmptyGeometry);
            }
            validate_polygons(&mp.0)
        }
        Geometry::GeometryCollection(gc) => {
            if gc.0.is_empty() {
                return Err(InvalidReason::EmptyGeometry);
            }
            gc.0.iter().try_for_each(validate_inner)
        }
        Geometry::Line(line) => check_finite([line.start, line.end].into_iter()),
        Geometry::Rect(rect) => check_finite([rect.min(), rect.max()].into_iter()),
        Geometry::Triangle(tri) => check_finite(tri.to_array().into_iter()),
    }
}

fn check_finite(mut coords: impl Iterator<Item = Coord<f64>>) -> Result<(), InvalidReason> {
    if coords.all(|c| c.x.is_finite() && c.y.is_finite()) {
        Ok(())
    } else {
        Err(InvalidReason::NonFiniteCoordinate)
    }
}

fn validate_linestring(ls: &LineString<f64>) -> Result<(), InvalidReason> {
    let point_count = ls.0.len();
    if point_count < MIN_LINESTRING_POINTS {
        return Err(InvalidReason::LineStringTooFewPoints { point_count });
    }
    check_finite(ls.0.iter().copied())
}

/// Validate polygons and the interaction of all their rings.
///
/// Ring indices count across all polygons, exterior first.
fn validate_polygons(polygons: &[Polygon<f64>]) -> Result<(), InvalidReason> {
    let rings: Vec<&LineString<f64>> = polygons
        .iter()
        .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()))
        .collect();

    for (ring_index, ring) in rings.iter().enumerate() {
        validate_ring(ring, ring_index)?;
    }

    for first in 0..rings.len() {
        for second in (first + 1)..rings.len() {
            if rings_intersect(rings[first], rings[second]) {
                return Err(InvalidReason::RingsIntersect { first, second });
            }
        }
    }

    Ok(())
}

fn validate_ring(ring: &LineString<f64>, ring_index: usize) -> Result<(), InvalidReason> {
    let coords = &ring.0;
    if coords.len() < MIN_POLYGON_RING_POINTS {
        return Err(InvalidReason::PolygonTooFewPoints {
            ring_index,
            point_count: coords.len(),
        });
    }
    check_finite(coords.iter().copied())?;
    if !ring.is_closed() {
        return Err(InvalidReason::UnclosedRing { ring_index });
    }
    if ring_signed_area(coords).abs() < MIN_RING_AREA {
        return Err(InvalidReason::ZeroAreaRing { ring_index });
    }
    if has_spike(coords) || has_fold_back(coords) || has_self_intersection(coords) {
        return Err(InvalidReason::RingSelfIntersection { ring_index });
    }
    Ok(())
}

/// Shoelace area of a closed ring; positive when the ring turns from +x towards +y.
pub fn ring_signed_area(coords: &[Coord<f64>]) -> f64 {
    if coords.len() < 3 {
        return 0.0;
    }
    coords
        .windows(2)
        .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
        .sum::<f64>()
        / 2.0
}

/// A vertex that appears twice at non-adjacent positions (ring touches itself).
fn has_spike(coords: &[Coord<f64>]) -> bool {
    // Exclude the closing point, which repeats the first vertex
    let n = coords.len() - 1;
    for i in 0..n {
        for j in (i + 2)..n {
            if i == 0 && j == n - 1 {
                continue;
            }
            if coords[i] == coords[j] {
                return true;
            }
        }
    }
    false
}

/// Two consecutive edges running back over each other (A → B → A', collinear).
fn has_fold_back(coords: &[Coord<f64>]) -> bool {
    let n = coords.len() - 1;
    (0..n).any(|i| {
        let prev = coords[(i + n - 1) % n];
        let curr = coords[i];
        let next = coords[(i + 1) % n];
        let a = prev - curr;
        let b = next - curr;
        let cross = a.x * b.y - a.y * b.x;
        let dot = a.x * b.x + a.y * b.y;
        let non_degenerate = (a.x != 0.0 || a.y != 0.0) && (b.x != 0.0 || b.y != 0.0);
        non_degenerate && cross == 0.0 && dot > 0.0
    })
}

/// Any pair of non-adjacent edges that cross or overlap.
fn has_self_intersection(coords: &[Coord<f64>]) -> bool {
    let num_edges = coords.len() - 1;
    for i in 0..num_edges {
        let edge_i = Line::new(coords[i], coords[i + 1]);
        for j in (i + 2)..num_edges {
            if i == 0 && j == num_edges - 1 {
                continue;
            }
            let edge_j = Line::new(coords[j], coords[j + 1]);
            match line_intersection(edge_i, edge_j) {
                Some(LineIntersection::SinglePoint { intersection, .. }) => {
                    let at_i_end = intersection == edge_i.start || intersection == edge_i.end;
                    let at_j_end = intersection == edge_j.start || intersection == edge_j.end;
                    if !(at_i_end && at_j_end) {
                        return true;
                    }
                }
                Some(LineIntersection::Collinear { .. }) => return true,
                None => {}
            }
        }
    }
    false
}

/// Proper crossings or shared edge segments between two rings.
///
/// Touching at a single vertex is allowed.
fn rings_intersect(a: &LineString<f64>, b: &LineString<f64>) -> bool {
    use geo::BoundingRect;
    use geo::Intersects;

    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) if ra.intersects(&rb) => {}
        _ => return false,
    }

    a.lines().any(|ea| {
        b.lines().any(|eb| match line_intersection(ea, eb) {
            Some(LineIntersection::SinglePoint { is_proper, .. }) => is_proper,
            Some(LineIntersection::Collinear { intersection }) => intersection.start != intersection.end,
            None => false,
        })
    })
}
