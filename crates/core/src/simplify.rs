//! Line simplification in tile pixel space.
//!
//! Geometry is simplified after it has been transformed into tile-local pixel
//! coordinates, so the tolerance is a fixed number of grid units at every zoom
//! level and latitude.
//!
//! Two flavours are used by the transform:
//! - [`simplify_preserving_topology`]: Douglas-Peucker per ring/line, falling back to
//!   topology-preserving Visvalingam-Whyatt when Douglas-Peucker would make a
//!   valid polygon invalid
//! - [`simplify_area_preserving`]: plain Visvalingam-Whyatt, used as the last
//!   resort of the repair chain

use geo::{Geometry, LineString, MultiLineString, Simplify, SimplifyVw, SimplifyVwPreserve};

use crate::validate::{is_valid_geometry, MIN_LINESTRING_POINTS};

/// Simplify lines and polygons without introducing self-intersections.
///
/// `tolerance` is a distance in pixels. Points pass through unchanged.
pub fn simplify_preserving_topology(geom: &Geometry<f64>, tolerance: f64) -> Geometry<f64> {
    if tolerance <= 0.0 {
        return geom.clone();
    }

    match geom {
        Geometry::LineString(ls) => Geometry::LineString(simplify_line(ls, tolerance)),
        Geometry::MultiLineString(mls) => Geometry::MultiLineString(MultiLineString::new(
            mls.0.iter().map(|ls| simplify_line(ls, tolerance)).collect(),
        )),
        Geometry::Polygon(poly) => keep_valid(geom, Geometry::Polygon(poly.simplify(&tolerance)), || {
            Geometry::Polygon(poly.simplify_vw_preserve(&(tolerance * tolerance)))
        }),
        Geometry::MultiPolygon(mp) => {
            keep_valid(geom, Geometry::MultiPolygon(mp.simplify(&tolerance)), || {
                Geometry::MultiPolygon(mp.simplify_vw_preserve(&(tolerance * tolerance)))
            })
        }
        other => other.clone(),
    }
}

/// Visvalingam-Whyatt simplification that removes vertices by triangle area.
///
/// `tolerance` is a distance in pixels; the area threshold is its square.
pub fn simplify_area_preserving(geom: &Geometry<f64>, tolerance: f64) -> Geometry<f64> {
    let area_tolerance = tolerance * tolerance;
    match geom {
        Geometry::LineString(ls) => Geometry::LineString(ls.simplify_vw(&area_tolerance)),
        Geometry::MultiLineString(mls) => Geometry::MultiLineString(mls.simplify_vw(&area_tolerance)),
        Geometry::Polygon(poly) => Geometry::Polygon(poly.simplify_vw(&area_tolerance)),
        Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(mp.simplify_vw(&area_tolerance)),
        other => other.clone(),
    }
}

/// Use `fallback` when simplification made a valid polygon invalid.
fn keep_valid(
    original: &Geometry<f64>,
    simplified: Geometry<f64>,
    fallback: impl FnOnce() -> Geometry<f64>,
) -> Geometry<f64> {
    if is_valid_geometry(&simplified) || !is_valid_geometry(original) {
        return simplified;
    }
    log::trace!("Douglas-Peucker broke polygon topology, using VW-preserve");
    fallback()
}

fn simplify_line(ls: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    // Degenerate input is dropped later by the small-feature filter
    if ls.0.len() < MIN_LINESTRING_POINTS {
        return ls.clone();
    }
    ls.simplify(&tolerance)
}
