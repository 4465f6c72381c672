//! Geometry clipping to the buffered tile rectangle.
//!
//! Features are clipped to the tile extent plus a pixel buffer so that
//! lines and polygon edges continue past the tile border and adjacent tiles
//! render without seams.
//!
//! # Algorithm Selection
//!
//! - **Points**: containment test
//! - **Lines**: `BooleanOps::clip` against the clip rectangle
//! - **Valid polygons**: Sutherland-Hodgman (O(n)); if the result comes out
//!   degenerate (concave shapes can fold onto the clip edge) the polygon is
//!   clipped again with a boolean intersection
//! - **Invalid polygons**: boolean intersection directly
//!
//! If clipping yields nothing although the geometry intersects the clip
//! rectangle, the geometry is round-tripped through WKT and clipped again with
//! the robust overlay. This shakes out coordinate noise that occasionally makes
//! the fast paths lose a sliver entirely.

use geo::{
    BooleanOps, BoundingRect, Coord, Geometry, GeometryCollection, Intersects, LineString,
    MapCoords, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon, Rect,
};
use geozero::wkt::Wkt;
use geozero::{ToGeo, ToWkt};
use i_overlay::core::overlay_rule::OverlayRule;

use crate::overlay;
use crate::precision::to_multipolygon;
use crate::tile::TileBounds;
use crate::validate::is_valid_geometry;

/// Clip rectangle for a tile of `tile_size` pixels with `buffer_pixels` on every side.
pub fn buffered_tile_bounds(tile_size: u32, buffer_pixels: u32) -> TileBounds {
    let buffer = buffer_pixels as f64;
    TileBounds::new(-buffer, -buffer, tile_size as f64 + buffer, tile_size as f64 + buffer)
}

/// Clip a geometry to `bounds`.
///
/// Returns `None` if nothing of the geometry lies within the bounds.
pub fn clip_geometry(geom: &Geometry<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let clipped = clip_fast(geom, bounds);
    if clipped.is_some() {
        return clipped;
    }

    if !geom.intersects(&bounds_rect(bounds)) {
        return None;
    }

    // Intersects but clipped to nothing: retry from a text round-trip
    log::trace!("empty clip result for intersecting geometry, retrying via WKT");
    let reparsed = wkt_round_trip(geom)?;
    clip_robust(&reparsed, bounds)
}

fn clip_fast(geom: &Geometry<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    match geom {
        Geometry::Point(p) => clip_point(p, bounds).map(Geometry::Point),
        Geometry::MultiPoint(mp) => clip_multipoint(mp, bounds),
        Geometry::LineString(ls) => clip_lines(&MultiLineString::new(vec![ls.clone()]), bounds),
        Geometry::MultiLineString(mls) => clip_lines(mls, bounds),
        Geometry::Polygon(poly) => clip_polygon(poly, bounds),
        Geometry::MultiPolygon(mp) => clip_multipolygon(mp, bounds),
        Geometry::GeometryCollection(gc) => {
            let parts: Vec<Geometry<f64>> = gc.0.iter().filter_map(|g| clip_fast(g, bounds)).collect();
            (!parts.is_empty()).then(|| Geometry::GeometryCollection(GeometryCollection::from(parts)))
        }
        Geometry::Line(line) => clip_lines(
            &MultiLineString::new(vec![LineString::new(vec![line.start, line.end])]),
            bounds,
        ),
        Geometry::Rect(rect) => clip_polygon(&rect.to_polygon(), bounds),
        Geometry::Triangle(tri) => clip_polygon(&tri.to_polygon(), bounds),
    }
}

/// Clip using the overlay engine only, for inputs the fast paths lost.
fn clip_robust(geom: &Geometry<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    match geom {
        Geometry::Polygon(_) | Geometry::MultiPolygon(_) => {
            clip_polygonal_boolean(&to_multipolygon(geom), bounds)
        }
        other => clip_fast(other, bounds),
    }
}

fn wkt_round_trip(geom: &Geometry<f64>) -> Option<Geometry<f64>> {
    let text = match geom.to_wkt() {
        Ok(text) => text,
        Err(e) => {
            log::warn!("WKT serialisation failed: {e}");
            return None;
        }
    };
    match Wkt(text).to_geo() {
        Ok(g) => Some(g),
        Err(e) => {
            log::warn!("WKT parsing failed: {e}");
            None
        }
    }
}

fn bounds_rect(bounds: &TileBounds) -> Rect<f64> {
    Rect::new(
        Coord {
            x: bounds.min_x,
            y: bounds.min_y,
        },
        Coord {
            x: bounds.max_x,
            y: bounds.max_y,
        },
    )
}

/// Check if a rectangle intersects the given bounds
fn intersects_bounds(rect: &Rect<f64>, bounds: &TileBounds) -> bool {
    rect.max().x >= bounds.min_x
        && rect.min().x <= bounds.max_x
        && rect.max().y >= bounds.min_y
        && rect.min().y <= bounds.max_y
}

fn within_bounds(rect: &Rect<f64>, bounds: &TileBounds) -> bool {
    rect.min().x >= bounds.min_x
        && rect.max().x <= bounds.max_x
        && rect.min().y >= bounds.min_y
        && rect.max().y <= bounds.max_y
}

/// Clip a point to bounds (simple containment check)
fn clip_point(point: &Point<f64>, bounds: &TileBounds) -> Option<Point<f64>> {
    let inside = point.x() >= bounds.min_x
        && point.x() <= bounds.max_x
        && point.y() >= bounds.min_y
        && point.y() <= bounds.max_y;
    inside.then_some(*point)
}

fn clip_multipoint(mp: &MultiPoint<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let points: Vec<Point<f64>> = mp.0.iter().filter_map(|p| clip_point(p, bounds)).collect();
    match points.len() {
        0 => None,
        1 => Some(Geometry::Point(points[0])),
        _ => Some(Geometry::MultiPoint(MultiPoint::new(points))),
    }
}

/// Clip lines to bounds using BooleanOps.
///
/// The call is `polygon.clip(&multilinestring, invert)`; `invert = false`
/// keeps the parts inside the polygon.
fn clip_lines(mls: &MultiLineString<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let rect = mls.bounding_rect()?;
    if !intersects_bounds(&rect, bounds) {
        return None;
    }
    if within_bounds(&rect, bounds) {
        return Some(single_or_multi_line(mls.clone()));
    }

    let clipped = bounds_rect(bounds).to_polygon().clip(mls, false);
    let clipped = MultiLineString::new(
        clipped
            .0
            .into_iter()
            .map(|ls| clamp_to_bounds(&ls, bounds))
            .filter(|ls| ls.0.len() >= 2)
            .collect(),
    );
    (!clipped.0.is_empty()).then(|| single_or_multi_line(clipped))
}

fn single_or_multi_line(mut mls: MultiLineString<f64>) -> Geometry<f64> {
    if mls.0.len() == 1 {
        if let Some(ls) = mls.0.pop() {
            return Geometry::LineString(ls);
        }
    }
    Geometry::MultiLineString(mls)
}

fn single_or_multi_polygon(mut mp: MultiPolygon<f64>) -> Geometry<f64> {
    if mp.0.len() == 1 {
        if let Some(poly) = mp.0.pop() {
            return Geometry::Polygon(poly);
        }
    }
    Geometry::MultiPolygon(mp)
}

/// Clip a polygon to bounds.
///
/// Returns `Geometry::Polygon` if clipping results in a single polygon,
/// or `Geometry::MultiPolygon` if the clip creates multiple disconnected parts
/// (e.g. a U-shaped polygon clipped across its opening).
fn clip_polygon(poly: &Polygon<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let rect = poly.bounding_rect()?;
    if !intersects_bounds(&rect, bounds) {
        return None;
    }
    if within_bounds(&rect, bounds) {
        return Some(Geometry::Polygon(poly.clone()));
    }

    let original = Geometry::Polygon(poly.clone());
    if is_valid_geometry(&original) {
        if let Some(clipped) = clip_polygon_sutherland_hodgman(poly, bounds) {
            if is_valid_geometry(&clipped) {
                return Some(clipped);
            }
            log::trace!("Sutherland-Hodgman produced a degenerate ring, using boolean intersection");
        }
    } else {
        log::trace!("using boolean intersection for invalid polygon");
    }
    clip_polygonal_boolean(&MultiPolygon::new(vec![poly.clone()]), bounds)
}

fn clip_multipolygon(mp: &MultiPolygon<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let rect = mp.bounding_rect()?;
    if !intersects_bounds(&rect, bounds) {
        return None;
    }
    if within_bounds(&rect, bounds) {
        return Some(Geometry::MultiPolygon(mp.clone()));
    }

    // Parts are clipped independently; each may split into several
    let mut parts = Vec::new();
    for poly in &mp.0 {
        match clip_polygon(poly, bounds) {
            Some(Geometry::Polygon(p)) => parts.push(p),
            Some(Geometry::MultiPolygon(clipped)) => parts.extend(clipped.0),
            _ => {}
        }
    }
    (!parts.is_empty()).then(|| Geometry::MultiPolygon(MultiPolygon::new(parts)))
}

/// Clip a polygon with a Vatti-style boolean intersection.
///
/// Slower than Sutherland-Hodgman but handles self-intersections and spikes.
fn clip_polygonal_boolean(mp: &MultiPolygon<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let clip = MultiPolygon::new(vec![bounds_rect(bounds).to_polygon()]);
    let result = if is_valid_geometry(&Geometry::MultiPolygon(mp.clone())) {
        mp.intersection(&clip)
    } else {
        overlay::overlay(mp, &clip, OverlayRule::Intersect)
    };
    let result = clamp_to_bounds(&result, bounds);
    (!result.0.is_empty()).then(|| single_or_multi_polygon(result))
}

/// Pull overlay output that drifted past the clip edge by rounding back onto it.
fn clamp_to_bounds<G: MapCoords<f64, f64, Output = G>>(geom: &G, bounds: &TileBounds) -> G {
    geom.map_coords(|c| Coord {
        x: c.x.clamp(bounds.min_x, bounds.max_x),
        y: c.y.clamp(bounds.min_y, bounds.max_y),
    })
}

/// Clip a polygon using Sutherland-Hodgman.
///
/// Fast (O(n)) but assumes valid polygon geometry.
fn clip_polygon_sutherland_hodgman(poly: &Polygon<f64>, bounds: &TileBounds) -> Option<Geometry<f64>> {
    let clipped_exterior = sutherland_hodgman_clip(poly.exterior(), bounds);
    if clipped_exterior.0.len() < 4 {
        return None;
    }

    let clipped_interiors = poly
        .interiors()
        .iter()
        .map(|interior| sutherland_hodgman_clip(interior, bounds))
        .filter(|ring| ring.0.len() >= 4)
        .collect();

    Some(Geometry::Polygon(Polygon::new(clipped_exterior, clipped_interiors)))
}

/// Sutherland-Hodgman polygon clipping for axis-aligned rectangles.
fn sutherland_hodgman_clip(ring: &LineString<f64>, bounds: &TileBounds) -> LineString<f64> {
    let mut output: Vec<Coord<f64>> = ring.0.clone();
    // The closing point would duplicate the first vertex
    if output.len() > 1 && output.first() == output.last() {
        output.pop();
    }

    output = clip_against_edge(
        &output,
        |c| c.x >= bounds.min_x,
        |c1, c2| {
            let t = (bounds.min_x - c1.x) / (c2.x - c1.x);
            Coord {
                x: bounds.min_x,
                y: c1.y + t * (c2.y - c1.y),
            }
        },
    );
    output = clip_against_edge(
        &output,
        |c| c.x <= bounds.max_x,
        |c1, c2| {
            let t = (bounds.max_x - c1.x) / (c2.x - c1.x);
            Coord {
                x: bounds.max_x,
                y: c1.y + t * (c2.y - c1.y),
            }
        },
    );
    output = clip_against_edge(
        &output,
        |c| c.y >= bounds.min_y,
        |c1, c2| {
            let t = (bounds.min_y - c1.y) / (c2.y - c1.y);
            Coord {
                x: c1.x + t * (c2.x - c1.x),
                y: bounds.min_y,
            }
        },
    );
    output = clip_against_edge(
        &output,
        |c| c.y <= bounds.max_y,
        |c1, c2| {
            let t = (bounds.max_y - c1.y) / (c2.y - c1.y);
            Coord {
                x: c1.x + t * (c2.x - c1.x),
                y: bounds.max_y,
            }
        },
    );

    output.dedup();
    if !output.is_empty() && output.first() != output.last() {
        output.push(output[0]);
    }

    LineString::new(output)
}

/// Clip polygon vertices against a single edge
fn clip_against_edge<F, I>(vertices: &[Coord<f64>], inside: F, intersect: I) -> Vec<Coord<f64>>
where
    F: Fn(&Coord<f64>) -> bool,
    I: Fn(&Coord<f64>, &Coord<f64>) -> Coord<f64>,
{
    let mut output = Vec::with_capacity(vertices.len() + 4);

    for i in 0..vertices.len() {
        let current = &vertices[i];
        let next = &vertices[(i + 1) % vertices.len()];

        match (inside(current), inside(next)) {
            (true, true) => output.push(*current),
            // Exiting
            (true, false) => {
                output.push(*current);
                output.push(intersect(current, next));
            }
            // Entering
            (false, true) => output.push(intersect(current, next)),
            (false, false) => {}
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, point, polygon, Area, CoordsIter};

    fn tile() -> TileBounds {
        buffered_tile_bounds(256, 8)
    }

    fn all_coords_within(geom: &Geometry<f64>, bounds: &TileBounds) -> bool {
        geom.coords_iter().all(|c| {
            c.x >= bounds.min_x && c.x <= bounds.max_x && c.y >= bounds.min_y && c.y <= bounds.max_y
        })
    }

    // ========== Points ==========

    #[test]
    fn test_clip_point_inside_buffer() {
        let p = Geometry::Point(point!(x: -4.0, y: 100.0));
        assert!(clip_geometry(&p, &tile()).is_some());
    }

    #[test]
    fn test_clip_point_outside_buffer() {
        let p = Geometry::Point(point!(x: -9.0, y: 100.0));
        assert!(clip_geometry(&p, &tile()).is_none());
    }

    #[test]
    fn test_clip_multipoint_keeps_inside_points() {
        let mp = Geometry::MultiPoint(MultiPoint::new(vec![
            point!(x: 10.0, y: 10.0),
            point!(x: 500.0, y: 10.0),
        ]));
        assert_eq!(
            clip_geometry(&mp, &tile()),
            Some(Geometry::Point(point!(x: 10.0, y: 10.0)))
        );
    }

    // ========== Lines ==========

    #[test]
    fn test_clip_line_crossing_tile() {
        let line = Geometry::LineString(line_string![(x: -100.0, y: 128.0), (x: 400.0, y: 128.0)]);
        let clipped = clip_geometry(&line, &tile()).unwrap();
        assert!(all_coords_within(&clipped, &tile()));
        match clipped {
            Geometry::LineString(ls) => {
                assert_eq!(ls.0.len(), 2);
                let min_x = ls.0.iter().map(|c| c.x).fold(f64::INFINITY, f64::min);
                let max_x = ls.0.iter().map(|c| c.x).fold(f64::NEG_INFINITY, f64::max);
                assert!((min_x + 8.0).abs() < 1e-6);
                assert!((max_x - 264.0).abs() < 1e-6);
            }
            other => panic!("expected linestring, got {other:?}"),
        }
    }

    #[test]
    fn test_clip_line_outside() {
        let line = Geometry::LineString(line_string![(x: 300.0, y: 300.0), (x: 400.0, y: 400.0)]);
        assert!(clip_geometry(&line, &tile()).is_none());
    }

    // ========== Polygons ==========

    #[test]
    fn test_clip_polygon_partial() {
        let poly = Geometry::Polygon(polygon![
            (x: -50.0, y: -50.0),
            (x: 50.0, y: -50.0),
            (x: 50.0, y: 50.0),
            (x: -50.0, y: 50.0),
        ]);
        let clipped = clip_geometry(&poly, &tile()).unwrap();
        assert!(all_coords_within(&clipped, &tile()));
        assert!((clipped.unsigned_area() - 58.0 * 58.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_polygon_fully_inside_untouched() {
        let poly = Geometry::Polygon(polygon![
            (x: 10.0, y: 10.0),
            (x: 20.0, y: 10.0),
            (x: 20.0, y: 20.0),
            (x: 10.0, y: 20.0),
        ]);
        assert_eq!(clip_geometry(&poly, &tile()), Some(poly));
    }

    #[test]
    fn test_clip_u_shape_splits_into_parts() {
        let band = TileBounds::new(0.0, 4.0, 10.0, 6.0);
        let u_shape = Geometry::Polygon(polygon![
            (x: 1.0, y: 0.0),
            (x: 9.0, y: 0.0),
            (x: 9.0, y: 10.0),
            (x: 8.0, y: 10.0),
            (x: 8.0, y: 2.0),
            (x: 2.0, y: 2.0),
            (x: 2.0, y: 10.0),
            (x: 1.0, y: 10.0),
        ]);
        let clipped = clip_geometry(&u_shape, &band).unwrap();
        assert!(all_coords_within(&clipped, &band));
        assert!(is_valid_geometry(&clipped));
        assert!((clipped.unsigned_area() - 4.0).abs() < 1e-6);
        match clipped {
            Geometry::MultiPolygon(mp) => assert_eq!(mp.0.len(), 2),
            other => panic!("expected two arms, got {other:?}"),
        }
    }

    #[test]
    fn test_clip_invalid_polygon_stays_inside() {
        let bowtie = Geometry::Polygon(polygon![
            (x: -20.0, y: -20.0),
            (x: 300.0, y: 300.0),
            (x: 300.0, y: -20.0),
            (x: -20.0, y: 300.0),
        ]);
        let clipped = clip_geometry(&bowtie, &tile()).unwrap();
        assert!(all_coords_within(&clipped, &tile()));
    }

    #[test]
    fn test_wkt_round_trip_preserves_geometry() {
        let poly = Geometry::Polygon(polygon![
            (x: 1.5, y: 2.25),
            (x: 10.0, y: 2.25),
            (x: 10.0, y: 8.0),
        ]);
        let back = wkt_round_trip(&poly).unwrap();
        assert!((back.unsigned_area() - poly.unsigned_area()).abs() < 1e-9);
    }
}
