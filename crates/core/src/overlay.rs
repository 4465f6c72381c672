//! Conversions between `geo` polygons and `i_overlay` shapes.
//!
//! `i_overlay` works on plain `[x, y]` contours: the first contour of a shape
//! is the outer boundary, the rest are holes, and rings are implicitly closed
//! (the first point is never repeated).

use geo::{Coord, LineString, MultiPolygon, Polygon};
use i_overlay::core::fill_rule::FillRule;
use i_overlay::core::overlay_rule::OverlayRule;
use i_overlay::float::simplify::SimplifyShape;
use i_overlay::float::single::SingleFloatOverlay;

pub(crate) type Contour = Vec<[f64; 2]>;
pub(crate) type Shape = Vec<Contour>;
pub(crate) type Shapes = Vec<Shape>;

fn ring_to_contour(ring: &LineString<f64>) -> Contour {
    let mut contour: Contour = ring.coords().map(|c| [c.x, c.y]).collect();
    if contour.len() > 1 && contour.first() == contour.last() {
        contour.pop();
    }
    contour
}

fn contour_to_ring(contour: &[[f64; 2]]) -> LineString<f64> {
    // Polygon::new closes the ring
    LineString::new(contour.iter().map(|p| Coord { x: p[0], y: p[1] }).collect())
}

pub(crate) fn polygon_to_shape(polygon: &Polygon<f64>) -> Shape {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .map(ring_to_contour)
        .filter(|contour| contour.len() >= 3)
        .collect()
}

pub(crate) fn multipolygon_to_shapes(mp: &MultiPolygon<f64>) -> Shapes {
    mp.0.iter()
        .map(polygon_to_shape)
        .filter(|shape| !shape.is_empty())
        .collect()
}

pub(crate) fn shapes_to_multipolygon(shapes: &[Shape]) -> MultiPolygon<f64> {
    let polygons = shapes
        .iter()
        .filter_map(|shape| {
            let (exterior, holes) = shape.split_first()?;
            if exterior.len() < 3 {
                return None;
            }
            let holes = holes
                .iter()
                .filter(|hole| hole.len() >= 3)
                .map(|hole| contour_to_ring(hole))
                .collect();
            Some(Polygon::new(contour_to_ring(exterior), holes))
        })
        .collect();
    MultiPolygon::new(polygons)
}

/// Re-node all rings and rebuild the polygon under the given fill rule.
///
/// With [`FillRule::NonZero`] this behaves like a zero-width buffer; with
/// [`FillRule::EvenOdd`] overlapping areas cancel out.
pub(crate) fn resolve(mp: &MultiPolygon<f64>, fill_rule: FillRule) -> MultiPolygon<f64> {
    let shapes = multipolygon_to_shapes(mp);
    if shapes.is_empty() {
        return MultiPolygon::new(vec![]);
    }
    let result: Shapes = shapes.simplify_shape(fill_rule, 0.0);
    shapes_to_multipolygon(&result)
}

/// Boolean operation between two polygonal inputs.
pub(crate) fn overlay(
    subject: &MultiPolygon<f64>,
    clip: &MultiPolygon<f64>,
    rule: OverlayRule,
) -> MultiPolygon<f64> {
    let subject = multipolygon_to_shapes(subject);
    let clip = multipolygon_to_shapes(clip);
    let result: Shapes = subject.overlay(&clip, rule, FillRule::EvenOdd);
    shapes_to_multipolygon(&result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area};

    #[test]
    fn test_closing_point_is_dropped_and_restored() {
        let square = polygon![(x: 0.0, y: 0.0), (x: 4.0, y: 0.0), (x: 4.0, y: 4.0), (x: 0.0, y: 4.0)];
        let shape = polygon_to_shape(&square);
        assert_eq!(shape.len(), 1);
        assert_eq!(shape[0].len(), 4);

        let back = shapes_to_multipolygon(&[shape]);
        assert_eq!(back.0.len(), 1);
        assert!(back.0[0].exterior().is_closed());
        assert!((back.unsigned_area() - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_resolve_bowtie_keeps_both_lobes() {
        let bowtie = polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 10.0),
        ];
        let fixed = resolve(&MultiPolygon::new(vec![bowtie]), FillRule::NonZero);
        assert_eq!(fixed.0.len(), 2);
        assert!((fixed.unsigned_area() - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlay_union_of_overlapping_squares() {
        let a = polygon![(x: 0.0, y: 0.0), (x: 2.0, y: 0.0), (x: 2.0, y: 2.0), (x: 0.0, y: 2.0)];
        let b = polygon![(x: 1.0, y: 0.0), (x: 3.0, y: 0.0), (x: 3.0, y: 2.0), (x: 1.0, y: 2.0)];
        let union = overlay(
            &MultiPolygon::new(vec![a]),
            &MultiPolygon::new(vec![b]),
            OverlayRule::Union,
        );
        assert_eq!(union.0.len(), 1);
        assert!((union.unsigned_area() - 6.0).abs() < 1e-6);
    }
}
