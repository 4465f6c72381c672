//! Fixed-point precision grid for tile geometry.
//!
//! Tile geometry is processed in pixel space (`0..tile_size`) but encoded in
//! extent units, so every output coordinate must land on a grid with step
//! `tile_size / extent` pixels. One [`PrecisionModel`] is derived per tile and
//! reused for every feature in it.

use geo::{Coord, Geometry, LineString, MapCoords, MultiLineString, MultiPolygon, Polygon};
use i_overlay::core::fill_rule::FillRule;

use crate::config::TilingParameters;
use crate::overlay;
use crate::validate::{is_valid_geometry, MIN_LINESTRING_POINTS, MIN_POLYGON_RING_POINTS};

/// Snapping grid with `scale` cells per pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionModel {
    scale: f64,
}

impl PrecisionModel {
    pub fn new(scale: f64) -> Self {
        Self { scale }
    }

    pub fn from_parameters(params: &TilingParameters) -> Self {
        Self::new(params.precision_scale())
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Size of one grid cell in pixels.
    pub fn grid_size(&self) -> f64 {
        1.0 / self.scale
    }

    pub fn snap(&self, c: Coord<f64>) -> Coord<f64> {
        Coord {
            x: (c.x * self.scale).round() / self.scale,
            y: (c.y * self.scale).round() / self.scale,
        }
    }

    /// Snap every coordinate independently.
    ///
    /// Only repeated consecutive vertices are removed; the structure is left
    /// alone, so a polygon may come out self-intersecting or collapsed.
    pub fn reduce_pointwise(&self, geom: &Geometry<f64>) -> Geometry<f64> {
        let mut snapped = geom.map_coords(|c| self.snap(c));
        dedup_vertices(&mut snapped);
        snapped
    }

    /// Snap to the grid while keeping the result topologically valid.
    ///
    /// Collapsed lines and rings are removed. Polygonal results that turn
    /// invalid through snapping are re-noded and snapped again. A geometry
    /// already on the grid is returned unchanged.
    pub fn reduce(&self, geom: &Geometry<f64>) -> Geometry<f64> {
        let snapped = self.reduce_pointwise(geom);
        if &snapped == geom {
            return snapped;
        }

        let reduced = drop_collapsed(snapped);
        match &reduced {
            Geometry::Polygon(_) | Geometry::MultiPolygon(_) if !is_valid_geometry(&reduced) => {
                let fixed = overlay::resolve(&to_multipolygon(&reduced), FillRule::NonZero);
                log::trace!("re-noded polygon collapsed by snapping");
                drop_collapsed(self.reduce_pointwise(&Geometry::MultiPolygon(fixed)))
            }
            _ => reduced,
        }
    }
}

fn dedup_vertices(geom: &mut Geometry<f64>) {
    match geom {
        Geometry::LineString(ls) => ls.0.dedup(),
        Geometry::MultiLineString(mls) => mls.0.iter_mut().for_each(|ls| ls.0.dedup()),
        Geometry::Polygon(poly) => dedup_polygon(poly),
        Geometry::MultiPolygon(mp) => mp.0.iter_mut().for_each(dedup_polygon),
        Geometry::GeometryCollection(gc) => gc.0.iter_mut().for_each(dedup_vertices),
        _ => {}
    }
}

fn dedup_polygon(poly: &mut Polygon<f64>) {
    poly.exterior_mut(|ring| ring.0.dedup());
    poly.interiors_mut(|rings| rings.iter_mut().for_each(|ring| ring.0.dedup()));
}

/// Remove lines with fewer than two points and rings with fewer than three distinct points.
pub(crate) fn drop_collapsed(geom: Geometry<f64>) -> Geometry<f64> {
    match geom {
        Geometry::LineString(ls) => {
            if ls.0.len() >= MIN_LINESTRING_POINTS {
                Geometry::LineString(ls)
            } else {
                Geometry::MultiLineString(MultiLineString::new(vec![]))
            }
        }
        Geometry::MultiLineString(mls) => Geometry::MultiLineString(MultiLineString::new(
            mls.0
                .into_iter()
                .filter(|ls| ls.0.len() >= MIN_LINESTRING_POINTS)
                .collect(),
        )),
        Geometry::Polygon(poly) => match drop_collapsed_rings(poly) {
            Some(poly) => Geometry::Polygon(poly),
            None => Geometry::MultiPolygon(MultiPolygon::new(vec![])),
        },
        Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(MultiPolygon::new(
            mp.0.into_iter().filter_map(drop_collapsed_rings).collect(),
        )),
        other => other,
    }
}

fn drop_collapsed_rings(poly: Polygon<f64>) -> Option<Polygon<f64>> {
    let (exterior, interiors) = poly.into_inner();
    if !is_open_ring(&exterior) {
        return None;
    }
    let interiors: Vec<LineString<f64>> = interiors.into_iter().filter(is_open_ring).collect();
    Some(Polygon::new(exterior, interiors))
}

fn is_open_ring(ring: &LineString<f64>) -> bool {
    ring.0.len() >= MIN_POLYGON_RING_POINTS
}

/// Polygonal parts of a geometry as one multipolygon.
pub(crate) fn to_multipolygon(geom: &Geometry<f64>) -> MultiPolygon<f64> {
    match geom {
        Geometry::Polygon(poly) => MultiPolygon::new(vec![poly.clone()]),
        Geometry::MultiPolygon(mp) => mp.clone(),
        Geometry::GeometryCollection(gc) => {
            MultiPolygon::new(gc.0.iter().flat_map(|g| to_multipolygon(g).0).collect())
        }
        _ => MultiPolygon::new(vec![]),
    }
}
