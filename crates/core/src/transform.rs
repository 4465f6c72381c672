//! Source geometry to tile geometry.
//!
//! [`TileTransform`] holds everything that is fixed for one tile (pixel
//! affine, clip rectangle, precision grid, thresholds) and runs each feature
//! geometry through the same sequence of steps:
//!
//! 1. affine transform into pixel space (origin top-left, y down)
//! 2. drop rings and lines below the minimum pixel size
//! 3. topology-preserving simplification at one grid unit
//! 4. snap to the precision grid, falling back to point-wise snapping when the
//!    area changes too much
//! 5. repair invalid polygons
//! 6. clip to the buffered tile rectangle
//! 7. snap and filter small parts again
//! 8. if still invalid: repair, clip and snap once more, then flag the result
//!
//! Any step that leaves nothing behind drops the feature.

use geo::{
    AffineOps, AffineTransform, Area, Geometry, LineString, MultiLineString, MultiPoint,
    MultiPolygon, Polygon,
};

use crate::clip::{buffered_tile_bounds, clip_geometry};
use crate::config::TilingParameters;
use crate::precision::{drop_collapsed, PrecisionModel};
use crate::repair::{repair, AreaTolerance};
use crate::simplify::simplify_preserving_topology;
use crate::tile::{TileBounds, TilingScheme};
use crate::validate::is_valid_geometry;

/// A feature geometry in tile pixel space.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGeometry {
    pub geometry: Geometry<f64>,
    /// False when the geometry could not be repaired
    pub valid: bool,
}

/// Per-tile geometry transform.
#[derive(Debug, Clone)]
pub struct TileTransform {
    affine: AffineTransform<f64>,
    clip_bounds: TileBounds,
    precision: PrecisionModel,
    min_pixel_size: f64,
    tolerance: AreaTolerance,
}

impl TileTransform {
    pub fn new(
        affine: AffineTransform<f64>,
        clip_bounds: TileBounds,
        precision: PrecisionModel,
        min_pixel_size: f64,
        tolerance: AreaTolerance,
    ) -> Self {
        Self {
            affine,
            clip_bounds,
            precision,
            min_pixel_size,
            tolerance,
        }
    }

    /// Transform for tile `zoom/row/col`, taking world coordinates of `scheme`.
    pub fn for_tile(scheme: TilingScheme, zoom: u8, row: u32, col: u32, params: &TilingParameters) -> Self {
        Self::new(
            scheme.pixel_transform(zoom, row, col, params.tile_size),
            buffered_tile_bounds(params.tile_size, params.buffer_pixels),
            PrecisionModel::from_parameters(params),
            params.min_pixel_size,
            AreaTolerance::from_parameters(params),
        )
    }

    pub fn precision(&self) -> &PrecisionModel {
        &self.precision
    }

    pub fn clip_bounds(&self) -> &TileBounds {
        &self.clip_bounds
    }

    /// Run `geom` (in world coordinates) through all steps.
    ///
    /// Returns `None` when the feature has nothing left to draw in this tile.
    pub fn apply(&self, geom: &Geometry<f64>) -> Option<TileGeometry> {
        let pixels = geom.affine_transform(&self.affine);

        let filtered = non_empty(self.drop_small(pixels))?;

        let simplified = simplify_preserving_topology(&filtered, self.precision.grid_size());

        let reduced = non_empty(self.reduce(&simplified))?;

        let repaired = self.repair_if_invalid(reduced);

        let clipped = non_empty(clip_geometry(&repaired, &self.clip_bounds)?)?;

        let reclipped = non_empty(self.drop_small(self.reduce(&clipped)))?;

        if is_valid_geometry(&reclipped) {
            return Some(TileGeometry {
                geometry: reclipped,
                valid: true,
            });
        }

        // Second full pass; a geometry failing again is returned flagged
        let repaired = self.repair_if_invalid(reclipped);
        let clipped = non_empty(clip_geometry(&repaired, &self.clip_bounds)?)?;
        let geometry = non_empty(self.reduce(&clipped))?;
        let valid = is_valid_geometry(&geometry);
        if !valid {
            log::trace!("geometry still invalid after second repair pass");
        }
        Some(TileGeometry { geometry, valid })
    }

    /// Snap to the grid, point-wise when topological snapping moves too much area.
    fn reduce(&self, geom: &Geometry<f64>) -> Geometry<f64> {
        let reduced = self.precision.reduce(geom);
        if !is_polygonal(geom) {
            return reduced;
        }
        let before = geom.unsigned_area();
        let after = reduced.unsigned_area();
        if self.tolerance.accepts(before, after) {
            reduced
        } else {
            log::trace!("precision reduction changed area {before} -> {after}, snapping point-wise");
            drop_collapsed(self.precision.reduce_pointwise(geom))
        }
    }

    fn repair_if_invalid(&self, geom: Geometry<f64>) -> Geometry<f64> {
        if !is_polygonal(&geom) || is_valid_geometry(&geom) {
            return geom;
        }
        match repair(&geom, &self.tolerance, self.precision.grid_size()) {
            Some(repaired) => repaired.geometry,
            None => {
                log::trace!("no repair strategy within tolerance, keeping invalid geometry");
                geom
            }
        }
    }

    /// Remove rings with area below `min_pixel_size²` and lines shorter than `min_pixel_size`.
    ///
    /// A polygon whose exterior is too small is removed with all its holes.
    fn drop_small(&self, geom: Geometry<f64>) -> Geometry<f64> {
        let min_length = self.min_pixel_size;
        let min_area = min_length * min_length;
        let keep_line = |ls: &LineString<f64>| line_length(ls) >= min_length;

        match geom {
            Geometry::LineString(ls) => {
                if keep_line(&ls) {
                    Geometry::LineString(ls)
                } else {
                    Geometry::MultiLineString(MultiLineString::new(vec![]))
                }
            }
            Geometry::MultiLineString(mls) => {
                Geometry::MultiLineString(MultiLineString::new(mls.0.into_iter().filter(keep_line).collect()))
            }
            Geometry::Polygon(poly) => match drop_small_rings(poly, min_area) {
                Some(poly) => Geometry::Polygon(poly),
                None => Geometry::MultiPolygon(MultiPolygon::new(vec![])),
            },
            Geometry::MultiPolygon(mp) => Geometry::MultiPolygon(MultiPolygon::new(
                mp.0.into_iter()
                    .filter_map(|poly| drop_small_rings(poly, min_area))
                    .collect(),
            )),
            Geometry::GeometryCollection(gc) => Geometry::GeometryCollection(
                gc.0.into_iter()
                    .map(|g| self.drop_small(g))
                    .filter(|g| !is_empty(g))
                    .collect(),
            ),
            other => other,
        }
    }
}

fn drop_small_rings(poly: Polygon<f64>, min_area: f64) -> Option<Polygon<f64>> {
    let (exterior, interiors) = poly.into_inner();
    if ring_area(&exterior) < min_area {
        return None;
    }
    let interiors = interiors
        .into_iter()
        .filter(|ring| ring_area(ring) >= min_area)
        .collect();
    Some(Polygon::new(exterior, interiors))
}

fn ring_area(ring: &LineString<f64>) -> f64 {
    Polygon::new(ring.clone(), vec![]).unsigned_area()
}

fn line_length(ls: &LineString<f64>) -> f64 {
    ls.lines().map(|line| line.dx().hypot(line.dy())).sum()
}

fn is_polygonal(geom: &Geometry<f64>) -> bool {
    matches!(geom, Geometry::Polygon(_) | Geometry::MultiPolygon(_))
}

pub(crate) fn is_empty(geom: &Geometry<f64>) -> bool {
    match geom {
        Geometry::LineString(ls) => ls.0.is_empty(),
        Geometry::Polygon(poly) => poly.exterior().0.is_empty(),
        Geometry::MultiPoint(MultiPoint(points)) => points.is_empty(),
        Geometry::MultiLineString(mls) => mls.0.is_empty(),
        Geometry::MultiPolygon(mp) => mp.0.is_empty(),
        Geometry::GeometryCollection(gc) => gc.0.iter().all(is_empty),
        _ => false,
    }
}

fn non_empty(geom: Geometry<f64>) -> Option<Geometry<f64>> {
    (!is_empty(&geom)).then_some(geom)
}
