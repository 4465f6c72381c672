//! Tile addressing and tiling scheme math.
//!
//! A [`TileCoordinate`] is both the cache key and the unit of work for tile
//! generation. A [`TilingScheme`] knows how to project CRS84 coordinates into
//! its world coordinates and how rows/columns partition that world per zoom.

use std::f64::consts::PI;
use std::fmt;

use geo::AffineTransform;

/// Collection segment used for dataset-wide (multi-collection) tiles.
pub const ALL_COLLECTIONS: &str = "__all__";

/// Deepest zoom level a tile can be addressed at.
pub const MAX_ZOOM: u8 = 30;

/// Web Mercator sphere radius (EPSG:3857).
const EARTH_RADIUS: f64 = 6_378_137.0;

/// Latitude limit of the square Web Mercator world.
const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Address of one tile within a dataset, optionally scoped to one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub dataset: String,
    /// `None` addresses the dataset-wide tile combining all collections
    pub collection: Option<String>,
    pub tiling_scheme: String,
    pub zoom: u8,
    pub row: u32,
    pub col: u32,
    /// Temporary tiles live in the swept scratch area, never the persistent cache
    pub temporary: bool,
}

impl TileCoordinate {
    /// Create a new, non-temporary tile coordinate
    pub fn new(
        dataset: impl Into<String>,
        collection: Option<&str>,
        tiling_scheme: impl Into<String>,
        zoom: u8,
        row: u32,
        col: u32,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.map(str::to_string),
            tiling_scheme: tiling_scheme.into(),
            zoom,
            row,
            col,
            temporary: false,
        }
    }

    /// Mark this coordinate as temporary.
    pub fn with_temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    /// The same tile position scoped to a single collection.
    pub fn for_collection(&self, collection: &str) -> Self {
        Self {
            collection: Some(collection.to_string()),
            ..self.clone()
        }
    }

    /// The collection id, or [`ALL_COLLECTIONS`] for dataset-wide tiles.
    pub fn collection_or_all(&self) -> &str {
        self.collection.as_deref().unwrap_or(ALL_COLLECTIONS)
    }

    /// True for a dataset-wide tile.
    pub fn is_multi_layer(&self) -> bool {
        self.collection.is_none()
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}{}",
            self.dataset,
            self.collection_or_all(),
            self.tiling_scheme,
            self.zoom,
            self.row,
            self.col,
            if self.temporary { " (tmp)" } else { "" }
        )
    }
}

/// Axis-aligned bounding box, either in CRS84 degrees or in scheme world units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl TileBounds {
    /// Create a new bounding box
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Create an empty/invalid bounding box
    pub fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    /// Check if this is a valid bounding box
    pub fn is_valid(&self) -> bool {
        self.min_x <= self.max_x && self.min_y <= self.max_y
    }

    /// Expand this bounding box to include another
    pub fn expand(&mut self, other: &Self) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Overlap of two boxes, `None` if they are disjoint
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let result = Self::new(
            self.min_x.max(other.min_x),
            self.min_y.max(other.min_y),
            self.max_x.min(other.max_x),
            self.max_y.min(other.max_y),
        );
        result.is_valid().then_some(result)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// Rectangle of rows and columns at one zoom level (inclusive bounds)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMatrixLimits {
    pub zoom: u8,
    pub min_row: u32,
    pub max_row: u32,
    pub min_col: u32,
    pub max_col: u32,
}

impl TileMatrixLimits {
    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.min_row..=self.max_row).contains(&row) && (self.min_col..=self.max_col).contains(&col)
    }

    /// Number of tiles inside the limits
    pub fn count(&self) -> u64 {
        (self.max_row - self.min_row + 1) as u64 * (self.max_col - self.min_col + 1) as u64
    }

    /// All (row, col) pairs, row-major
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> {
        let (min_col, max_col) = (self.min_col, self.max_col);
        (self.min_row..=self.max_row).flat_map(move |row| (min_col..=max_col).map(move |col| (row, col)))
    }
}

/// The tiling schemes tiles can be addressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TilingScheme {
    /// EPSG:3857, one tile at zoom 0
    WebMercatorQuad,
    /// EPSG:4326 plate carrée, two tiles side by side at zoom 0
    WorldCrs84Quad,
}

impl TilingScheme {
    pub const ALL: [TilingScheme; 2] = [TilingScheme::WebMercatorQuad, TilingScheme::WorldCrs84Quad];

    pub fn id(&self) -> &'static str {
        match self {
            TilingScheme::WebMercatorQuad => "WebMercatorQuad",
            TilingScheme::WorldCrs84Quad => "WorldCRS84Quad",
        }
    }

    /// Parse a tiling scheme id (case-sensitive, as in tile URLs).
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|scheme| scheme.id() == id)
    }

    /// Number of tile columns at a zoom level, saturating far past [`MAX_ZOOM`]
    pub fn matrix_width(&self, zoom: u8) -> u32 {
        let shift = match self {
            TilingScheme::WebMercatorQuad => u32::from(zoom),
            TilingScheme::WorldCrs84Quad => u32::from(zoom) + 1,
        };
        1u32.checked_shl(shift).unwrap_or(u32::MAX)
    }

    /// Number of tile rows at a zoom level, saturating far past [`MAX_ZOOM`]
    pub fn matrix_height(&self, zoom: u8) -> u32 {
        1u32.checked_shl(u32::from(zoom)).unwrap_or(u32::MAX)
    }

    /// Extent of the whole tiled world in scheme units
    pub fn world_bounds(&self) -> TileBounds {
        match self {
            TilingScheme::WebMercatorQuad => {
                let half = PI * EARTH_RADIUS;
                TileBounds::new(-half, -half, half, half)
            }
            TilingScheme::WorldCrs84Quad => TileBounds::new(-180.0, -90.0, 180.0, 90.0),
        }
    }

    /// Project CRS84 longitude/latitude into scheme world coordinates
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            TilingScheme::WebMercatorQuad => {
                let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
                let x = EARTH_RADIUS * lon.to_radians();
                let y = EARTH_RADIUS * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
                (x, y)
            }
            TilingScheme::WorldCrs84Quad => (lon, lat),
        }
    }

    /// Inverse of [`project`](Self::project)
    pub fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            TilingScheme::WebMercatorQuad => {
                let lon = (x / EARTH_RADIUS).to_degrees();
                let lat = (2.0 * (y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees();
                (lon, lat)
            }
            TilingScheme::WorldCrs84Quad => (x, y),
        }
    }

    /// Bounds of one tile in world coordinates
    pub fn tile_bounds(&self, zoom: u8, row: u32, col: u32) -> TileBounds {
        let world = self.world_bounds();
        let tile_w = world.width() / self.matrix_width(zoom) as f64;
        let tile_h = world.height() / self.matrix_height(zoom) as f64;

        let min_x = world.min_x + col as f64 * tile_w;
        let max_y = world.max_y - row as f64 * tile_h;
        TileBounds::new(min_x, max_y - tile_h, min_x + tile_w, max_y)
    }

    /// Bounds of one tile in CRS84 degrees
    pub fn tile_bounds_crs84(&self, zoom: u8, row: u32, col: u32) -> TileBounds {
        let b = self.tile_bounds(zoom, row, col);
        let (min_x, min_y) = self.unproject(b.min_x, b.min_y);
        let (max_x, max_y) = self.unproject(b.max_x, b.max_y);
        TileBounds::new(min_x, min_y, max_x, max_y)
    }

    /// Affine transform from world coordinates into tile pixel space.
    ///
    /// The tile covers `0..tile_size` on both axes, origin top-left, y down.
    pub fn pixel_transform(&self, zoom: u8, row: u32, col: u32, tile_size: u32) -> AffineTransform<f64> {
        let bounds = self.tile_bounds(zoom, row, col);
        let sx = tile_size as f64 / bounds.width();
        let sy = tile_size as f64 / bounds.height();
        AffineTransform::new(sx, 0.0, -bounds.min_x * sx, 0.0, -sy, bounds.max_y * sy)
    }

    /// Rows and columns covering a CRS84 bounding box at `zoom`.
    ///
    /// Returns `None` when the box lies completely outside the tiled world.
    pub fn limits_for_bbox(&self, bbox: &TileBounds, zoom: u8) -> Option<TileMatrixLimits> {
        if !bbox.is_valid() {
            return None;
        }
        let (x0, y0) = self.project(bbox.min_x, bbox.min_y);
        let (x1, y1) = self.project(bbox.max_x, bbox.max_y);
        let world = self.world_bounds();
        let projected = TileBounds::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1));
        let clipped = projected.intersection(&world)?;

        let cols = self.matrix_width(zoom);
        let rows = self.matrix_height(zoom);
        let tile_w = world.width() / cols as f64;
        let tile_h = world.height() / rows as f64;

        let col_of = |x: f64| (((x - world.min_x) / tile_w).floor().max(0.0) as u32).min(cols - 1);
        let row_of = |y: f64| (((world.max_y - y) / tile_h).floor().max(0.0) as u32).min(rows - 1);

        let min_col = col_of(clipped.min_x);
        let max_col = last_index(clipped.max_x - world.min_x, tile_w, cols).max(min_col);
        let min_row = row_of(clipped.max_y);
        let max_row = last_index(world.max_y - clipped.min_y, tile_h, rows).max(min_row);

        Some(TileMatrixLimits {
            zoom,
            min_row,
            max_row,
            min_col,
            max_col,
        })
    }
}

/// Index of the last tile touched by an offset, excluding tiles only touched at their edge.
fn last_index(offset: f64, tile_size: f64, count: u32) -> u32 {
    let index = (offset / tile_size).ceil() as i64 - 1;
    index.clamp(0, count as i64 - 1) as u32
}

impl fmt::Display for TilingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::AffineOps;
    use geo::Point;

    #[test]
    fn test_tiling_scheme_ids_round_trip() {
        for scheme in TilingScheme::ALL {
            assert_eq!(TilingScheme::from_id(scheme.id()), Some(scheme));
        }
        assert_eq!(TilingScheme::from_id("GoogleMapsCompatible"), None);
    }

    #[test]
    fn test_matrix_dimensions() {
        assert_eq!(TilingScheme::WebMercatorQuad.matrix_width(0), 1);
        assert_eq!(TilingScheme::WebMercatorQuad.matrix_height(10), 1024);
        assert_eq!(TilingScheme::WorldCrs84Quad.matrix_width(0), 2);
        assert_eq!(TilingScheme::WorldCrs84Quad.matrix_height(0), 1);
        assert_eq!(TilingScheme::WorldCrs84Quad.matrix_width(MAX_ZOOM), 1 << 31);
    }

    #[test]
    fn test_matrix_dimensions_saturate_at_extreme_zoom() {
        for zoom in [31u8, 32, 40, u8::MAX] {
            for scheme in TilingScheme::ALL {
                assert!(scheme.matrix_width(zoom) >= 1 << 31, "{scheme} z{zoom}");
                assert!(scheme.matrix_height(zoom) >= 1 << 31, "{scheme} z{zoom}");
            }
        }
        assert_eq!(TilingScheme::WebMercatorQuad.matrix_height(32), u32::MAX);
        assert_eq!(TilingScheme::WorldCrs84Quad.matrix_width(31), u32::MAX);
    }

    #[test]
    fn test_tile_bounds_whole_world() {
        let scheme = TilingScheme::WebMercatorQuad;
        let bounds = scheme.tile_bounds(0, 0, 0);
        assert_eq!(bounds, scheme.world_bounds());

        let crs84 = scheme.tile_bounds_crs84(0, 0, 0);
        assert!((crs84.min_x - (-180.0)).abs() < 1e-9);
        assert!((crs84.max_x - 180.0).abs() < 1e-9);
        assert!(crs84.max_y > 85.0);
        assert!(crs84.min_y < -85.0);
    }

    #[test]
    fn test_project_unproject() {
        let scheme = TilingScheme::WebMercatorQuad;
        let (x, y) = scheme.project(7.5, 51.2);
        let (lon, lat) = scheme.unproject(x, y);
        assert!((lon - 7.5).abs() < 1e-9);
        assert!((lat - 51.2).abs() < 1e-9);
    }

    #[test]
    fn test_pixel_transform_maps_tile_corners() {
        let scheme = TilingScheme::WebMercatorQuad;
        let bounds = scheme.tile_bounds(10, 5, 7);
        let affine = scheme.pixel_transform(10, 5, 7, 256);

        let top_left = Point::new(bounds.min_x, bounds.max_y).affine_transform(&affine);
        assert!(top_left.x().abs() < 1e-6);
        assert!(top_left.y().abs() < 1e-6);

        let bottom_right = Point::new(bounds.max_x, bounds.min_y).affine_transform(&affine);
        assert!((bottom_right.x() - 256.0).abs() < 1e-6);
        assert!((bottom_right.y() - 256.0).abs() < 1e-6);

        let (cx, cy) = bounds.center();
        let center = Point::new(cx, cy).affine_transform(&affine);
        assert!((center.x() - 128.0).abs() < 1e-6);
        assert!((center.y() - 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_limits_for_single_tile_bbox() {
        let scheme = TilingScheme::WebMercatorQuad;
        let tile = scheme.tile_bounds_crs84(10, 5, 7);
        let (cx, cy) = tile.center();
        let bbox = TileBounds::new(cx - 0.01, cy - 0.01, cx + 0.01, cy + 0.01);

        let limits = scheme.limits_for_bbox(&bbox, 10).unwrap();
        assert_eq!(limits.count(), 1);
        assert!(limits.contains(5, 7));
    }

    #[test]
    fn test_limits_exact_tile_edges_do_not_spill() {
        let scheme = TilingScheme::WorldCrs84Quad;
        let limits = scheme
            .limits_for_bbox(&TileBounds::new(-180.0, -90.0, 0.0, 90.0), 0)
            .unwrap();
        assert_eq!((limits.min_col, limits.max_col), (0, 0));
        assert_eq!((limits.min_row, limits.max_row), (0, 0));
    }

    #[test]
    fn test_limits_clamped_to_world() {
        let scheme = TilingScheme::WebMercatorQuad;
        let limits = scheme
            .limits_for_bbox(&TileBounds::new(-200.0, -89.0, 200.0, 89.0), 2)
            .unwrap();
        assert_eq!(limits.count(), 16);
        assert_eq!(limits.iter().count(), 16);
    }

    #[test]
    fn test_bbox_intersection() {
        let a = TileBounds::new(0.0, 0.0, 10.0, 10.0);
        let b = TileBounds::new(5.0, 5.0, 15.0, 15.0);
        assert_eq!(a.intersection(&b), Some(TileBounds::new(5.0, 5.0, 10.0, 10.0)));

        let c = TileBounds::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_bbox_expand() {
        let mut bbox = TileBounds::empty();
        assert!(!bbox.is_valid());
        bbox.expand(&TileBounds::new(-10.0, -10.0, 10.0, 10.0));
        assert!(bbox.is_valid());
        assert_eq!(bbox.min_x, -10.0);
    }

    #[test]
    fn test_tile_coordinate_equality_includes_temporary_flag() {
        let a = TileCoordinate::new("ds", Some("roads"), "WebMercatorQuad", 3, 1, 2);
        let b = a.clone().with_temporary(true);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_tile_coordinate_display() {
        let coord = TileCoordinate::new("ds", None, "WebMercatorQuad", 3, 1, 2);
        assert_eq!(coord.to_string(), "ds/__all__/WebMercatorQuad/3/1/2");
        assert!(coord.is_multi_layer());
        assert_eq!(coord.for_collection("roads").collection_or_all(), "roads");
    }
}
