//! Tile set configuration.
//!
//! Configuration is a plain JSON document deserialised with `serde`. Defaults
//! are filled in at load time, so everything downstream works with resolved
//! values and never re-queries optional settings per feature.
//!
//! ```json
//! {
//!   "cache_root": "/var/cache/tiles",
//!   "datasets": {
//!     "roads": {
//!       "extent": [5.8, 47.2, 15.1, 55.1],
//!       "tile_sets": { "WebMercatorQuad": { "min": 0, "max": 14 } },
//!       "cache": "embedded",
//!       "collections": {
//!         "highways": { "features": "highways.geojson" },
//!         "landuse": {
//!           "merge": [{ "min_zoom": 0, "max_zoom": 10, "group_by": ["kind"] }]
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tile::{TileBounds, TilingScheme, MAX_ZOOM};
use crate::{Error, Result};

/// Default tile extent (4096 as per MVT spec)
pub const DEFAULT_EXTENT: u32 = 4096;

/// Default tile size in screen pixels
pub const DEFAULT_TILE_SIZE: u32 = 256;

/// Default buffer in pixels around the tile
pub const DEFAULT_BUFFER_PIXELS: u32 = 8;

/// Which tile cache backend persists a tile set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// One file per tile
    #[default]
    FileTree,
    /// One MBTiles container per tile set
    Embedded,
}

/// Geometry type hint declared in embedded container metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryKind {
    Point,
    Line,
    Polygon,
}

/// Inclusive zoom level range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: u8,
    pub max: u8,
}

impl ZoomRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, zoom: u8) -> bool {
        (self.min..=self.max).contains(&zoom)
    }

    pub fn levels(&self) -> impl Iterator<Item = u8> {
        self.min..=self.max
    }
}

/// Geometry processing thresholds for one tile set.
///
/// `buffer_pixels` and `min_pixel_size` are in screen pixels (1/`tile_size`
/// of the tile width); area thresholds are in square pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingParameters {
    pub extent: u32,
    pub tile_size: u32,
    pub buffer_pixels: u32,
    pub min_pixel_size: f64,
    pub max_relative_area_change: f64,
    pub max_absolute_area_change: f64,
    /// Drop features whose geometry is still invalid after repair
    pub ignore_invalid_geometries: bool,
}

impl Default for TilingParameters {
    fn default() -> Self {
        Self {
            extent: DEFAULT_EXTENT,
            tile_size: DEFAULT_TILE_SIZE,
            buffer_pixels: DEFAULT_BUFFER_PIXELS,
            min_pixel_size: 0.5,
            max_relative_area_change: 0.1,
            max_absolute_area_change: 1.0,
            ignore_invalid_geometries: false,
        }
    }
}

impl TilingParameters {
    /// Set the tile extent.
    pub fn with_extent(mut self, extent: u32) -> Self {
        self.extent = extent;
        self
    }

    /// Set the buffer in pixels.
    pub fn with_buffer(mut self, buffer_pixels: u32) -> Self {
        self.buffer_pixels = buffer_pixels;
        self
    }

    pub fn with_min_pixel_size(mut self, min_pixel_size: f64) -> Self {
        self.min_pixel_size = min_pixel_size;
        self
    }

    pub fn with_ignore_invalid_geometries(mut self, ignore: bool) -> Self {
        self.ignore_invalid_geometries = ignore;
        self
    }

    /// Encoded units per pixel, the inverse of the precision grid step.
    pub fn precision_scale(&self) -> f64 {
        self.extent as f64 / self.tile_size as f64
    }

    fn validate(&self, context: &str) -> Result<()> {
        if self.extent == 0 || self.tile_size == 0 {
            return Err(Error::Config(format!(
                "{context}: extent and tile_size must be positive"
            )));
        }
        if !(self.min_pixel_size >= 0.0)
            || !(self.max_relative_area_change >= 0.0)
            || !(self.max_absolute_area_change >= 0.0)
        {
            return Err(Error::Config(format!(
                "{context}: pixel and area thresholds must be non-negative"
            )));
        }
        Ok(())
    }
}

/// Union polygons sharing the same `group_by` values within a zoom range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRule {
    #[serde(default)]
    pub min_zoom: u8,
    #[serde(default = "max_zoom_level")]
    pub max_zoom: u8,
    pub group_by: Vec<String>,
    /// Properties to keep on merged features besides the group keys
    #[serde(default)]
    pub properties: Vec<String>,
    /// Keep every property of the representative feature
    #[serde(default)]
    pub all_properties: bool,
}

fn max_zoom_level() -> u8 {
    MAX_ZOOM
}

fn enabled_by_default() -> bool {
    true
}

impl MergeRule {
    pub fn is_active(&self, zoom: u8) -> bool {
        (self.min_zoom..=self.max_zoom).contains(&zoom)
    }
}

/// Per-collection settings; `None` fields inherit from the dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub cache: Option<CacheBackend>,
    /// Replaces the dataset's tiling parameters entirely
    #[serde(default)]
    pub tiling: Option<TilingParameters>,
    #[serde(default)]
    pub merge: Vec<MergeRule>,
    /// Properties to encode; empty means all
    #[serde(default)]
    pub properties: Vec<String>,
    /// Maximum number of features per tile
    #[serde(default)]
    pub limit: Option<usize>,
    /// GeoJSON FeatureCollection for the file-backed feature source
    #[serde(default)]
    pub features: Option<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub geometry_type: Option<GeometryKind>,
    /// Attribute name → "String" | "Number" | "Boolean"
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache: None,
            tiling: None,
            merge: Vec::new(),
            properties: Vec::new(),
            limit: None,
            features: None,
            description: None,
            geometry_type: None,
            fields: BTreeMap::new(),
        }
    }
}

/// One dataset and its collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    #[serde(default)]
    pub description: Option<String>,
    /// CRS84 `[min_lon, min_lat, max_lon, max_lat]`
    #[serde(default = "whole_world")]
    pub extent: [f64; 4],
    /// Tiling scheme id → served zoom levels
    #[serde(default = "default_tile_sets")]
    pub tile_sets: BTreeMap<String, ZoomRange>,
    #[serde(default)]
    pub cache: CacheBackend,
    #[serde(default)]
    pub tiling: TilingParameters,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionConfig>,
}

fn whole_world() -> [f64; 4] {
    [-180.0, -90.0, 180.0, 90.0]
}

fn default_tile_sets() -> BTreeMap<String, ZoomRange> {
    BTreeMap::from([(TilingScheme::WebMercatorQuad.id().to_string(), ZoomRange::new(0, 14))])
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            description: None,
            extent: whole_world(),
            tile_sets: default_tile_sets(),
            cache: CacheBackend::default(),
            tiling: TilingParameters::default(),
            collections: BTreeMap::new(),
        }
    }
}

impl DatasetConfig {
    pub fn extent_bounds(&self) -> TileBounds {
        let [min_x, min_y, max_x, max_y] = self.extent;
        TileBounds::new(min_x, min_y, max_x, max_y)
    }

    pub fn with_collection(mut self, id: impl Into<String>, collection: CollectionConfig) -> Self {
        self.collections.insert(id.into(), collection);
        self
    }
}

/// Root configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilesConfig {
    pub cache_root: PathBuf,
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl TilesConfig {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            datasets: BTreeMap::new(),
        }
    }

    pub fn with_dataset(mut self, id: impl Into<String>, dataset: DatasetConfig) -> Self {
        self.datasets.insert(id.into(), dataset);
        self
    }

    /// Load and validate a JSON configuration file.
    ///
    /// Relative `features` paths resolve against the file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut config: TilesConfig = serde_json::from_str(&text)?;

        if let Some(base) = path.parent() {
            for dataset in config.datasets.values_mut() {
                for collection in dataset.collections.values_mut() {
                    if let Some(features) = collection.features.as_mut() {
                        if features.is_relative() {
                            *features = base.join(&*features);
                        }
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check scheme ids, zoom ranges and thresholds.
    pub fn validate(&self) -> Result<()> {
        for (dataset_id, dataset) in &self.datasets {
            if !dataset.extent_bounds().is_valid() {
                return Err(Error::Config(format!("{dataset_id}: extent is empty")));
            }
            for (scheme_id, zooms) in &dataset.tile_sets {
                if TilingScheme::from_id(scheme_id).is_none() {
                    return Err(Error::Config(format!(
                        "{dataset_id}: unknown tiling scheme '{scheme_id}'"
                    )));
                }
                if zooms.min > zooms.max || zooms.max > max_zoom_level() {
                    return Err(Error::Config(format!(
                        "{dataset_id}: invalid zoom range {}..{} for {scheme_id}",
                        zooms.min, zooms.max
                    )));
                }
            }
            dataset.tiling.validate(dataset_id)?;
            for (collection_id, collection) in &dataset.collections {
                let context = format!("{dataset_id}/{collection_id}");
                if let Some(tiling) = &collection.tiling {
                    tiling.validate(&context)?;
                }
                if collection.merge.iter().any(|rule| rule.group_by.is_empty()) {
                    return Err(Error::Config(format!("{context}: merge rule without group_by")));
                }
            }
        }
        Ok(())
    }
}

/// A layer as declared in tile set metadata
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescription {
    pub id: String,
    pub description: Option<String>,
    pub geometry_type: Option<GeometryKind>,
    pub fields: BTreeMap<String, String>,
}

impl LayerDescription {
    fn from_collection(id: &str, collection: &CollectionConfig) -> Self {
        Self {
            id: id.to_string(),
            description: collection.description.clone(),
            geometry_type: collection.geometry_type,
            fields: collection.fields.clone(),
        }
    }
}

/// Effective settings for one (dataset, collection-or-all) tile set
#[derive(Debug, Clone, PartialEq)]
pub struct TileSetConfig {
    pub dataset: String,
    pub collection: Option<String>,
    pub description: Option<String>,
    /// Layers the tile set's tiles contain
    pub layers: Vec<LayerDescription>,
    pub cache: CacheBackend,
    pub tiling: TilingParameters,
    pub tile_sets: BTreeMap<String, ZoomRange>,
    /// CRS84 extent of the dataset
    pub extent: TileBounds,
    pub merge: Vec<MergeRule>,
    pub properties: Vec<String>,
    pub limit: Option<usize>,
}

impl TileSetConfig {
    /// The first merge rule active at `zoom`, if any
    pub fn merge_rule(&self, zoom: u8) -> Option<&MergeRule> {
        self.merge.iter().find(|rule| rule.is_active(zoom))
    }

    pub fn zoom_range(&self, scheme: &str) -> Option<ZoomRange> {
        self.tile_sets.get(scheme).copied()
    }
}

/// Configuration lookups the tile pipeline needs.
pub trait ConfigLookup: Send + Sync {
    /// Resolved settings; `None` if the dataset or collection is unknown or disabled.
    fn tile_set(&self, dataset: &str, collection: Option<&str>) -> Option<TileSetConfig>;

    /// Ids of all enabled collections of a dataset, in a stable order.
    fn enabled_collections(&self, dataset: &str) -> Vec<String>;

    /// CRS84 extent of a dataset.
    fn dataset_extent(&self, dataset: &str) -> Option<TileBounds> {
        self.tile_set(dataset, None).map(|ts| ts.extent)
    }

    /// Which cache backend persists the tile set, file tree unless configured otherwise.
    fn cache_backend(&self, dataset: &str, collection: Option<&str>) -> CacheBackend {
        self.tile_set(dataset, collection)
            .map(|ts| ts.cache)
            .unwrap_or_default()
    }
}

impl ConfigLookup for TilesConfig {
    fn tile_set(&self, dataset: &str, collection: Option<&str>) -> Option<TileSetConfig> {
        let ds = self.datasets.get(dataset)?;
        let mut resolved = TileSetConfig {
            dataset: dataset.to_string(),
            collection: None,
            description: ds.description.clone(),
            layers: ds
                .collections
                .iter()
                .filter(|(_, c)| c.enabled)
                .map(|(id, c)| LayerDescription::from_collection(id, c))
                .collect(),
            cache: ds.cache,
            tiling: ds.tiling,
            tile_sets: ds.tile_sets.clone(),
            extent: ds.extent_bounds(),
            merge: Vec::new(),
            properties: Vec::new(),
            limit: None,
        };

        if let Some(collection_id) = collection {
            let coll = ds.collections.get(collection_id).filter(|c| c.enabled)?;
            resolved.collection = Some(collection_id.to_string());
            resolved.description = coll.description.clone().or(resolved.description);
            resolved.layers = vec![LayerDescription::from_collection(collection_id, coll)];
            resolved.cache = coll.cache.unwrap_or(ds.cache);
            resolved.tiling = coll.tiling.unwrap_or(ds.tiling);
            resolved.merge = coll.merge.clone();
            resolved.properties = coll.properties.clone();
            resolved.limit = coll.limit;
        }

        Some(resolved)
    }

    fn enabled_collections(&self, dataset: &str) -> Vec<String> {
        self.datasets
            .get(dataset)
            .map(|ds| {
                ds.collections
                    .iter()
                    .filter(|(_, c)| c.enabled)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}
