//! Tile cache.
//!
//! [`TileCacheManager`] maps a [`TileCoordinate`] to the store that holds it:
//!
//! - temporary tiles always go to the [`ScratchArea`]
//! - otherwise the tile set's configured [`CacheBackend`] decides between the
//!   shared [`FileTreeStore`] and one [`MbtilesStore`] per tile set
//!
//! Container stores are created lazily and at most once per tile set; the
//! registry is the only shared mutable state of the cache.
//!
//! The manager's own operations never fail a tile request: read errors count
//! as a miss and write errors are logged and dropped.

pub mod file_tree;
pub mod mbtiles;
pub mod scratch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{CacheBackend, ConfigLookup};
use crate::tile::{
    TileBounds, TileCoordinate, TileMatrixLimits, TilingScheme, ALL_COLLECTIONS, MAX_ZOOM,
};
use crate::{Error, Result};

pub use file_tree::FileTreeStore;
pub use mbtiles::{ContainerMetadata, MbtilesStore};
pub use scratch::{ScratchArea, ScratchJanitor, SCRATCH_TTL};

/// Identifies one tile set: a dataset or collection in one tiling scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileSetKey {
    pub dataset: String,
    /// Collection id, or `__all__` for dataset-wide tiles
    pub collection: String,
    pub tiling_scheme: String,
}

impl TileSetKey {
    pub fn new(dataset: &str, collection: Option<&str>, tiling_scheme: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            collection: collection.unwrap_or(ALL_COLLECTIONS).to_string(),
            tiling_scheme: tiling_scheme.to_string(),
        }
    }

    pub fn for_coordinate(coord: &TileCoordinate) -> Self {
        Self::new(&coord.dataset, coord.collection.as_deref(), &coord.tiling_scheme)
    }
}

/// Storage for tile bytes, keyed by coordinate.
pub trait TileStore: Send + Sync {
    fn exists(&self, coord: &TileCoordinate) -> Result<bool>;

    /// `Ok(None)` on a miss.
    fn read(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>>;

    /// Replace whatever is stored at `coord`.
    fn write(&self, coord: &TileCoordinate, data: &[u8]) -> Result<()>;

    /// Returns whether something was deleted.
    fn delete(&self, coord: &TileCoordinate) -> Result<bool>;

    /// Delete every tile of `key` inside `limits`, returning the count.
    fn delete_limits(&self, key: &TileSetKey, limits: &TileMatrixLimits) -> Result<usize>;
}

pub struct TileCacheManager {
    root: PathBuf,
    config: Arc<dyn ConfigLookup>,
    file_tree: FileTreeStore,
    scratch: Arc<ScratchArea>,
    containers: Mutex<HashMap<TileSetKey, Arc<MbtilesStore>>>,
}

impl TileCacheManager {
    pub fn new(root: impl Into<PathBuf>, config: Arc<dyn ConfigLookup>) -> Self {
        let root = root.into();
        Self {
            file_tree: FileTreeStore::new(&root),
            scratch: Arc::new(ScratchArea::new(&root)),
            root,
            config,
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch(&self) -> Arc<ScratchArea> {
        Arc::clone(&self.scratch)
    }

    /// Start the periodic scratch sweep; it runs until the janitor is dropped.
    pub fn spawn_janitor(&self) -> ScratchJanitor {
        ScratchJanitor::spawn(self.scratch(), self.scratch.ttl())
    }

    fn store_for(&self, coord: &TileCoordinate) -> Result<Arc<dyn TileStore>> {
        if coord.zoom > MAX_ZOOM {
            return Err(Error::NotFound(format!("{coord}: zoom is beyond {MAX_ZOOM}")));
        }
        if coord.temporary {
            let scratch: Arc<dyn TileStore> = self.scratch.clone();
            return Ok(scratch);
        }
        self.store_for_key(&TileSetKey::for_coordinate(coord))
    }

    fn store_for_key(&self, key: &TileSetKey) -> Result<Arc<dyn TileStore>> {
        let collection = (key.collection != ALL_COLLECTIONS).then_some(key.collection.as_str());
        let store: Arc<dyn TileStore> = match self.config.cache_backend(&key.dataset, collection) {
            CacheBackend::FileTree => Arc::new(self.file_tree.clone()),
            CacheBackend::Embedded => self.container(key, collection)?,
        };
        Ok(store)
    }

    /// The container store of a tile set, created on first use.
    fn container(&self, key: &TileSetKey, collection: Option<&str>) -> Result<Arc<MbtilesStore>> {
        let mut containers = self
            .containers
            .lock()
            .map_err(|_| Error::Cache("container registry lock poisoned".to_string()))?;
        if let Some(store) = containers.get(key) {
            return Ok(Arc::clone(store));
        }

        let scheme = TilingScheme::from_id(&key.tiling_scheme)
            .ok_or_else(|| Error::NotAcceptable(format!("unknown tiling scheme {}", key.tiling_scheme)))?;
        let tile_set = self
            .config
            .tile_set(&key.dataset, collection)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", key.dataset, key.collection)))?;
        let store = Arc::new(MbtilesStore::new(
            MbtilesStore::container_path(&self.root, key),
            scheme,
            ContainerMetadata::for_tile_set(key, &tile_set),
        ));
        containers.insert(key.clone(), Arc::clone(&store));
        Ok(store)
    }

    pub fn exists(&self, coord: &TileCoordinate) -> bool {
        match self.store_for(coord).and_then(|store| store.exists(coord)) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("cache lookup failed for {coord}: {e}");
                false
            }
        }
    }

    /// Cached bytes, `None` on a miss or when the cache could not be read.
    pub fn read(&self, coord: &TileCoordinate) -> Option<Vec<u8>> {
        match self.try_read(coord) {
            Ok(Some(data)) => {
                log::debug!("cache hit {coord} ({} bytes)", data.len());
                Some(data)
            }
            Ok(None) => {
                log::debug!("cache miss {coord}");
                None
            }
            Err(e) => {
                log::warn!("cache read failed for {coord}: {e}");
                None
            }
        }
    }

    pub fn try_read(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>> {
        self.store_for(coord)?.read(coord)
    }

    /// Store a tile; failures are logged, never returned.
    pub fn write(&self, coord: &TileCoordinate, data: &[u8]) {
        if let Err(e) = self.store_for(coord).and_then(|store| store.write(coord, data)) {
            log::warn!("cache write failed for {coord}: {e}");
        }
    }

    pub fn delete(&self, coord: &TileCoordinate) -> bool {
        match self.store_for(coord).and_then(|store| store.delete(coord)) {
            Ok(deleted) => deleted,
            Err(e) => {
                log::warn!("cache delete failed for {coord}: {e}");
                false
            }
        }
    }

    /// True when the cache holds a zero-length (featureless) tile for `coord`.
    pub fn is_known_empty(&self, coord: &TileCoordinate) -> bool {
        matches!(self.try_read(coord), Ok(Some(data)) if data.is_empty())
    }

    /// Delete all tiles of a tile set overlapping `bbox` (CRS84) at every configured zoom.
    ///
    /// Without a collection the dataset-wide tile set and every enabled
    /// collection's tile set are purged. Missing tiles are not an error; a bbox
    /// outside the dataset extent deletes nothing.
    pub fn delete_range(
        &self,
        dataset: &str,
        collection: Option<&str>,
        tiling_scheme: Option<&str>,
        bbox: Option<&TileBounds>,
    ) -> Result<usize> {
        let tile_set = self
            .config
            .tile_set(dataset, collection)
            .ok_or_else(|| Error::NotFound(format!("{dataset}/{}", collection.unwrap_or(ALL_COLLECTIONS))))?;

        let mut deleted = 0;
        let area = match bbox {
            Some(b) => b.intersection(&tile_set.extent),
            None => Some(tile_set.extent),
        };

        if let Some(area) = area {
            for (scheme_id, zooms) in &tile_set.tile_sets {
                if tiling_scheme.is_some_and(|s| s != scheme_id) {
                    continue;
                }
                let Some(scheme) = TilingScheme::from_id(scheme_id) else {
                    continue;
                };
                let key = TileSetKey::new(dataset, collection, scheme_id);
                let store = self.store_for_key(&key)?;
                for zoom in zooms.levels() {
                    if let Some(limits) = scheme.limits_for_bbox(&area, zoom) {
                        deleted += store.delete_limits(&key, &limits)?;
                    }
                }
            }
        }

        if collection.is_none() {
            for id in self.config.enabled_collections(dataset) {
                deleted += self.delete_range(dataset, Some(&id), tiling_scheme, bbox)?;
            }
        }

        log::debug!(
            "purged {deleted} tiles from {dataset}/{}",
            collection.unwrap_or(ALL_COLLECTIONS)
        );
        Ok(deleted)
    }

    /// Sweep expired temporary tiles now.
    pub fn sweep_scratch(&self) -> Result<usize> {
        self.scratch.sweep()
    }
}
