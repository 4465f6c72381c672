//! Tile service - wires together the feature source, encoder, cache and combiner.
//!
//! For one requested [`TileCoordinate`] the service:
//! 1. Checks the coordinate against the configuration (unknown dataset,
//!    collection or scheme, zoom or row/col outside the dataset's limits)
//! 2. Serves the cached bytes when present
//! 3. Otherwise queries the feature source and encodes a single-layer tile,
//!    or, for a dataset-wide tile, resolves every enabled collection and
//!    combines their tiles
//! 4. Writes the result back; cache failures never fail the request
//!
//! A combined tile is only cached once every collection made it in.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{ScratchJanitor, TileCacheManager};
use crate::combine::{Combiner, TileSource, DEFAULT_BACKOFF};
use crate::config::{ConfigLookup, TileSetConfig, TilesConfig};
use crate::encoder::{encode_tile, EncodeStats, EncodedTile};
use crate::source::{CancellationToken, FeatureQuery, FeatureSource};
use crate::tile::{TileBounds, TileCoordinate, TilingScheme};
use crate::{Error, Result};

/// Where the bytes of a [`ServedTile`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileOrigin {
    Cache,
    Generated,
    Combined,
}

/// A tile ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct ServedTile {
    pub coord: TileCoordinate,
    pub data: Vec<u8>,
    pub origin: TileOrigin,
    /// False for a combined tile missing some collection's layer
    pub is_complete: bool,
    /// Encoder counters, summed over collections for combined tiles
    pub stats: EncodeStats,
}

impl ServedTile {
    fn cached(coord: &TileCoordinate, data: Vec<u8>) -> Self {
        Self {
            coord: coord.clone(),
            data,
            origin: TileOrigin::Cache,
            is_complete: true,
            stats: EncodeStats::default(),
        }
    }
}

pub struct TileService {
    config: Arc<dyn ConfigLookup>,
    source: Arc<dyn FeatureSource>,
    cache: TileCacheManager,
    combine_backoff: Duration,
    janitor: Option<ScratchJanitor>,
}

impl TileService {
    /// Service over a validated configuration, caching under its `cache_root`.
    pub fn new(config: Arc<TilesConfig>, source: Arc<dyn FeatureSource>) -> Result<Self> {
        config.validate()?;
        let root = config.cache_root.clone();
        Ok(Self::with_lookup(root, config, source))
    }

    /// Service over any configuration lookup.
    pub fn with_lookup(
        cache_root: impl Into<PathBuf>,
        config: Arc<dyn ConfigLookup>,
        source: Arc<dyn FeatureSource>,
    ) -> Self {
        let cache = TileCacheManager::new(cache_root, Arc::clone(&config));
        Self {
            config,
            source,
            cache,
            combine_backoff: DEFAULT_BACKOFF,
            janitor: None,
        }
    }

    /// Pause between combine passes while collection tiles are still missing.
    pub fn with_combine_backoff(mut self, backoff: Duration) -> Self {
        self.combine_backoff = backoff;
        self
    }

    /// Sweep the scratch area in the background for the service's lifetime.
    pub fn with_janitor(mut self) -> Self {
        self.janitor = Some(self.cache.spawn_janitor());
        self
    }

    pub fn cache(&self) -> &TileCacheManager {
        &self.cache
    }

    pub fn get_tile(&self, coord: &TileCoordinate) -> Result<ServedTile> {
        self.get_tile_cancellable(coord, &CancellationToken::new())
    }

    /// Like [`get_tile`](Self::get_tile), stopping with [`Error::Cancelled`]
    /// once `cancel` fires. Nothing is cached for a cancelled tile.
    pub fn get_tile_cancellable(
        &self,
        coord: &TileCoordinate,
        cancel: &CancellationToken,
    ) -> Result<ServedTile> {
        let (scheme, tile_set) = self.resolve(coord)?;

        if !coord.temporary {
            if let Some(data) = self.cache.read(coord) {
                return Ok(ServedTile::cached(coord, data));
            }
        }

        if coord.is_multi_layer() {
            self.combined_tile(coord, cancel)
        } else {
            let encoded = self.generate_layer(coord, scheme, &tile_set, cancel)?;
            Ok(ServedTile {
                coord: coord.clone(),
                data: encoded.data,
                origin: TileOrigin::Generated,
                is_complete: true,
                stats: encoded.stats,
            })
        }
    }

    /// Delete cached tiles; see [`TileCacheManager::delete_range`].
    pub fn purge(
        &self,
        dataset: &str,
        collection: Option<&str>,
        tiling_scheme: Option<&str>,
        bbox: Option<&TileBounds>,
    ) -> Result<usize> {
        if let Some(id) = tiling_scheme {
            scheme_for(id)?;
        }
        self.cache.delete_range(dataset, collection, tiling_scheme, bbox)
    }

    /// Remove expired temporary tiles now.
    pub fn sweep(&self) -> Result<usize> {
        self.cache.sweep_scratch()
    }

    fn resolve(&self, coord: &TileCoordinate) -> Result<(TilingScheme, TileSetConfig)> {
        let scheme = scheme_for(&coord.tiling_scheme)?;
        let tile_set = self
            .config
            .tile_set(&coord.dataset, coord.collection.as_deref())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "unknown collection {}/{}",
                    coord.dataset,
                    coord.collection_or_all()
                ))
            })?;

        let zooms = tile_set.zoom_range(scheme.id()).ok_or_else(|| {
            Error::NotFound(format!("{} is not served in {}", coord.dataset, scheme))
        })?;
        if !zooms.contains(coord.zoom) {
            return Err(Error::NotFound(format!(
                "zoom {} outside {}..={}",
                coord.zoom, zooms.min, zooms.max
            )));
        }
        let inside = scheme
            .limits_for_bbox(&tile_set.extent, coord.zoom)
            .is_some_and(|limits| limits.contains(coord.row, coord.col));
        if !inside {
            return Err(Error::NotFound(format!("tile {coord} outside the dataset extent")));
        }
        Ok((scheme, tile_set))
    }

    /// Query and encode one collection's tile, then cache it.
    fn generate_layer(
        &self,
        coord: &TileCoordinate,
        scheme: TilingScheme,
        tile_set: &TileSetConfig,
        cancel: &CancellationToken,
    ) -> Result<EncodedTile> {
        let collection = coord.collection_or_all();
        let query = FeatureQuery::new(&coord.dataset, collection)
            .with_bbox(query_bounds(scheme, coord, tile_set))
            .with_properties(tile_set.properties.clone())
            .with_limit(tile_set.limit)
            .with_cancellation(cancel.clone());

        let stream = self.source.query(&query)?;
        let encoded = encode_tile(collection, coord, scheme, tile_set, stream, cancel)?;
        log::debug!(
            "generated {coord}: {} of {} features, {} bytes",
            encoded.stats.features_encoded,
            encoded.stats.features_read,
            encoded.data.len()
        );
        self.cache.write(coord, &encoded.data);
        Ok(encoded)
    }

    fn combined_tile(&self, coord: &TileCoordinate, cancel: &CancellationToken) -> Result<ServedTile> {
        let coords: BTreeMap<String, TileCoordinate> = self
            .config
            .enabled_collections(&coord.dataset)
            .into_iter()
            .map(|id| {
                let collection_coord = coord.for_collection(&id);
                (id, collection_coord)
            })
            .collect();

        let mut initial = BTreeMap::new();
        let mut missing = Vec::new();
        for (id, collection_coord) in &coords {
            let cached = if collection_coord.temporary {
                None
            } else {
                self.cache.read(collection_coord)
            };
            match cached {
                Some(data) => {
                    initial.insert(id.clone(), Some(data));
                }
                None => missing.push((id, collection_coord)),
            }
        }

        let generated: Vec<(String, Result<EncodedTile>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = missing
                .into_iter()
                .map(|(id, collection_coord)| {
                    let handle = scope.spawn(move || {
                        let (scheme, tile_set) = self.resolve(collection_coord)?;
                        self.generate_layer(collection_coord, scheme, &tile_set, cancel)
                    });
                    (id.clone(), handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(Error::MvtEncoding(format!("generating layer {id} panicked")))
                    });
                    (id, result)
                })
                .collect()
        });

        let mut stats = EncodeStats::default();
        let mut fresh_empty = HashSet::new();
        for (id, result) in generated {
            let encoded = result?;
            add_stats(&mut stats, &encoded.stats);
            if encoded.is_empty() {
                fresh_empty.insert(coords[&id].clone());
            }
            initial.insert(id, Some(encoded.data));
        }

        let source = FreshTiles {
            cache: &self.cache,
            empty: fresh_empty,
        };
        let combined = Combiner::new(&source)
            .with_backoff(self.combine_backoff)
            .combine(&coords, initial)?;

        if combined.is_complete {
            self.cache.write(coord, &combined.data);
        }
        Ok(ServedTile {
            coord: coord.clone(),
            data: combined.data,
            origin: TileOrigin::Combined,
            is_complete: combined.is_complete,
            stats,
        })
    }
}

/// The cache, plus the empty tiles this request generated itself.
struct FreshTiles<'a> {
    cache: &'a TileCacheManager,
    empty: HashSet<TileCoordinate>,
}

impl TileSource for FreshTiles<'_> {
    fn read(&self, coord: &TileCoordinate) -> Option<Vec<u8>> {
        self.cache.read(coord)
    }

    fn is_known_empty(&self, coord: &TileCoordinate) -> bool {
        self.empty.contains(coord) || self.cache.is_known_empty(coord)
    }

    fn delete(&self, coord: &TileCoordinate) {
        self.cache.delete(coord);
    }
}

fn scheme_for(id: &str) -> Result<TilingScheme> {
    TilingScheme::from_id(id).ok_or_else(|| Error::NotAcceptable(format!("unknown tiling scheme {id}")))
}

/// CRS84 bounds of the tile grown by the clip buffer.
fn query_bounds(scheme: TilingScheme, coord: &TileCoordinate, tile_set: &TileSetConfig) -> TileBounds {
    let bounds = scheme.tile_bounds_crs84(coord.zoom, coord.row, coord.col);
    let params = &tile_set.tiling;
    let margin = params.buffer_pixels as f64 / params.tile_size as f64;
    let dx = bounds.width() * margin;
    let dy = bounds.height() * margin;
    TileBounds::new(
        bounds.min_x - dx,
        bounds.min_y - dy,
        bounds.max_x + dx,
        bounds.max_y + dy,
    )
}

fn add_stats(total: &mut EncodeStats, other: &EncodeStats) {
    total.features_read += other.features_read;
    total.features_encoded += other.features_encoded;
    total.features_without_geometry += other.features_without_geometry;
    total.features_dropped += other.features_dropped;
    total.invalid_dropped += other.invalid_dropped;
    total.features_failed += other.features_failed;
    total.features_merged += other.features_merged;
}
