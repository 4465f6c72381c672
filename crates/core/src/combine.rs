//! Multi-layer tiles from single-layer tiles.
//!
//! A dataset-wide tile is assembled from one tile per collection. Those
//! tiles may be generated concurrently by other requests, so a missing input
//! is not an error: the combiner makes up to [`DEFAULT_PASSES`] passes over
//! the unresolved collections, sleeping between passes, and reports whether
//! every collection made it in.
//!
//! Cache entries are committed atomically, so bytes that are present but do
//! not decode will never become readable. Such a tile is deleted and the
//! combine fails with a structural [`Error::TileDecode`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::cache::TileCacheManager;
use crate::mvt::{decode_tile, DecodedLayer, LayerBuilder, TileBuilder};
use crate::tile::TileCoordinate;
use crate::{Error, Result};

pub const DEFAULT_PASSES: usize = 4;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Where the combiner re-reads inputs between passes.
pub trait TileSource: Send + Sync {
    fn read(&self, coord: &TileCoordinate) -> Option<Vec<u8>>;

    /// The tile was generated and has no features.
    fn is_known_empty(&self, coord: &TileCoordinate) -> bool;

    /// Drop a tile that can never be decoded so it gets regenerated.
    fn delete(&self, coord: &TileCoordinate);
}

impl TileSource for TileCacheManager {
    fn read(&self, coord: &TileCoordinate) -> Option<Vec<u8>> {
        TileCacheManager::read(self, coord)
    }

    fn is_known_empty(&self, coord: &TileCoordinate) -> bool {
        TileCacheManager::is_known_empty(self, coord)
    }

    fn delete(&self, coord: &TileCoordinate) {
        TileCacheManager::delete(self, coord);
    }
}

/// Result of [`Combiner::combine`]
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedTile {
    pub data: Vec<u8>,
    /// False if some collection never became available; do not cache then.
    pub is_complete: bool,
    pub passes: usize,
}

pub struct Combiner<'a> {
    source: &'a dyn TileSource,
    passes: usize,
    backoff: Duration,
}

impl<'a> Combiner<'a> {
    pub fn new(source: &'a dyn TileSource) -> Self {
        Self {
            source,
            passes: DEFAULT_PASSES,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_passes(mut self, passes: usize) -> Self {
        self.passes = passes.max(1);
        self
    }

    /// Combine the collection tiles at `coords`.
    ///
    /// `initial` holds bytes already at hand (freshly generated or read);
    /// later passes re-read from the source. Only absent or empty reads are
    /// retried; a tile that fails to decode is deleted from the source and
    /// fails the combine.
    pub fn combine(
        &self,
        coords: &BTreeMap<String, TileCoordinate>,
        mut initial: BTreeMap<String, Option<Vec<u8>>>,
    ) -> Result<CombinedTile> {
        let mut layers: BTreeMap<String, Vec<DecodedLayer>> = BTreeMap::new();
        let mut unresolved: BTreeSet<&String> = coords.keys().collect();
        let mut passes = 0;

        while !unresolved.is_empty() && passes < self.passes {
            if passes > 0 {
                log::debug!(
                    "waiting {:?} for {} unfinished collection tiles",
                    self.backoff,
                    unresolved.len()
                );
                std::thread::sleep(self.backoff);
            }
            passes += 1;

            let mut resolved = Vec::new();
            for &collection in &unresolved {
                let coord = &coords[collection];
                let bytes = if passes == 1 {
                    initial.remove(collection).flatten()
                } else {
                    self.source.read(coord)
                };

                match bytes {
                    Some(data) if !data.is_empty() => match decode_tile(&data) {
                        Ok(decoded) => {
                            layers.insert(collection.clone(), decoded);
                            resolved.push(collection);
                        }
                        Err(e) => {
                            log::warn!("deleting undecodable tile {coord}: {e}");
                            self.source.delete(coord);
                            return Err(structural(e));
                        }
                    },
                    _ => {
                        if self.source.is_known_empty(coord) {
                            resolved.push(collection);
                        }
                    }
                }
            }
            for collection in resolved {
                unresolved.remove(collection);
            }
        }

        let is_complete = unresolved.is_empty();
        if !is_complete {
            log::warn!(
                "combined tile incomplete after {passes} passes, missing {:?}",
                unresolved
            );
        }

        Ok(CombinedTile {
            data: encode_layers(layers.into_values().flatten()),
            is_complete,
            passes,
        })
    }
}

fn structural(error: Error) -> Error {
    match error {
        Error::TileDecode { reason, .. } => Error::TileDecode {
            retryable: false,
            reason,
        },
        other => other,
    }
}

/// Re-encode decoded layers one to one; coordinates are already in extent units.
fn encode_layers(layers: impl Iterator<Item = DecodedLayer>) -> Vec<u8> {
    let mut tile = TileBuilder::new();
    for layer in layers {
        let mut builder = LayerBuilder::new(layer.name).with_extent(layer.extent);
        for feature in &layer.features {
            builder.add_feature(feature.id, &feature.geometry, &feature.properties);
        }
        tile.add_layer(builder.build());
    }
    tile.encode()
}
