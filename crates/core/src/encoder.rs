//! Feature stream to single-layer tile.
//!
//! A [`TileEncoder`] is created for exactly one tile coordinate. Features are
//! pushed through the geometry transform one at a time; polygons that fall
//! under an active merge rule are held back and unioned when the encoder is
//! finished. [`TileEncoder::finish`] consumes the encoder, so the tile buffer
//! is finalized exactly once.

use std::panic::{catch_unwind, AssertUnwindSafe};

use geo::{Coord, CoordsIter, Geometry, MapCoords};

use crate::config::{MergeRule, TileSetConfig, TilingParameters};
use crate::merge::{merge_features, MergeableFeature};
use crate::mvt::{LayerBuilder, Properties, TileBuilder};
use crate::precision::to_multipolygon;
use crate::property_filter::PropertyFilter;
use crate::source::{CancellationToken, FeatureStream, SourceFeature};
use crate::tile::{TileCoordinate, TilingScheme};
use crate::transform::{TileGeometry, TileTransform};
use crate::validate::is_valid_geometry;
use crate::{Error, Result};

/// Counters for one encoded tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    pub features_read: usize,
    pub features_encoded: usize,
    /// Features without geometry
    pub features_without_geometry: usize,
    /// Features the transform left nothing of
    pub features_dropped: usize,
    pub invalid_dropped: usize,
    /// Features skipped because processing them failed
    pub features_failed: usize,
    pub features_merged: usize,
}

/// The finalized tile bytes
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTile {
    pub data: Vec<u8>,
    pub stats: EncodeStats,
}

impl EncodedTile {
    /// True when the tile carries no features.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

enum Outcome {
    Encoded,
    Buffered,
    NoGeometry,
    Dropped,
    InvalidDropped,
}

/// Encodes the features of one tile into one layer.
pub struct TileEncoder {
    scheme: TilingScheme,
    transform: TileTransform,
    params: TilingParameters,
    merge_rule: Option<MergeRule>,
    filter: PropertyFilter,
    layer: LayerBuilder,
    merge_buffer: Vec<MergeableFeature>,
    sequence: u64,
    stats: EncodeStats,
}

impl TileEncoder {
    pub fn new(
        layer_name: impl Into<String>,
        coord: &TileCoordinate,
        scheme: TilingScheme,
        tile_set: &TileSetConfig,
    ) -> Self {
        let params = tile_set.tiling;
        let transform = TileTransform::for_tile(scheme, coord.zoom, coord.row, coord.col, &params);
        let layer = LayerBuilder::new(layer_name)
            .with_extent(params.extent)
            .with_scale(transform.precision().scale());

        Self {
            scheme,
            transform,
            params,
            merge_rule: tile_set.merge_rule(coord.zoom).cloned(),
            filter: PropertyFilter::from_selection(&tile_set.properties),
            layer,
            merge_buffer: Vec::new(),
            sequence: 0,
            stats: EncodeStats::default(),
        }
    }

    /// Process one feature.
    ///
    /// Never fails: errors and panics while handling a feature are logged and
    /// the feature is skipped.
    pub fn add_feature(&mut self, feature: &SourceFeature) {
        self.track(feature, |encoder| encoder.process(feature));
    }

    fn track(&mut self, feature: &SourceFeature, step: impl FnOnce(&mut Self) -> Result<Outcome>) {
        self.stats.features_read += 1;
        self.sequence += 1;

        let outcome = catch_unwind(AssertUnwindSafe(|| step(&mut *self)));
        match outcome {
            Ok(Ok(Outcome::Encoded)) => self.stats.features_encoded += 1,
            Ok(Ok(Outcome::Buffered)) => self.stats.features_merged += 1,
            Ok(Ok(Outcome::NoGeometry)) => self.stats.features_without_geometry += 1,
            Ok(Ok(Outcome::Dropped)) => self.stats.features_dropped += 1,
            Ok(Ok(Outcome::InvalidDropped)) => self.stats.invalid_dropped += 1,
            Ok(Err(e)) => {
                log::warn!("skipping feature {}: {e}", self.describe(feature));
                self.stats.features_failed += 1;
            }
            Err(_) => {
                log::warn!("skipping feature {}: panic while encoding", self.describe(feature));
                self.stats.features_failed += 1;
            }
        }
    }

    fn describe(&self, feature: &SourceFeature) -> String {
        feature
            .id
            .clone()
            .unwrap_or_else(|| format!("#{}", self.sequence))
    }

    fn process(&mut self, feature: &SourceFeature) -> Result<Outcome> {
        let Some(geometry) = &feature.geometry else {
            return Ok(Outcome::NoGeometry);
        };

        let world = self.to_world(geometry, feature)?;
        let Some(tile_geometry) = self.transform.apply(&world) else {
            return Ok(Outcome::Dropped);
        };
        self.place(feature, tile_geometry)
    }

    /// Buffer for merging, drop under the invalid policy, or encode.
    fn place(&mut self, feature: &SourceFeature, tile_geometry: TileGeometry) -> Result<Outcome> {
        let polygonal = matches!(
            tile_geometry.geometry,
            Geometry::Polygon(_) | Geometry::MultiPolygon(_)
        );
        if self.merge_rule.is_some() && polygonal {
            self.merge_buffer.push(MergeableFeature {
                id: self.sequence,
                properties: feature.properties.clone(),
                geometry: to_multipolygon(&tile_geometry.geometry),
            });
            return Ok(Outcome::Buffered);
        }

        if !tile_geometry.valid && self.params.ignore_invalid_geometries {
            return Ok(Outcome::InvalidDropped);
        }

        let id = feature
            .id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
            .unwrap_or(self.sequence);
        let properties = self.filter.apply(feature.properties.clone());
        if self.layer.add_feature(Some(id), &tile_geometry.geometry, &properties) {
            Ok(Outcome::Encoded)
        } else {
            Ok(Outcome::Dropped)
        }
    }

    /// CRS84 to world coordinates of the tiling scheme.
    fn to_world(&self, geometry: &Geometry<f64>, feature: &SourceFeature) -> Result<Geometry<f64>> {
        let scheme = self.scheme;
        let world = geometry.map_coords(|c| {
            let (x, y) = scheme.project(c.x, c.y);
            Coord { x, y }
        });
        if !world.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
            return Err(Error::InvalidGeometry {
                feature_id: self.describe(feature),
                reason: "non-finite coordinate".to_string(),
            });
        }
        Ok(world)
    }

    /// Consume a whole feature stream.
    ///
    /// Stops with [`Error::Cancelled`] as soon as `cancel` fires or the
    /// stream reports cancellation; nothing is finalized in that case.
    /// Stream errors end the tile as a failed generation.
    pub fn consume(&mut self, stream: FeatureStream, cancel: &CancellationToken) -> Result<()> {
        for item in stream {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let feature = item?;
            self.add_feature(&feature);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Merge buffered polygons and serialize the tile.
    pub fn finish(mut self) -> EncodedTile {
        if let Some(rule) = self.merge_rule.take() {
            if !self.merge_buffer.is_empty() {
                self.encode_merged(&rule);
            }
        }

        let stats = self.stats;
        let mut tile = TileBuilder::new();
        tile.add_layer(self.layer.build());
        let data = tile.encode();
        log::debug!(
            "encoded tile: {} of {} features, {} bytes",
            stats.features_encoded,
            stats.features_read,
            data.len()
        );
        EncodedTile { data, stats }
    }

    fn encode_merged(&mut self, rule: &MergeRule) {
        let buffered = std::mem::take(&mut self.merge_buffer);
        for merged in merge_features(&buffered, rule) {
            if self.params.ignore_invalid_geometries && !is_valid_geometry(&merged.geometry) {
                self.stats.invalid_dropped += 1;
                continue;
            }
            self.sequence += 1;
            let properties: Properties = merged.properties;
            if self.layer.add_feature(Some(self.sequence), &merged.geometry, &properties) {
                self.stats.features_encoded += 1;
            }
        }
    }
}

/// Encode a full stream for `coord` in one call.
pub fn encode_tile(
    layer_name: &str,
    coord: &TileCoordinate,
    scheme: TilingScheme,
    tile_set: &TileSetConfig,
    stream: FeatureStream,
    cancel: &CancellationToken,
) -> Result<EncodedTile> {
    let mut encoder = TileEncoder::new(layer_name, coord, scheme, tile_set);
    encoder.consume(stream, cancel)?;
    Ok(encoder.finish())
}
