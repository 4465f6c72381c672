//! Vector tile generation and caching for feature datasets.
//!
//! This library turns feature geometry into compact, pre-clipped Mapbox Vector
//! Tiles and keeps them in a pluggable tile cache. The pieces, leaves first:
//!
//! - [`transform`]: source geometry → tile-local pixel geometry (filter,
//!   simplify, snap, repair, clip)
//! - [`encoder`]: drives a feature stream through the transform into one tile
//! - [`merge`]: unions same-keyed polygons before encoding
//! - [`cache`]: file-tree and embedded (MBTiles) backends plus a scratch area
//! - [`combine`]: assembles multi-layer tiles from single-layer tiles
//! - [`pipeline`]: the request-level orchestration tying everything together
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use featuretiles_core::config::TilesConfig;
//! use featuretiles_core::pipeline::TileService;
//! use featuretiles_core::source::GeoJsonFeatureSource;
//! use featuretiles_core::tile::TileCoordinate;
//!
//! let config = Arc::new(TilesConfig::from_path("tiles.json").unwrap());
//! let source = Arc::new(GeoJsonFeatureSource::from_config(&config).unwrap());
//! let service = TileService::new(config, source).unwrap();
//!
//! let coord = TileCoordinate::new("roads", Some("highways"), "WebMercatorQuad", 10, 5, 7);
//! let tile = service.get_tile(&coord).unwrap();
//! println!("{} bytes", tile.data.len());
//! ```

use thiserror::Error;

/// MVT protobuf message types.
pub mod vector_tile;

pub mod cache;
pub mod clip;
pub mod combine;
pub mod config;
pub mod encoder;
#[cfg(test)]
mod integration_tests;
pub mod merge;
pub mod mvt;
mod overlay;
pub mod pipeline;
pub mod precision;
pub mod property_filter;
pub mod repair;
pub mod simplify;
pub mod source;
pub mod tile;
pub mod transform;
pub mod validate;

/// Errors that can occur while generating, caching or combining tiles
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error("Tile generation cancelled, client is gone")]
    Cancelled,

    #[error("Feature query failed: {0}")]
    Query(String),

    #[error("Invalid geometry at feature {feature_id}: {reason}")]
    InvalidGeometry { feature_id: String, reason: String },

    #[error("MVT encoding failed: {0}")]
    MvtEncoding(String),

    #[error("Failed to decode tile: {reason}")]
    TileDecode { retryable: bool, reason: String },

    #[error("Tile cache error: {0}")]
    Cache(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors caused by the request itself rather than by the server.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::NotAcceptable(_))
    }

    /// True when the consumer disconnected before the tile was finished.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
