//! MBTiles container backend.
//!
//! One SQLite file per (dataset, collection, tiling scheme) at
//! `{root}/{dataset}/{collection|__all__}/{scheme}.mbtiles`. Rows are stored
//! TMS-style, so the row is flipped: `tile_row = rows_at_zoom - 1 - row`.
//! Non-empty tile data is gzip-compressed; an empty tile is stored as a
//! zero-length blob so it stays distinguishable from a missing tile.
//!
//! The connection is opened, and the metadata table filled, on first access.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;

use crate::config::{GeometryKind, TileSetConfig};
use crate::tile::{TileCoordinate, TileMatrixLimits, TilingScheme, MAX_ZOOM};
use crate::{Error, Result};

use super::{TileSetKey, TileStore};

pub const CONTAINER_EXTENSION: &str = "mbtiles";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Name/value pairs for the `metadata` table
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerMetadata {
    pub entries: Vec<(String, String)>,
}

impl ContainerMetadata {
    /// Describe a tile set in MBTiles 1.3 terms.
    pub fn for_tile_set(key: &TileSetKey, tile_set: &TileSetConfig) -> Self {
        let zooms = tile_set.zoom_range(&key.tiling_scheme);
        let (min_zoom, max_zoom) = zooms.map(|z| (z.min, z.max)).unwrap_or((0, 0));
        let e = &tile_set.extent;
        let (center_x, center_y) = e.center();

        let vector_layers: Vec<_> = tile_set
            .layers
            .iter()
            .map(|layer| {
                json!({
                    "id": layer.id,
                    "description": layer.description.clone().unwrap_or_default(),
                    "minzoom": min_zoom,
                    "maxzoom": max_zoom,
                    "fields": layer.fields,
                })
            })
            .collect();
        let tilestats: Vec<_> = tile_set
            .layers
            .iter()
            .map(|layer| {
                let mut entry = json!({
                    "layer": layer.id,
                    "attributeCount": layer.fields.len(),
                });
                if let Some(kind) = layer.geometry_type {
                    entry["geometry"] = json!(geometry_name(kind));
                }
                entry
            })
            .collect();
        let document = json!({
            "vector_layers": vector_layers,
            "tilestats": { "layerCount": tilestats.len(), "layers": tilestats },
        });

        let entries = vec![
            ("name".to_string(), format!("{}/{}", key.dataset, key.collection)),
            (
                "description".to_string(),
                tile_set.description.clone().unwrap_or_default(),
            ),
            ("format".to_string(), "pbf".to_string()),
            ("type".to_string(), "overlay".to_string()),
            ("minzoom".to_string(), min_zoom.to_string()),
            ("maxzoom".to_string(), max_zoom.to_string()),
            (
                "bounds".to_string(),
                format!("{},{},{},{}", e.min_x, e.min_y, e.max_x, e.max_y),
            ),
            (
                "center".to_string(),
                format!("{center_x},{center_y},{min_zoom}"),
            ),
            ("json".to_string(), document.to_string()),
        ];
        Self { entries }
    }
}

fn geometry_name(kind: GeometryKind) -> &'static str {
    match kind {
        GeometryKind::Point => "Point",
        GeometryKind::Line => "LineString",
        GeometryKind::Polygon => "Polygon",
    }
}

pub struct MbtilesStore {
    path: PathBuf,
    scheme: TilingScheme,
    metadata: ContainerMetadata,
    conn: Mutex<Option<Connection>>,
}

impl MbtilesStore {
    pub fn new(path: impl Into<PathBuf>, scheme: TilingScheme, metadata: ContainerMetadata) -> Self {
        Self {
            path: path.into(),
            scheme,
            metadata,
            conn: Mutex::new(None),
        }
    }

    pub fn container_path(root: &Path, key: &TileSetKey) -> PathBuf {
        root.join(&key.dataset)
            .join(&key.collection)
            .join(format!("{}.{CONTAINER_EXTENSION}", key.tiling_scheme))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the connection, opening the container first if needed.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::Cache(format!("{}: connection lock poisoned", self.path.display())))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        match guard.as_ref() {
            Some(conn) => Ok(f(conn)?),
            None => Err(Error::Cache(format!("{}: not open", self.path.display()))),
        }
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT);
            CREATE UNIQUE INDEX IF NOT EXISTS metadata_name ON metadata (name);
            CREATE TABLE IF NOT EXISTS tiles (
                zoom_level INTEGER,
                tile_column INTEGER,
                tile_row INTEGER,
                tile_data BLOB
            );
            CREATE UNIQUE INDEX IF NOT EXISTS tile_index ON tiles (zoom_level, tile_column, tile_row);
            ",
        )?;

        let has_metadata: Option<i64> = conn
            .query_row("SELECT 1 FROM metadata LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if has_metadata.is_none() {
            for (name, value) in &self.metadata.entries {
                conn.execute(
                    "INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)",
                    params![name, value],
                )?;
            }
            log::debug!("created tile container {}", self.path.display());
        }
        Ok(conn)
    }

    fn flipped_row(&self, zoom: u8, row: u32) -> Result<i64> {
        if zoom > MAX_ZOOM {
            return Err(Error::NotFound(format!("zoom {zoom} is beyond {MAX_ZOOM}")));
        }
        Ok(i64::from(self.scheme.matrix_height(zoom)) - 1 - i64::from(row))
    }

    /// Metadata value stored in the container.
    pub fn metadata_value(&self, name: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT value FROM metadata WHERE name = ?1", params![name], |row| {
                row.get(0)
            })
            .optional()
        })
    }
}

impl TileStore for MbtilesStore {
    fn exists(&self, coord: &TileCoordinate) -> Result<bool> {
        let row = self.flipped_row(coord.zoom, coord.row)?;
        let found: Option<i64> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![coord.zoom, coord.col, row],
                |r| r.get(0),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    fn read(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>> {
        let row = self.flipped_row(coord.zoom, coord.row)?;
        let stored: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![coord.zoom, coord.col, row],
                |r| r.get(0),
            )
            .optional()
        })?;
        stored.map(|data| decompress(&data).map_err(Error::from)).transpose()
    }

    fn write(&self, coord: &TileCoordinate, data: &[u8]) -> Result<()> {
        let row = self.flipped_row(coord.zoom, coord.row)?;
        let stored = compress(data)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
                params![coord.zoom, coord.col, row, stored],
            )
        })?;
        Ok(())
    }

    fn delete(&self, coord: &TileCoordinate) -> Result<bool> {
        let row = self.flipped_row(coord.zoom, coord.row)?;
        let changed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                params![coord.zoom, coord.col, row],
            )
        })?;
        Ok(changed > 0)
    }

    fn delete_limits(&self, _key: &TileSetKey, limits: &TileMatrixLimits) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        // max_row flips to the smallest stored row
        let low = self.flipped_row(limits.zoom, limits.max_row)?;
        let high = self.flipped_row(limits.zoom, limits.min_row)?;
        let changed = self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM tiles WHERE zoom_level = ?1
                   AND tile_column BETWEEN ?2 AND ?3
                   AND tile_row BETWEEN ?4 AND ?5",
                params![limits.zoom, limits.min_col, limits.max_col, low, high],
            )
        })?;
        Ok(changed)
    }
}

fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    if !data.starts_with(&GZIP_MAGIC) {
        return Ok(data.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(data).read_to_end(&mut decoded)?;
    Ok(decoded)
}
