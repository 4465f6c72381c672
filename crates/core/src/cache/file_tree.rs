//! One file per tile.
//!
//! Layout: `{root}/{dataset}/{collection|__all__}/{scheme}/{zoom}/{row}/{col}.pbf`.
//! Writes go to a sibling temporary file that is renamed into place, so a
//! reader never sees a half-written tile from this backend.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::tile::{TileCoordinate, TileMatrixLimits};
use crate::Result;

use super::{TileSetKey, TileStore};

pub const TILE_EXTENSION: &str = "pbf";

static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileTreeStore {
    root: PathBuf,
}

impl FileTreeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn tile_set_dir(&self, key: &TileSetKey) -> PathBuf {
        self.root
            .join(&key.dataset)
            .join(&key.collection)
            .join(&key.tiling_scheme)
    }

    pub fn tile_path(&self, coord: &TileCoordinate) -> PathBuf {
        self.tile_set_dir(&TileSetKey::for_coordinate(coord))
            .join(coord.zoom.to_string())
            .join(coord.row.to_string())
            .join(format!("{}.{TILE_EXTENSION}", coord.col))
    }
}

impl TileStore for FileTreeStore {
    fn exists(&self, coord: &TileCoordinate) -> Result<bool> {
        Ok(self.tile_path(coord).is_file())
    }

    fn read(&self, coord: &TileCoordinate) -> Result<Option<Vec<u8>>> {
        match fs::read(self.tile_path(coord)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, coord: &TileCoordinate, data: &[u8]) -> Result<()> {
        let path = self.tile_path(coord);
        write_atomic(&path, data)?;
        Ok(())
    }

    fn delete(&self, coord: &TileCoordinate) -> Result<bool> {
        remove_if_present(&self.tile_path(coord))
    }

    fn delete_limits(&self, key: &TileSetKey, limits: &TileMatrixLimits) -> Result<usize> {
        let zoom_dir = self.tile_set_dir(key).join(limits.zoom.to_string());
        let rows = match fs::read_dir(&zoom_dir) {
            Ok(rows) => rows,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut deleted = 0;
        for row_entry in rows {
            let row_entry = row_entry?;
            let Some(row) = parse_index(&row_entry.file_name()) else {
                continue;
            };
            if row < limits.min_row || row > limits.max_row {
                continue;
            }
            for col in limits.min_col..=limits.max_col {
                let path = row_entry.path().join(format!("{col}.{TILE_EXTENSION}"));
                if remove_if_present(&path)? {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

fn parse_index(name: &std::ffi::OsStr) -> Option<u32> {
    name.to_str()?.parse().ok()
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Write through a uniquely named sibling and rename into place.
///
/// Concurrent directory creation is fine: `create_dir_all` treats an existing
/// directory as success.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "tile path has no parent"))?;
    fs::create_dir_all(dir)?;

    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("tile");
    let tmp = dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        WRITE_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(zoom: u8, row: u32, col: u32) -> TileCoordinate {
        TileCoordinate::new("ds", Some("roads"), "WebMercatorQuad", zoom, row, col)
    }

    #[test]
    fn test_tile_path_layout() {
        let store = FileTreeStore::new("/cache");
        assert_eq!(
            store.tile_path(&coord(10, 5, 7)),
            PathBuf::from("/cache/ds/roads/WebMercatorQuad/10/5/7.pbf")
        );
        let all = TileCoordinate::new("ds", None, "WebMercatorQuad", 1, 0, 1);
        assert_eq!(
            store.tile_path(&all),
            PathBuf::from("/cache/ds/__all__/WebMercatorQuad/1/0/1.pbf")
        );
    }

    #[test]
    fn test_write_read_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTreeStore::new(dir.path());
        let c = coord(3, 2, 1);

        assert_eq!(store.read(&c).unwrap(), None);
        store.write(&c, b"tile").unwrap();
        assert!(store.exists(&c).unwrap());
        assert_eq!(store.read(&c).unwrap(), Some(b"tile".to_vec()));

        assert!(store.delete(&c).unwrap());
        assert!(!store.delete(&c).unwrap());
        assert!(!store.exists(&c).unwrap());
    }

    #[test]
    fn test_no_temporary_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTreeStore::new(dir.path());
        let c = coord(3, 2, 1);
        store.write(&c, b"a").unwrap();
        store.write(&c, b"b").unwrap();

        let parent = store.tile_path(&c).parent().unwrap().to_path_buf();
        let names: Vec<_> = fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("1.pbf")]);
    }

    #[test]
    fn test_delete_limits_only_inside_rectangle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTreeStore::new(dir.path());
        for (row, col) in [(1, 1), (1, 2), (2, 2), (5, 5)] {
            store.write(&coord(4, row, col), b"x").unwrap();
        }
        let limits = TileMatrixLimits {
            zoom: 4,
            min_row: 1,
            max_row: 2,
            min_col: 2,
            max_col: 3,
        };
        let key = TileSetKey::for_coordinate(&coord(4, 0, 0));
        assert_eq!(store.delete_limits(&key, &limits).unwrap(), 2);
        assert!(store.exists(&coord(4, 1, 1)).unwrap());
        assert!(store.exists(&coord(4, 5, 5)).unwrap());
        // missing zoom directory is not an error
        let empty = TileMatrixLimits { zoom: 9, ..limits };
        assert_eq!(store.delete_limits(&key, &empty).unwrap(), 0);
    }
}
