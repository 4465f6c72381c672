//! Scratch area for temporary tiles.
//!
//! Temporary tiles live in `{root}/__tmp__/` under opaque names, whatever
//! backend the tile set uses. Files older than the TTL are swept, both by a
//! background [`ScratchJanitor`] and lazily on the first write after a TTL has
//! passed since the previous sweep.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::tile::{TileCoordinate, TileMatrixLimits};
use crate::Result;

use super::file_tree::write_atomic;
use super::{TileSetKey, TileStore};

pub const SCRATCH_DIR: &str = "__tmp__";

/// Age after which scratch files are removed
pub const SCRATCH_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug)]
pub struct ScratchArea {
    dir: PathBuf,
    ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl ScratchArea {
    pub fn new(cache_root: &Path) -> Self {
        Self::with_ttl(cache_root, SCRATCH_TTL)
    }

    pub fn with_ttl(cache_root: &Path, ttl: Duration) -> Self {
        Self {
            dir: cache_root.join(SCRATCH_DIR),
            ttl,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn tile_path(&self, coord: &TileCoordinate) -> PathBuf {
        let name = xxhash_rust::xxh3::xxh3_64(coord.to_string().as_bytes());
        self.dir.join(format!("{name:016x}"))
    }

    /// Remove scratch files older than the TTL, returning how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        if let Ok(mut last) = self.last_sweep.lock() {
            *last = Instant::now();
        }
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
                continue;
            };
            let expired = now
                .duration_since(modified)
                .map(|age| age >= self.ttl)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                // another sweep got there first
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => log::warn!("failed to remove {}: {e}", entry.path().display()),
            }
        }
        if removed > 0 {
            log::info!("swept {removed} expired scratch tiles from {}", self.dir.display());
        }
        Ok(removed)
    }

    fn sweep_if_due(&self) {
        let due = self
            .last_sweep
            .lock()
            .map(|last| last.elapsed() >= self.ttl)
            .unwrap_or(false);
        if due {
            if let Err(e) = self.sweep() {
                log::warn!("scratch sweep failed: {e}");
            }
        }
    }
}

impl TileStore for ScratchArea {
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
        self.sweep_if_due();
        write_atomic(&self.tile_path(coord), data)?;
        Ok(())
    }

    fn delete(&self, coord: &TileCoordinate) -> Result<bool> {
        match fs::remove_file(self.tile_path(coord)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Scratch names are opaque; temporary tiles expire instead.
    fn delete_limits(&self, _key: &TileSetKey, _limits: &TileMatrixLimits) -> Result<usize> {
        Ok(0)
    }
}

/// Background thread sweeping a scratch area at a fixed interval.
///
/// The thread stops when the janitor is dropped.
pub struct ScratchJanitor {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ScratchJanitor {
    pub fn spawn(scratch: Arc<ScratchArea>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("scratch-janitor".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = scratch.sweep() {
                            log::warn!("scratch sweep failed: {e}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::warn!("could not start scratch janitor, relying on lazy sweeps: {e}");
                None
            }
        };
        Self {
            stop: Some(stop),
            handle,
        }
    }
}

impl Drop for ScratchJanitor {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord() -> TileCoordinate {
        TileCoordinate::new("ds", Some("roads"), "WebMercatorQuad", 4, 2, 3).with_temporary(true)
    }

    #[test]
    fn test_opaque_name_under_tmp() {
        let scratch = ScratchArea::new(Path::new("/cache"));
        let path = scratch.tile_path(&coord());
        assert_eq!(path.parent().unwrap(), Path::new("/cache/__tmp__"));
        assert_eq!(path.file_name().unwrap().len(), 16);
        // stable for the same coordinate
        assert_eq!(path, scratch.tile_path(&coord()));
    }

    #[test]
    fn test_round_trip_and_fresh_files_survive_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchArea::new(dir.path());
        scratch.write(&coord(), b"temp").unwrap();
        assert_eq!(scratch.read(&coord()).unwrap(), Some(b"temp".to_vec()));
        assert_eq!(scratch.sweep().unwrap(), 0);
        assert!(scratch.exists(&coord()).unwrap());
    }

    #[test]
    fn test_expired_files_swept() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchArea::with_ttl(dir.path(), Duration::ZERO);
        scratch.write(&coord(), b"temp").unwrap();
        assert_eq!(scratch.sweep().unwrap(), 1);
        assert_eq!(scratch.read(&coord()).unwrap(), None);
    }

    #[test]
    fn test_lazy_sweep_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchArea::with_ttl(dir.path(), Duration::ZERO);
        let other = TileCoordinate::new("ds", None, "WebMercatorQuad", 1, 0, 0).with_temporary(true);
        scratch.write(&other, b"old").unwrap();
        // TTL zero: the next write sweeps the previous file first
        scratch.write(&coord(), b"new").unwrap();
        assert!(!scratch.exists(&other).unwrap());
        assert!(scratch.exists(&coord()).unwrap());
    }

    #[test]
    fn test_janitor_sweeps_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = Arc::new(ScratchArea::with_ttl(dir.path(), Duration::ZERO));
        write_atomic(&scratch.tile_path(&coord()), b"x").unwrap();

        let janitor = ScratchJanitor::spawn(scratch.clone(), Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(5);
        while scratch.exists(&coord()).unwrap() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(janitor);
        assert!(!scratch.exists(&coord()).unwrap());
    }

    #[test]
    fn test_missing_dir_sweeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchArea::new(&dir.path().join("nope"));
        assert_eq!(scratch.sweep().unwrap(), 0);
    }
}
