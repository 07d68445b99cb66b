//! File-backed nonce checkpoint store.
//!
//! Writes go to a temp file followed by an atomic rename, so a crash
//! mid-write leaves the previous checkpoint intact.

use std::fs;
use std::path::{Path, PathBuf};

use keel_nonce::{CheckpointStore, NonceError, NonceResult};
use tracing::{debug, info};

/// Durable single-value store for the nonce counter.
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    /// Create a store at the given path. Parent directories are created.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    fn temp_path(&self) -> PathBuf {
        let mut p = self.path.clone();
        p.set_extension("tmp");
        p
    }

    fn read_value(path: &Path) -> NonceResult<u64> {
        let text = fs::read_to_string(path)
            .map_err(|e| NonceError::Checkpoint(format!("read {}: {e}", path.display())))?;
        text.trim()
            .parse::<u64>()
            .map_err(|e| NonceError::Checkpoint(format!("parse {}: {e}", path.display())))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> NonceResult<Option<u64>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no nonce checkpoint, first run");
            return Ok(None);
        }
        let value = Self::read_value(&self.path)?;
        info!(value, "loaded nonce checkpoint");
        Ok(Some(value))
    }

    fn store(&self, value: u64) -> NonceResult<()> {
        let tmp = self.temp_path();
        fs::write(&tmp, value.to_string())
            .map_err(|e| NonceError::Checkpoint(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| NonceError::Checkpoint(format!("rename {}: {e}", tmp.display())))?;
        debug!(value, "nonce checkpoint persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("keel_checkpoint_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = temp_dir("missing");
        let store = FileCheckpointStore::new(dir.join("nonce.ckpt")).unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_store_then_load() {
        let dir = temp_dir("roundtrip");
        let store = FileCheckpointStore::new(dir.join("nonce.ckpt")).unwrap();
        store.store(1_700_000_000_123).unwrap();
        assert_eq!(store.load().unwrap(), Some(1_700_000_000_123));

        // Overwrite
        store.store(1_700_000_999_999).unwrap();
        assert_eq!(store.load().unwrap(), Some(1_700_000_999_999));
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = temp_dir("corrupt");
        let path = dir.join("nonce.ckpt");
        let store = FileCheckpointStore::new(&path).unwrap();
        fs::write(&path, "not-a-number").unwrap();
        assert!(store.load().is_err());
    }
}
