//! Position snapshot store for crash recovery.
//!
//! The ledger serializes its open positions to a JSON document on a
//! mutation cadence and on shutdown; on startup the document is loaded and
//! open positions resume monitoring.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use keel_core::{OrderSide, Price, Size};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;

/// One persisted position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub symbol: String,
    pub side: OrderSide,
    pub size: Size,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub profit_target: Price,
    pub stop_loss: Price,
    /// Lifecycle status as a string ("OPEN", "EXIT_TRIGGERED", ...).
    pub status: String,
}

/// The full snapshot document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// When the snapshot was written.
    pub written_at: Option<DateTime<Utc>>,
    /// Open (non-closed) positions.
    pub positions: Vec<SnapshotEntry>,
}

/// File-backed snapshot store (temp file + atomic rename).
pub struct PositionSnapshotStore {
    path: PathBuf,
}

impl PositionSnapshotStore {
    /// Create a store at the given path. Parent directories are created.
    pub fn new(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Load the snapshot, or an empty one if the file does not exist.
    ///
    /// A corrupt file is logged and treated as empty: losing the snapshot
    /// is recoverable via the venue poll, a crash loop is not.
    pub fn load(&self) -> PositionSnapshot {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no position snapshot, starting empty");
            return PositionSnapshot::default();
        }

        match fs::read_to_string(&self.path)
            .map_err(crate::PersistenceError::from)
            .and_then(|text| Ok(serde_json::from_str::<PositionSnapshot>(&text)?))
        {
            Ok(snapshot) => {
                info!(
                    positions = snapshot.positions.len(),
                    "loaded position snapshot"
                );
                snapshot
            }
            Err(e) => {
                warn!(?e, "corrupt position snapshot, starting empty");
                PositionSnapshot::default()
            }
        }
    }

    /// Persist the snapshot atomically.
    pub fn save(&self, mut snapshot: PositionSnapshot) -> PersistenceResult<()> {
        snapshot.written_at = Some(Utc::now());

        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");

        let text = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            positions = snapshot.positions.len(),
            "position snapshot persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_store(name: &str) -> PositionSnapshotStore {
        let dir = std::env::temp_dir().join(format!("keel_snapshot_{name}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        PositionSnapshotStore::new(dir.join("positions.json")).unwrap()
    }

    fn entry(symbol: &str) -> SnapshotEntry {
        SnapshotEntry {
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            size: Size::new(dec!(0.5)),
            entry_price: Price::new(dec!(100)),
            entry_time: Utc::now(),
            profit_target: Price::new(dec!(105)),
            stop_loss: Price::new(dec!(97)),
            status: "OPEN".to_string(),
        }
    }

    #[test]
    fn test_load_missing_is_empty() {
        let store = temp_store("missing");
        assert!(store.load().positions.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let store = temp_store("roundtrip");
        let snapshot = PositionSnapshot {
            written_at: None,
            positions: vec![entry("BTC/USD"), entry("ETH/USD")],
        };
        store.save(snapshot).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.positions.len(), 2);
        assert_eq!(loaded.positions[0].symbol, "BTC/USD");
        assert!(loaded.written_at.is_some());
    }

    #[test]
    fn test_corrupt_snapshot_starts_empty() {
        let store = temp_store("corrupt");
        fs::write(
            std::env::temp_dir()
                .join(format!("keel_snapshot_corrupt_{}", std::process::id()))
                .join("positions.json"),
            "{ broken",
        )
        .unwrap();
        assert!(store.load().positions.is_empty());
    }
}
