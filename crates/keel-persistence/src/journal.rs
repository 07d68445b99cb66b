//! Capital-flow journal: append-only JSON lines of realized P&L.
//!
//! JSON Lines keeps the file robust: each line is a complete record, so an
//! interrupted write corrupts at most one line. Files rotate daily.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;

/// One realized capital flow (a closed position's outcome).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalFlowRecord {
    pub timestamp_ms: i64,
    pub symbol: String,
    pub side: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    pub exit_reason: String,
    pub hold_time_ms: i64,
}

struct ActiveWriter {
    writer: BufWriter<File>,
    date: String,
    records_written: usize,
}

/// JSON Lines writer for capital-flow records.
///
/// Append mode; safe for interrupted writes.
pub struct JournalWriter {
    base_dir: PathBuf,
    buffer: Vec<CapitalFlowRecord>,
    max_buffer_size: usize,
    active_writer: Option<ActiveWriter>,
}

impl JournalWriter {
    /// Create a writer rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, max_buffer_size: usize) -> Self {
        let base_dir = base_dir.into();
        if let Err(e) = std::fs::create_dir_all(&base_dir) {
            warn!(?e, "failed to create journal directory: {}", base_dir.display());
        }

        Self {
            base_dir,
            buffer: Vec::with_capacity(max_buffer_size),
            max_buffer_size,
            active_writer: None,
        }
    }

    /// Buffer a record; flushes when the buffer is full.
    pub fn append(&mut self, record: CapitalFlowRecord) -> PersistenceResult<()> {
        self.buffer.push(record);
        if self.buffer.len() >= self.max_buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush buffered records to the current day's file.
    pub fn flush(&mut self) -> PersistenceResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let rotate = match &self.active_writer {
            Some(active) => active.date != today,
            None => true,
        };
        if rotate {
            self.close_active_writer();
            self.open_writer(&today)?;
        }

        let active = self
            .active_writer
            .as_mut()
            .expect("writer opened above");

        for record in self.buffer.drain(..) {
            let line = serde_json::to_string(&record)?;
            writeln!(active.writer, "{line}")?;
            active.records_written += 1;
        }
        active.writer.flush()?;

        debug!(records = active.records_written, "capital journal flushed");
        Ok(())
    }

    fn open_writer(&mut self, date: &str) -> PersistenceResult<()> {
        let filename = self.base_dir.join(format!("capital_{date}.jsonl"));
        info!(filename = %filename.display(), "opening capital journal (append mode)");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;

        self.active_writer = Some(ActiveWriter {
            writer: BufWriter::new(file),
            date: date.to_string(),
            records_written: 0,
        });
        Ok(())
    }

    fn close_active_writer(&mut self) {
        if let Some(mut active) = self.active_writer.take() {
            if let Err(e) = active.writer.flush() {
                warn!(?e, "failed to flush journal on close");
            }
            info!(
                date = %active.date,
                records = active.records_written,
                "closed capital journal"
            );
        }
    }
}

impl Drop for JournalWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(?e, "failed to flush journal on drop");
        }
        self.close_active_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(symbol: &str, pnl: Decimal) -> CapitalFlowRecord {
        CapitalFlowRecord {
            timestamp_ms: Utc::now().timestamp_millis(),
            symbol: symbol.to_string(),
            side: "buy".to_string(),
            size: dec!(1),
            entry_price: dec!(100),
            exit_price: dec!(100) + pnl,
            realized_pnl: pnl,
            fees: dec!(0.1),
            exit_reason: "profit_target".to_string(),
            hold_time_ms: 60_000,
        }
    }

    #[test]
    fn test_append_and_flush() {
        let dir = std::env::temp_dir().join(format!("keel_journal_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = JournalWriter::new(&dir, 100);
        writer.append(record("BTC/USD", dec!(5))).unwrap();
        writer.append(record("ETH/USD", dec!(-2))).unwrap();
        writer.flush().unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let content =
            std::fs::read_to_string(dir.join(format!("capital_{today}.jsonl"))).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: CapitalFlowRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.symbol, "BTC/USD");
        assert_eq!(first.realized_pnl, dec!(5));
    }

    #[test]
    fn test_buffer_auto_flush() {
        let dir = std::env::temp_dir().join(format!("keel_journal_auto_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let mut writer = JournalWriter::new(&dir, 2);
        writer.append(record("BTC/USD", dec!(1))).unwrap();
        // Second append reaches max_buffer_size and flushes
        writer.append(record("BTC/USD", dec!(2))).unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let content =
            std::fs::read_to_string(dir.join(format!("capital_{today}.jsonl"))).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
