//! Capital-flow accounting.
//!
//! Every full close lands here: the outcome is journaled to disk and
//! folded into the day's running stats. The governor reads the daily
//! realized loss from this tracker, and the pipeline's risk gate reads
//! the consecutive-loss streak to raise its confidence floor.

use chrono::{NaiveDate, Utc};
use keel_persistence::{CapitalFlowRecord, JournalWriter};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

use crate::error::PositionResult;
use crate::ledger::ClosedPosition;

/// Capital tracker settings.
#[derive(Debug, Clone)]
pub struct CapitalConfig {
    /// Journal records buffered before a disk flush.
    pub journal_buffer_size: usize,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            journal_buffer_size: 16,
        }
    }
}

/// One UTC day's realized results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DayStats {
    date: NaiveDate,
    realized_pnl: Decimal,
    wins: u32,
    losses: u32,
}

impl DayStats {
    fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            realized_pnl: Decimal::ZERO,
            wins: 0,
            losses: 0,
        }
    }
}

/// Realized P&L journal plus day-scoped aggregates.
pub struct CapitalTracker {
    journal: Mutex<JournalWriter>,
    day: Mutex<DayStats>,
    /// Spans days; reset by the first winning close.
    consecutive_losses: AtomicU32,
}

impl CapitalTracker {
    pub fn new(config: CapitalConfig, journal_dir: impl Into<PathBuf>) -> Self {
        Self {
            journal: Mutex::new(JournalWriter::new(journal_dir, config.journal_buffer_size)),
            day: Mutex::new(DayStats::fresh(Utc::now().date_naive())),
            consecutive_losses: AtomicU32::new(0),
        }
    }

    /// Journal a full close and fold it into the day's aggregates.
    pub fn record_close(&self, closed: &ClosedPosition) -> PositionResult<()> {
        let record = CapitalFlowRecord {
            timestamp_ms: closed.closed_at.timestamp_millis(),
            symbol: closed.symbol.clone(),
            side: closed.side.to_string(),
            size: closed.size.inner(),
            entry_price: closed.entry_price.inner(),
            exit_price: closed.exit_price.inner(),
            realized_pnl: closed.realized_pnl,
            fees: closed.fees,
            exit_reason: closed
                .exit_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unspecified".to_string()),
            hold_time_ms: closed.hold_time_ms(),
        };
        self.journal.lock().append(record)?;

        let mut day = self.day.lock();
        Self::roll_day(&mut day);
        day.realized_pnl += closed.realized_pnl;

        if closed.realized_pnl > Decimal::ZERO {
            day.wins += 1;
            self.consecutive_losses.store(0, Ordering::Relaxed);
        } else if closed.realized_pnl < Decimal::ZERO {
            day.losses += 1;
            self.consecutive_losses.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            symbol = %closed.symbol,
            pnl = %closed.realized_pnl,
            day_pnl = %day.realized_pnl,
            streak = self.consecutive_losses.load(Ordering::Relaxed),
            "capital flow recorded"
        );
        Ok(())
    }

    /// Net realized P&L for the current UTC day.
    pub fn daily_realized_pnl(&self) -> Decimal {
        let mut day = self.day.lock();
        Self::roll_day(&mut day);
        day.realized_pnl
    }

    /// Magnitude of the current day's realized loss; zero when the day is
    /// flat or profitable.
    pub fn daily_realized_loss(&self) -> Decimal {
        let pnl = self.daily_realized_pnl();
        if pnl < Decimal::ZERO {
            -pnl
        } else {
            Decimal::ZERO
        }
    }

    /// Losing closes since the last winning one.
    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::Relaxed)
    }

    /// (wins, losses) for the current UTC day.
    pub fn daily_counts(&self) -> (u32, u32) {
        let mut day = self.day.lock();
        Self::roll_day(&mut day);
        (day.wins, day.losses)
    }

    /// Flush buffered journal records to disk. Called on shutdown.
    pub fn flush(&self) -> PositionResult<()> {
        self.journal.lock().flush()?;
        Ok(())
    }

    // Aggregates reset at UTC midnight; the loss streak carries over.
    fn roll_day(day: &mut DayStats) {
        let today = Utc::now().date_naive();
        if day.date != today {
            info!(closed_day = %day.date, pnl = %day.realized_pnl, "daily stats rolled");
            *day = DayStats::fresh(today);
        }
    }
}
