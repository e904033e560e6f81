//! Persistence façade: SQLite-backed store for readings, relay actions,
//! and summaries.
//!
//! One writer connection serializes all mutations; reads go through a small
//! concurrent pool. Every operation takes a deadline and maps an overrun to
//! [`StorageError::Timeout`]. Schema migrations run on open and are
//! idempotent.

mod db;
mod ring;

pub use db::Db;
pub use ring::ReadingRing;

use std::time::Duration;

use crate::error::{Categorized, ErrorKind};
use crate::types::SummaryPeriod;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Categorized for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Invariant(_) => ErrorKind::Internal,
            Self::Db(_) => ErrorKind::Storage,
        }
    }
}

/// Row family addressed by the generic unsynced/mark-synced operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Readings,
    RelayActions,
    Summaries(SummaryPeriod),
}

impl SyncKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Readings => "readings",
            Self::RelayActions => "relayActions",
            Self::Summaries(SummaryPeriod::Hourly) => "hourlySummaries",
            Self::Summaries(SummaryPeriod::Daily) => "dailySummaries",
            Self::Summaries(SummaryPeriod::Monthly) => "monthlySummaries",
        }
    }

    /// All families the sync worker walks, in upload order.
    pub fn all() -> [Self; 5] {
        [
            Self::Readings,
            Self::RelayActions,
            Self::Summaries(SummaryPeriod::Hourly),
            Self::Summaries(SummaryPeriod::Daily),
            Self::Summaries(SummaryPeriod::Monthly),
        ]
    }
}

/// Key of a row within its family: numeric id for readings and relay
/// actions, period key for summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowKey {
    Id(i64),
    Period(String),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Period(key) => f.write_str(key),
        }
    }
}

/// One unsynced row ready for upload: its key plus the JSON payload the hub
/// expects.
#[derive(Debug, Clone)]
pub struct UnsyncedRow {
    pub key: RowKey,
    pub payload: serde_json::Value,
}
