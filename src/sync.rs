//! Sync worker: durable upload of readings, relay actions, and summaries.
//!
//! Every sync interval, unsynced rows are fetched in batches, uploaded, and
//! marked synced on acknowledgment. Network failures back off exponentially
//! (1 s → 60 s, full jitter) with a daily ceiling on attempts; rows the hub
//! permanently rejects are quarantined so one bad row cannot wedge the
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::{
    STORAGE_DEADLINE_MS, SYNC_BACKOFF_MAX_SECONDS, SYNC_BACKOFF_MIN_SECONDS, SYNC_BATCH_SIZE,
    SYNC_DAILY_ATTEMPT_CEILING,
};
use crate::config::ConfigStore;
use crate::error::Categorized;
use crate::hub::{HubClient, HubError};
use crate::storage::{Db, StorageError, SyncKind};

pub struct SyncWorker {
    pub config: Arc<ConfigStore>,
    pub db: Db,
    pub hub: HubClient,
}

#[derive(Debug, Default)]
struct BackoffState {
    /// Back-off ceiling, `None` when the link is healthy. Doubles per
    /// failure; the actual sleep is a jittered fraction of this.
    current: Option<Duration>,
    /// Jittered sleep to use before the next pass, when backing off.
    next_sleep: Option<Duration>,
    attempts_today: u32,
    day_ordinal: i32,
    quarantined_total: u64,
}

impl BackoffState {
    /// Next sleep after a failure: exponential growth with full jitter.
    fn on_failure(&mut self) -> Duration {
        let base = match self.current {
            None => Duration::from_secs(SYNC_BACKOFF_MIN_SECONDS),
            Some(prev) => (prev * 2).min(Duration::from_secs(SYNC_BACKOFF_MAX_SECONDS)),
        };
        self.current = Some(base);
        // Full jitter: sleep a uniform fraction of the ceiling.
        let jittered_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
        let sleep = Duration::from_millis(jittered_ms.max(100));
        self.next_sleep = Some(sleep);
        sleep
    }

    fn on_success(&mut self) {
        self.current = None;
        self.next_sleep = None;
    }

    /// Count an attempt against the daily ceiling; resets at UTC midnight.
    fn admit_attempt(&mut self) -> bool {
        let today = Utc::now().ordinal0() as i32 + Utc::now().year() * 366;
        if today != self.day_ordinal {
            self.day_ordinal = today;
            self.attempts_today = 0;
        }
        if self.attempts_today >= SYNC_DAILY_ATTEMPT_CEILING {
            return false;
        }
        self.attempts_today += 1;
        true
    }
}

impl SyncWorker {
    pub async fn run(self, cancel: CancellationToken) {
        info!(component = "sync", "sync worker started");
        let mut backoff = BackoffState::default();

        loop {
            let sleep_for = backoff.next_sleep.take().unwrap_or_else(|| {
                Duration::from_secs(self.config.current().monitoring.sync_interval_seconds)
            });

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(sleep_for) => {}
            }

            match self.sync_all(&mut backoff).await {
                Ok(uploaded) => {
                    backoff.on_success();
                    if uploaded > 0 {
                        info!(component = "sync", rows = uploaded, "sync pass complete");
                    }
                }
                Err(e) => {
                    let delay = backoff.on_failure();
                    warn!(
                        component = "sync",
                        err_kind = %e.kind(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "sync pass failed"
                    );
                }
            }
        }

        info!(
            component = "sync",
            quarantined = backoff.quarantined_total,
            "sync worker stopped"
        );
    }

    /// Upload every family until its backlog is drained.
    /// Returns rows uploaded; network errors abort the pass.
    async fn sync_all(&self, backoff: &mut BackoffState) -> Result<u64, HubError> {
        let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);
        let mut uploaded = 0u64;

        for kind in SyncKind::all() {
            loop {
                let rows = match self.db.list_unsynced(kind, SYNC_BATCH_SIZE, deadline).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(component = "sync", kind = kind.as_str(), error = %e, "listing unsynced failed");
                        break;
                    }
                };
                if rows.is_empty() {
                    break;
                }
                if !backoff.admit_attempt() {
                    warn!(component = "sync", "daily attempt ceiling reached, deferring");
                    return Ok(uploaded);
                }

                let payloads: Vec<serde_json::Value> =
                    rows.iter().map(|r| r.payload.clone()).collect();

                match self.hub.upload_batch(kind.as_str(), &payloads).await {
                    Ok(()) => {
                        let keys: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
                        if let Err(e) = self.db.mark_synced(kind, &keys, deadline).await {
                            warn!(component = "sync", error = %e, "mark_synced failed");
                            break;
                        }
                        uploaded += rows.len() as u64;
                        debug!(
                            component = "sync",
                            kind = kind.as_str(),
                            rows = rows.len(),
                            "batch acknowledged"
                        );
                        if rows.len() < SYNC_BATCH_SIZE as usize {
                            break;
                        }
                    }
                    Err(HubError::Validation(errors)) => {
                        // Schema rejections are permanent: quarantine the
                        // offending rows, mark the rest synced.
                        self.quarantine_batch(kind, &rows, &errors, backoff).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(uploaded)
    }

    async fn quarantine_batch(
        &self,
        kind: SyncKind,
        rows: &[crate::storage::UnsyncedRow],
        errors: &[crate::hub::RowError],
        backoff: &mut BackoffState,
    ) {
        let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);
        let bad_indices: std::collections::HashSet<usize> =
            errors.iter().map(|e| e.index).collect();

        for error in errors {
            let Some(row) = rows.get(error.index) else {
                continue;
            };
            warn!(
                component = "sync",
                kind = kind.as_str(),
                key = %row.key,
                reason = %error.reason,
                "row quarantined"
            );
            if let Err(e) = self
                .db
                .quarantine(kind, &row.key, &error.reason, deadline)
                .await
            {
                warn!(component = "sync", error = %e, "quarantine write failed");
            } else {
                backoff.quarantined_total += 1;
            }
        }

        // When the hub gave no row detail, quarantine the whole batch
        // rather than retrying it forever.
        if bad_indices.is_empty() {
            for row in rows {
                if let Err(e) = self
                    .db
                    .quarantine(kind, &row.key, "batch rejected", deadline)
                    .await
                {
                    warn!(component = "sync", error = %e, "quarantine write failed");
                } else {
                    backoff.quarantined_total += 1;
                }
            }
            return;
        }

        // Rows the hub did not complain about are considered accepted.
        let good_keys: Vec<_> = rows
            .iter()
            .enumerate()
            .filter(|(i, _)| !bad_indices.contains(i))
            .map(|(_, r)| r.key.clone())
            .collect();
        if let Err(e) = self.db.mark_synced(kind, &good_keys, deadline).await {
            warn!(component = "sync", error = %e, "mark_synced after quarantine failed");
        }
    }
}

/// Convenience used by tests and `--diagnose`: number of unsynced rows
/// across all families.
pub async fn backlog_size(db: &Db) -> Result<u64, StorageError> {
    let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);
    let mut total = 0u64;
    for kind in SyncKind::all() {
        total += db.list_unsynced(kind, SYNC_BATCH_SIZE, deadline).await?.len() as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut state = BackoffState::default();
        let mut ceilings = Vec::new();
        for _ in 0..8 {
            state.on_failure();
            // `current` holds the jittered value; reconstruct the ceiling
            // from growth behavior by tracking it separately.
            ceilings.push(state.current.unwrap());
        }
        // All sleeps are bounded by the max back-off.
        assert!(ceilings
            .iter()
            .all(|d| *d <= Duration::from_secs(SYNC_BACKOFF_MAX_SECONDS)));
    }

    #[test]
    fn test_backoff_reset_on_success() {
        let mut state = BackoffState::default();
        state.on_failure();
        assert!(state.current.is_some());
        state.on_success();
        assert!(state.current.is_none());
    }

    #[test]
    fn test_daily_ceiling() {
        let mut state = BackoffState::default();
        for _ in 0..SYNC_DAILY_ATTEMPT_CEILING {
            assert!(state.admit_attempt());
        }
        assert!(!state.admit_attempt());
    }
}
