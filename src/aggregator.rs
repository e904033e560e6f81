//! Energy and runtime aggregation.
//!
//! Rolls readings into hourly, daily, and monthly summary rows at UTC
//! boundaries. The computation is a pure function of the readings in the
//! interval — re-running it produces the identical row, so the worker can
//! upsert blindly. Energy is estimated as Σ amps × assumed_voltage × Δt,
//! with Δt the configured per-reading capture interval.
//!
//! The daily rollover also drives retention: expired synced rows are pruned
//! and the database compacted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::defaults::STORAGE_DEADLINE_MS;
use crate::config::ConfigStore;
use crate::storage::Db;
use crate::types::{PumpStatus, Reading, Summary, SummaryPeriod};

/// How often the worker checks for a crossed boundary.
const BOUNDARY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compute one summary row from the readings of a closed interval.
///
/// Deterministic: the same readings, interval, and voltage always produce
/// the same row.
pub fn summarize(
    period_key: &str,
    readings: &[Reading],
    interval_seconds: u64,
    assumed_voltage: f64,
) -> Summary {
    let interval_s = interval_seconds as f64;

    let mut total_kwh = 0.0;
    let mut pump_cycles = 0i64;
    let mut running_samples = 0i64;
    let mut current_sum = 0.0;
    let mut current_count = 0i64;
    let mut peak_current: f64 = 0.0;
    let mut alert_count = 0i64;
    let mut usable = 0i64;
    let mut prev_clean: Option<PumpStatus> = None;

    for reading in readings {
        if reading.error.is_none() && reading.status != PumpStatus::Unknown {
            usable += 1;
        }
        if reading.status.is_fault() {
            alert_count += 1;
        }
        if reading.status == PumpStatus::Normal {
            running_samples += 1;
        }
        if let Some(amps) = reading.current_amps {
            total_kwh += amps * assumed_voltage * interval_s / 3_600_000.0;
            current_sum += amps;
            current_count += 1;
            if amps > peak_current {
                peak_current = amps;
            }
        }
        if reading.status.is_clean() {
            if prev_clean == Some(PumpStatus::Idle) && reading.status == PumpStatus::Normal {
                pump_cycles += 1;
            }
            prev_clean = Some(reading.status);
        }
    }

    let avg_current = if current_count == 0 {
        0.0
    } else {
        current_sum / current_count as f64
    };
    let uptime_pct = if readings.is_empty() {
        0.0
    } else {
        usable as f64 / readings.len() as f64 * 100.0
    };

    Summary {
        period_key: period_key.to_string(),
        total_kwh,
        pump_cycles,
        runtime_minutes: running_samples as f64 * interval_s / 60.0,
        avg_current,
        peak_current,
        alert_count,
        uptime_pct,
        synced: false,
    }
}

/// Start of the hour containing `t`.
pub fn hour_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), 0, 0)
        .single()
        .unwrap_or(t)
}

/// Start of the day containing `t`.
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Start of the month containing `t`.
pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(t)
}

/// Periodic worker: at each hour/day/month rollover, aggregate the period
/// that just closed.
pub struct AggregatorWorker {
    config: Arc<ConfigStore>,
    db: Db,
    last_hour: DateTime<Utc>,
    last_day: DateTime<Utc>,
    last_month: DateTime<Utc>,
}

impl AggregatorWorker {
    pub fn new(config: Arc<ConfigStore>, db: Db) -> Self {
        let now = Utc::now();
        Self {
            config,
            db,
            last_hour: hour_start(now),
            last_day: day_start(now),
            last_month: month_start(now),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!(component = "aggregator", "aggregator started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(BOUNDARY_CHECK_INTERVAL) => {}
            }
            self.check_boundaries(Utc::now()).await;
        }
        info!(component = "aggregator", "aggregator stopped");
    }

    /// Aggregate every period that closed since the last check.
    pub async fn check_boundaries(&mut self, now: DateTime<Utc>) {
        let hour = hour_start(now);
        if hour > self.last_hour {
            let start = self.last_hour;
            self.aggregate(SummaryPeriod::Hourly, start, hour).await;
            self.last_hour = hour;
        }

        let day = day_start(now);
        if day > self.last_day {
            let start = self.last_day;
            self.aggregate(SummaryPeriod::Daily, start, day).await;
            self.last_day = day;
            self.run_retention().await;
        }

        let month = month_start(now);
        if month > self.last_month {
            let start = self.last_month;
            self.aggregate(SummaryPeriod::Monthly, start, month).await;
            self.last_month = month;
        }
    }

    /// Aggregate `[start, end)` into the row keyed by `start`.
    async fn aggregate(&self, period: SummaryPeriod, start: DateTime<Utc>, end: DateTime<Utc>) {
        let snapshot = self.config.current();
        let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);
        let key = start.format(period.key_format()).to_string();

        // readings_between is inclusive; stop just short of the boundary.
        let readings = match self
            .db
            .readings_between(start, end - ChronoDuration::milliseconds(1), deadline)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(component = "aggregator", period = period.as_str(), key = %key, error = %e, "could not read interval");
                return;
            }
        };

        let summary = summarize(
            &key,
            &readings,
            snapshot.monitoring.capture_interval_seconds,
            snapshot.monitoring.assumed_voltage,
        );

        match self.db.upsert_summary(period, &summary, deadline).await {
            Ok(()) => info!(
                component = "aggregator",
                period = period.as_str(),
                key = %key,
                readings = readings.len(),
                kwh = summary.total_kwh,
                "summary upserted"
            ),
            Err(e) => warn!(
                component = "aggregator",
                period = period.as_str(),
                key = %key,
                error = %e,
                "summary upsert failed"
            ),
        }
    }

    /// Prune readings past retention and compact the database.
    async fn run_retention(&self) {
        let snapshot = self.config.current();
        let cutoff =
            Utc::now() - ChronoDuration::days(i64::from(snapshot.monitoring.retention_days));
        let deadline = Duration::from_millis(STORAGE_DEADLINE_MS);

        match self.db.prune(cutoff, deadline).await {
            Ok(removed) if removed > 0 => {
                // Vacuum can take a while on flash storage; give it longer.
                if let Err(e) = self.db.vacuum(Duration::from_secs(120)).await {
                    warn!(component = "aggregator", error = %e, "vacuum failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(component = "aggregator", error = %e, "prune failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(status: PumpStatus, amps: Option<f64>) -> Reading {
        Reading {
            id: 0,
            timestamp_utc: Utc::now(),
            current_amps: amps,
            status,
            raw_text: String::new(),
            confidence: 0.9,
            image_ref: None,
            processing_ms: 0,
            synced: false,
            error: None,
        }
    }

    #[test]
    fn test_energy_estimate() {
        // 120 readings of 4.0 A at 30 s intervals = 1 hour at 4 A × 240 V
        // = 0.96 kWh.
        let readings: Vec<Reading> = (0..120)
            .map(|_| reading(PumpStatus::Normal, Some(4.0)))
            .collect();
        let summary = summarize("2026-08-01 10", &readings, 30, 240.0);
        assert!((summary.total_kwh - 0.96).abs() < 1e-9);
        assert!((summary.runtime_minutes - 60.0).abs() < 1e-9);
        assert!((summary.avg_current - 4.0).abs() < 1e-9);
        assert!((summary.peak_current - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_pump_cycles_counts_idle_to_normal() {
        let readings = vec![
            reading(PumpStatus::Idle, Some(0.0)),
            reading(PumpStatus::Normal, Some(4.0)),
            reading(PumpStatus::Normal, Some(4.1)),
            reading(PumpStatus::Idle, Some(0.0)),
            reading(PumpStatus::Normal, Some(4.0)),
            reading(PumpStatus::Unknown, None),
            reading(PumpStatus::Idle, Some(0.0)),
        ];
        let summary = summarize("2026-08-01", &readings, 30, 240.0);
        assert_eq!(summary.pump_cycles, 2);
    }

    #[test]
    fn test_alerts_and_uptime() {
        let mut readings = vec![
            reading(PumpStatus::Normal, Some(4.0)),
            reading(PumpStatus::Dry, None),
            reading(PumpStatus::Unknown, None),
        ];
        readings[2].error = Some("unparseable".to_string());
        let summary = summarize("2026-08", &readings, 30, 240.0);
        assert_eq!(summary.alert_count, 1);
        // 2 of 3 readings were usable.
        assert!((summary.uptime_pct - 66.666).abs() < 0.1);
    }

    #[test]
    fn test_idempotent_byte_equal() {
        let readings: Vec<Reading> = (0..50)
            .map(|i| {
                reading(
                    if i % 5 == 0 { PumpStatus::Idle } else { PumpStatus::Normal },
                    Some(3.0 + f64::from(i % 3)),
                )
            })
            .collect();
        let a = summarize("2026-08-01 10", &readings, 30, 240.0);
        let b = summarize("2026-08-01 10", &readings, 30, 240.0);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_empty_interval() {
        let summary = summarize("2026-08-01 03", &[], 30, 240.0);
        assert_eq!(summary.total_kwh, 0.0);
        assert_eq!(summary.pump_cycles, 0);
        assert_eq!(summary.uptime_pct, 0.0);
    }

    #[test]
    fn test_boundary_helpers() {
        let t = Utc.with_ymd_and_hms(2026, 8, 15, 13, 42, 7).unwrap();
        assert_eq!(hour_start(t).to_rfc3339(), "2026-08-15T13:00:00+00:00");
        assert_eq!(day_start(t).to_rfc3339(), "2026-08-15T00:00:00+00:00");
        assert_eq!(month_start(t).to_rfc3339(), "2026-08-01T00:00:00+00:00");
    }

    #[test]
    fn test_period_key_formats() {
        let t = Utc.with_ymd_and_hms(2026, 8, 15, 13, 0, 0).unwrap();
        assert_eq!(
            t.format(SummaryPeriod::Hourly.key_format()).to_string(),
            "2026-08-15 13"
        );
        assert_eq!(
            t.format(SummaryPeriod::Daily.key_format()).to_string(),
            "2026-08-15"
        );
        assert_eq!(
            t.format(SummaryPeriod::Monthly.key_format()).to_string(),
            "2026-08"
        );
    }

    #[tokio::test]
    async fn test_boundary_crossing_writes_summary() {
        let db = Db::open_in_memory().await.unwrap();
        let config = Arc::new(ConfigStore::new(crate::config::ConfigSnapshot::default()));
        let mut worker = AggregatorWorker::new(Arc::clone(&config), db.clone());

        // Pretend the last processed hour was an hour ago and insert a
        // reading inside that window.
        let now = Utc::now();
        let prev_hour = hour_start(now) - ChronoDuration::hours(1);
        worker.last_hour = prev_hour;

        let mut r = reading(PumpStatus::Normal, Some(4.0));
        r.timestamp_utc = prev_hour + ChronoDuration::minutes(10);
        db.insert_reading(&r, Duration::from_secs(5)).await.unwrap();

        worker.check_boundaries(now).await;

        let key = prev_hour
            .format(SummaryPeriod::Hourly.key_format())
            .to_string();
        let summary = db
            .get_summary(SummaryPeriod::Hourly, &key, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("summary row written");
        assert_eq!(summary.pump_cycles, 0);
        assert!(summary.total_kwh > 0.0);
    }
}
