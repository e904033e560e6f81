//! Energy and runtime summary rows.

use serde::{Deserialize, Serialize};

/// Granularity of a summary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryPeriod {
    /// Key format `YYYY-MM-DD HH` (UTC).
    Hourly,
    /// Key format `YYYY-MM-DD`.
    Daily,
    /// Key format `YYYY-MM`.
    Monthly,
}

impl SummaryPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    /// Database table for this period.
    pub fn table(self) -> &'static str {
        match self {
            Self::Hourly => "hourly_summaries",
            Self::Daily => "daily_summaries",
            Self::Monthly => "monthly_summaries",
        }
    }

    /// chrono format string producing the unique period key.
    pub fn key_format(self) -> &'static str {
        match self {
            Self::Hourly => "%Y-%m-%d %H",
            Self::Daily => "%Y-%m-%d",
            Self::Monthly => "%Y-%m",
        }
    }
}

/// One aggregated row. The same shape is used for all three periods; the
/// period key format differs (see [`SummaryPeriod::key_format`]).
///
/// Derivable from readings: re-running the aggregator over the same interval
/// must reproduce this row exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// `YYYY-MM-DD HH`, `YYYY-MM-DD`, or `YYYY-MM` depending on period.
    pub period_key: String,
    pub total_kwh: f64,
    /// Number of Idle→Normal transitions observed in the interval.
    pub pump_cycles: i64,
    pub runtime_minutes: f64,
    pub avg_current: f64,
    pub peak_current: f64,
    /// Readings with a fault status (Dry or RapidCycle).
    pub alert_count: i64,
    /// Share of readings that produced a usable status (not error/Unknown).
    pub uptime_pct: f64,
    pub synced: bool,
}
