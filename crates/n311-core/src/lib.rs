//! Core domain model, fetch windows and partition math for the 311 ingest.

mod clean;

pub use clean::{clean, CleanBatch, CleanOutcome, SchemaError, REQUIRED_FIELDS};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "n311-core";

pub const STAGING_TABLE: &str = "stg_nyc_311";
pub const PARTITIONED_TABLE: &str = "stg_nyc_311_partitioned";

/// Width of the `VARCHAR` columns holding complaint text.
pub const MAX_TEXT_LEN: usize = 100;

/// How far back the first (backfill) run reaches.
pub const BACKFILL_DAYS: i64 = 365;

/// Postgres truncates identifiers beyond this length.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Loosely-typed record exactly as the open-data API returned it.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Canonical incident row; only exists when all six fields survived coercion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanRecord {
    pub unique_key: i64,
    pub created_date: NaiveDateTime,
    pub complaint_type: String,
    pub descriptor: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl CleanRecord {
    pub fn with_load_date(self, load_date: NaiveDate) -> PartitionedRow {
        PartitionedRow {
            record: self,
            load_date,
        }
    }
}

/// A clean record stamped with the date the partitioned write executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionedRow {
    #[serde(flatten)]
    pub record: CleanRecord,
    pub load_date: NaiveDate,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid partition granularity {0:?}; expected one of: day, week, month")]
    UnknownGranularity(String),
    #[error("refusing to use {0:?} as a partition identifier")]
    InvalidIdentifier(String),
    #[error("date {0} is outside the supported partition range")]
    DateOutOfRange(NaiveDate),
    #[error("start date must be YYYY-MM-DD, got {0:?}")]
    InvalidStartDate(String),
}

/// Half-open `[since, until)` creation-time window requested from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub since: NaiveDateTime,
    pub until: NaiveDateTime,
}

impl FetchWindow {
    /// `until` is always midnight after the run's calendar day. The first run
    /// reaches back [`BACKFILL_DAYS`]; every other run covers its own day.
    pub fn compute(run_timestamp: DateTime<Utc>, is_first_run: bool) -> Self {
        let run_date = run_timestamp.date_naive();
        let since = if is_first_run {
            run_date - Duration::days(BACKFILL_DAYS)
        } else {
            run_date
        };
        Self {
            since: midnight(since),
            until: midnight(run_date + Duration::days(1)),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.since <= ts && ts < self.until
    }

    pub fn days(&self) -> i64 {
        (self.until - self.since).num_days()
    }
}

pub fn compute_window(run_timestamp: DateTime<Utc>, is_first_run: bool) -> FetchWindow {
    FetchWindow::compute(run_timestamp, is_first_run)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionGranularity {
    Day,
    Week,
    Month,
}

impl PartitionGranularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    fn name_token(self, start: NaiveDate) -> String {
        match self {
            Self::Day | Self::Week => start.format("%Y%m%d").to_string(),
            Self::Month => start.format("%Y%m").to_string(),
        }
    }

    fn token_len(self) -> usize {
        match self {
            Self::Day | Self::Week => 8,
            Self::Month => 6,
        }
    }
}

impl fmt::Display for PartitionGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionGranularity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(ConfigError::UnknownGranularity(s.to_string())),
        }
    }
}

/// One child table of the partitioned store, covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub granularity: PartitionGranularity,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub name: String,
}

impl PartitionSpec {
    pub fn for_date(
        run_date: NaiveDate,
        granularity: PartitionGranularity,
    ) -> Result<Self, ConfigError> {
        let out_of_range = || ConfigError::DateOutOfRange(run_date);
        let (start, end) = match granularity {
            PartitionGranularity::Day => {
                let end = run_date.succ_opt().ok_or_else(out_of_range)?;
                (run_date, end)
            }
            PartitionGranularity::Week => {
                let offset = i64::from(run_date.weekday().num_days_from_monday());
                let start = run_date
                    .checked_sub_signed(Duration::days(offset))
                    .ok_or_else(out_of_range)?;
                let end = start
                    .checked_add_signed(Duration::days(7))
                    .ok_or_else(out_of_range)?;
                (start, end)
            }
            PartitionGranularity::Month => {
                let start = run_date.with_day(1).ok_or_else(out_of_range)?;
                let end = if start.month() == 12 {
                    NaiveDate::from_ymd_opt(start.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(start.year(), start.month() + 1, 1)
                }
                .ok_or_else(out_of_range)?;
                (start, end)
            }
        };

        let name = format!(
            "{PARTITIONED_PREFIX}{}_{}",
            granularity.as_str(),
            granularity.name_token(start)
        );
        validate_identifier(&name)?;

        Ok(Self {
            granularity,
            start,
            end,
            name,
        })
    }

    pub fn index_name(&self) -> String {
        format!("idx_{}_load_date", self.name)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }
}

const PARTITIONED_PREFIX: &str = "stg_nyc_311_";

/// Accept only identifiers this crate derives itself: partition names
/// `stg_nyc_311_<granularity>_<digits>` and their `idx_..._load_date` indexes.
/// DDL cannot bind identifiers, so anything else is rejected before it reaches SQL.
pub fn validate_identifier(ident: &str) -> Result<&str, ConfigError> {
    let reject = || ConfigError::InvalidIdentifier(ident.to_string());

    if ident.len() > MAX_IDENTIFIER_LEN
        || !ident
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    {
        return Err(reject());
    }

    let base = match ident.strip_prefix("idx_") {
        Some(rest) => rest.strip_suffix("_load_date").ok_or_else(reject)?,
        None => ident,
    };
    let rest = base.strip_prefix(PARTITIONED_PREFIX).ok_or_else(reject)?;
    let (granularity, token) = rest.split_once('_').ok_or_else(reject)?;
    let granularity: PartitionGranularity = granularity.parse().map_err(|_| reject())?;

    if token.len() != granularity.token_len() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(reject());
    }
    Ok(ident)
}

/// Result of one upsert-or-ignore attempt against the partitioned table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    /// Primary key already present; nothing written.
    Ignored,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub unique_key: i64,
    pub reason: String,
}

/// Per-batch tally for the partitioned write. Failures are observability, not fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteReport {
    pub total: usize,
    pub inserted: usize,
    pub ignored: usize,
    pub failed: usize,
    pub failures: Vec<RowFailure>,
}

impl WriteReport {
    pub fn record(&mut self, unique_key: i64, outcome: RowOutcome) {
        self.total += 1;
        match outcome {
            RowOutcome::Inserted => self.inserted += 1,
            RowOutcome::Ignored => self.ignored += 1,
            RowOutcome::Failed(reason) => {
                self.failed += 1;
                self.failures.push(RowFailure { unique_key, reason });
            }
        }
    }
}
