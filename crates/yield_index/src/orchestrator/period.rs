//! Accrual periods: fixed-length buckets of unix time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const DEFAULT_PERIOD_SECS: u64 = 86_400;
pub const SECONDS_PER_YEAR: u64 = 365 * 86_400;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeriodError {
    #[error("period length {0}s must be positive and divide a 365-day year")]
    InvalidLength(u64),
    #[error("invalid time: {0}")]
    InvalidTime(String),
}

/// Period numbering: `floor(unix_ts / period_secs)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct AccrualCalendar {
    period_secs: u64,
}

impl AccrualCalendar {
    pub fn new(period_secs: u64) -> Result<Self, PeriodError> {
        if period_secs == 0
            || period_secs > SECONDS_PER_YEAR
            || SECONDS_PER_YEAR % period_secs != 0
        {
            return Err(PeriodError::InvalidLength(period_secs));
        }
        Ok(Self { period_secs })
    }

    pub fn daily() -> Self {
        Self {
            period_secs: DEFAULT_PERIOD_SECS,
        }
    }

    pub fn period_secs(self) -> u64 {
        self.period_secs
    }

    fn secs_i64(self) -> i64 {
        // bounded by SECONDS_PER_YEAR in `new`
        self.period_secs as i64
    }

    pub fn periods_per_year(self) -> u32 {
        (SECONDS_PER_YEAR / self.period_secs) as u32
    }

    pub fn period_of(self, at: OffsetDateTime) -> i64 {
        at.unix_timestamp().div_euclid(self.secs_i64())
    }

    pub fn period_start(self, period: i64) -> Result<OffsetDateTime, PeriodError> {
        let ts = period
            .checked_mul(self.secs_i64())
            .ok_or_else(|| PeriodError::InvalidTime(format!("period {period}")))?;
        OffsetDateTime::from_unix_timestamp(ts).map_err(|e| PeriodError::InvalidTime(e.to_string()))
    }

    /// Time from `now` until the next period begins.
    pub fn until_next_period(self, now: OffsetDateTime) -> Duration {
        let into = now.unix_timestamp().rem_euclid(self.secs_i64());
        let secs = u64::try_from(self.secs_i64() - into).unwrap_or(self.period_secs);
        Duration::from_secs(secs)
    }
}

impl Default for AccrualCalendar {
    fn default() -> Self {
        Self::daily()
    }
}

impl TryFrom<u64> for AccrualCalendar {
    type Error = PeriodError;

    fn try_from(secs: u64) -> Result<Self, Self::Error> {
        Self::new(secs)
    }
}

impl From<AccrualCalendar> for u64 {
    fn from(c: AccrualCalendar) -> u64 {
        c.period_secs
    }
}

/// Parse RFC3339 timestamp.
pub fn parse_time_rfc3339(s: &str) -> Result<OffsetDateTime, PeriodError> {
    OffsetDateTime::parse(s.trim(), &Rfc3339).map_err(|e| PeriodError::InvalidTime(e.to_string()))
}

/// Accepts unix seconds or RFC3339.
pub fn parse_instant(s: &str) -> Result<OffsetDateTime, PeriodError> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return OffsetDateTime::from_unix_timestamp(secs)
            .map_err(|e| PeriodError::InvalidTime(e.to_string()));
    }
    parse_time_rfc3339(s)
}
