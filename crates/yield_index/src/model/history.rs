//! Append-only accrual audit trail.

use crate::math::{Rate, Wad};
use crate::model::pool::PoolId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One accrual applied to one pool. Never mutated once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualRecord {
    pub pool_id: PoolId,
    /// Accrual period number the record belongs to.
    pub period: i64,
    pub old_index: Wad,
    pub new_index: Wad,
    pub yield_generated: Wad,
    /// Daily growth as a percentage (0.0127 for 0.0127%).
    pub growth_rate_percent: Rate,
    /// Blended annual rate the growth was derived from.
    pub annual_percent: Rate,
    pub total_staked_at_run: Wad,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
