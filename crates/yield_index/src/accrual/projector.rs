//! One accrual step for one pool.

use crate::math::{period_growth_factor, MathError, Rate, Wad};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// A single period may at most multiply the index by this.
pub const MAX_GROWTH_MULTIPLE: u64 = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccrualError {
    #[error("index regression: {new} is below {old}")]
    IndexRegression { old: Wad, new: Wad },
    #[error("unrealistic growth: {old} -> {new} exceeds {MAX_GROWTH_MULTIPLE}x in one period")]
    UnrealisticGrowth { old: Wad, new: Wad },
    #[error(transparent)]
    Math(#[from] MathError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProjection {
    pub old_index: Wad,
    pub new_index: Wad,
    /// Per-period growth as a percentage.
    pub growth_rate_percent: Rate,
    pub yield_generated: Wad,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Project the next index from a blended annual rate.
///
/// `periods_per_year` is 365 for daily accrual.
pub fn project_index(
    current_index: Wad,
    total_staked: Wad,
    annual_percent: Rate,
    periods_per_year: u32,
    now: OffsetDateTime,
) -> Result<IndexProjection, AccrualError> {
    let factor = period_growth_factor(annual_percent, periods_per_year)?;
    apply_growth(current_index, total_staked, factor, now)
}

/// Apply a per-period growth factor (1.0001 for +0.01%) and check the index invariants.
pub fn apply_growth(
    current_index: Wad,
    total_staked: Wad,
    factor: Wad,
    now: OffsetDateTime,
) -> Result<IndexProjection, AccrualError> {
    let new_index = current_index.wad_mul(factor)?;
    if new_index < current_index {
        return Err(AccrualError::IndexRegression {
            old: current_index,
            new: new_index,
        });
    }
    let ceiling = current_index.wad_mul(Wad::from_int(MAX_GROWTH_MULTIPLE))?;
    if new_index > ceiling {
        return Err(AccrualError::UnrealisticGrowth {
            old: current_index,
            new: new_index,
        });
    }
    let period_rate = factor.saturating_sub(Wad::ONE);
    Ok(IndexProjection {
        old_index: current_index,
        new_index,
        growth_rate_percent: Rate::from_wad(period_rate)?.mul_int(100)?,
        yield_generated: total_staked.wad_mul(period_rate)?,
        timestamp: now,
    })
}
