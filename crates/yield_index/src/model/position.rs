//! A depositor's claim on one pool.

use crate::math::Wad;
use crate::model::pool::PoolId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(pub String);

impl HolderId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HolderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderPosition {
    pub holder_id: HolderId,
    pub pool_id: PoolId,
    pub shares: Wad,
    /// Cost-basis index of the held shares, recombined on each deposit.
    pub weighted_entry_index: Wad,
    pub total_deposited: Wad,
    pub total_withdrawn: Wad,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_deposit_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_withdrawal_at: Option<OffsetDateTime>,
    pub is_active: bool,
}

impl HolderPosition {
    /// Empty position, entered at `entry_index`.
    pub fn open(holder_id: HolderId, pool_id: PoolId, entry_index: Wad) -> Self {
        Self {
            holder_id,
            pool_id,
            shares: Wad::ZERO,
            weighted_entry_index: entry_index,
            total_deposited: Wad::ZERO,
            total_withdrawn: Wad::ZERO,
            last_deposit_at: None,
            last_withdrawal_at: None,
            is_active: true,
        }
    }
}
