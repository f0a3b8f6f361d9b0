//! Pooled capital for one (client, chain, token) triple.

use crate::math::{MathError, Rate, Wad};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

/// Allocations may not sum above this.
pub const MAX_ALLOCATION_PERCENT: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    pub client_id: String,
    pub chain: String,
    pub token: String,
}

impl PoolKey {
    pub fn new(
        client_id: impl Into<String>,
        chain: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            chain: chain.into(),
            token: token.into(),
        }
    }

    /// Stable id: `client:chain:token`, chain and token lowercased.
    pub fn pool_id(&self) -> PoolId {
        PoolId(format!(
            "{}:{}:{}",
            self.client_id.trim(),
            self.chain.trim().to_lowercase(),
            self.token.trim().to_lowercase()
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAllocation {
    #[serde(alias = "protocol")]
    pub protocol_id: String,
    /// Percentage of the pool routed to this protocol (60 for 60%).
    #[serde(alias = "allocation")]
    pub allocation_percent: Wad,
}

impl StrategyAllocation {
    pub fn new(protocol_id: impl Into<String>, allocation_percent: Wad) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            allocation_percent,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation has an empty protocol id")]
    EmptyProtocol,
    #[error("protocol {0} allocated more than once")]
    Duplicate(String),
    #[error("allocation for {protocol} is {percent}%, above 100%")]
    OutOfRange { protocol: String, percent: Wad },
    #[error("allocations sum to {0}%, above 100%")]
    SumExceeded(Wad),
}

/// Check that every allocation names a distinct protocol and that the total is at most 100%.
pub fn validate_allocations(allocations: &[StrategyAllocation]) -> Result<(), AllocationError> {
    let cap = Wad::from_int(MAX_ALLOCATION_PERCENT);
    let mut seen = HashSet::new();
    let mut total = Wad::ZERO;
    for a in allocations {
        let normalized = a.protocol_id.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(AllocationError::EmptyProtocol);
        }
        if !seen.insert(normalized) {
            return Err(AllocationError::Duplicate(a.protocol_id.clone()));
        }
        if a.allocation_percent > cap {
            return Err(AllocationError::OutOfRange {
                protocol: a.protocol_id.clone(),
                percent: a.allocation_percent,
            });
        }
        total = total
            .checked_add(a.allocation_percent)
            .map_err(|_| AllocationError::SumExceeded(total))?;
    }
    if total > cap {
        return Err(AllocationError::SumExceeded(total));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub key: PoolKey,
    /// Value per share, 1e18 fixed point. Starts at 1.0 and never decreases.
    pub current_index: Wad,
    pub total_shares: Wad,
    /// Capital currently accruing.
    pub total_staked_balance: Wad,
    /// Capital deposited but not yet activated into the accruing pool.
    pub pending_deposit_balance: Wad,
    pub cumulative_yield: Wad,
    pub apy_rolling_7: Option<Rate>,
    pub apy_rolling_30: Option<Rate>,
    pub strategy_allocations: Vec<StrategyAllocation>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_accrual_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Pool {
    pub fn new(key: PoolKey, strategy_allocations: Vec<StrategyAllocation>, now: OffsetDateTime) -> Self {
        Self {
            id: key.pool_id(),
            key,
            current_index: Wad::ONE,
            total_shares: Wad::ZERO,
            total_staked_balance: Wad::ZERO,
            pending_deposit_balance: Wad::ZERO,
            cumulative_yield: Wad::ZERO,
            apy_rolling_7: None,
            apy_rolling_30: None,
            strategy_allocations,
            is_active: true,
            last_accrual_at: None,
            created_at: now,
        }
    }

    /// Assets under management: staked plus pending.
    pub fn aum(&self) -> Result<Wad, MathError> {
        self.total_staked_balance
            .checked_add(self.pending_deposit_balance)
    }

    pub fn is_accruable(&self) -> bool {
        self.is_active && !self.total_staked_balance.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(p: &str, pct: u64) -> StrategyAllocation {
        StrategyAllocation::new(p, Wad::from_int(pct))
    }

    #[test]
    fn pool_id_is_stable() {
        let k = PoolKey::new("client_abc", "Base", "USDC");
        assert_eq!(k.pool_id().as_str(), "client_abc:base:usdc");
    }

    #[test]
    fn allocations_within_cap() {
        assert!(validate_allocations(&[alloc("AAVE", 60), alloc("COMPOUND", 40)]).is_ok());
        assert!(validate_allocations(&[alloc("AAVE", 50)]).is_ok());
        assert!(validate_allocations(&[]).is_ok());
    }

    #[test]
    fn allocations_over_cap() {
        assert_eq!(
            validate_allocations(&[alloc("AAVE", 70), alloc("COMPOUND", 40)]),
            Err(AllocationError::SumExceeded(Wad::from_int(110)))
        );
        assert!(matches!(
            validate_allocations(&[alloc("AAVE", 101)]),
            Err(AllocationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn duplicate_protocols_case_insensitive() {
        assert_eq!(
            validate_allocations(&[alloc("aave", 10), alloc("AAVE", 10)]),
            Err(AllocationError::Duplicate("AAVE".into()))
        );
        assert_eq!(
            validate_allocations(&[alloc("  ", 10)]),
            Err(AllocationError::EmptyProtocol)
        );
    }

    #[test]
    fn new_pool_starts_at_one() {
        let now = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let p = Pool::new(PoolKey::new("c", "base", "usdc"), vec![], now);
        assert_eq!(p.current_index, Wad::ONE);
        assert!(p.is_active);
        assert!(!p.is_accruable());
    }
}
