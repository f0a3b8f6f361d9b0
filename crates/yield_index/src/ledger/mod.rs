//! Pool configuration, deposits, activation and withdrawals.
//!
//! Each operation runs inside one [`Ledger::transaction`], so it holds the pool
//! and position locks for as long as it reads and writes them.

mod client_index;

pub use client_index::client_growth_index;

use crate::accrual::{
    current_value, recombine_entry_index, shares_for_value, withdrawal_impact, EntryValueError,
};
use crate::math::{MathError, Wad};
use crate::model::{
    validate_allocations, AllocationError, HolderId, HolderPosition, Pool, PoolId, PoolKey,
    StrategyAllocation,
};
use crate::store::{Ledger, LedgerTx, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("pool {0} not found")]
    PoolNotFound(PoolId),
    #[error("pool {0} already exists")]
    PoolExists(PoolId),
    #[error("pool {0} is inactive")]
    PoolInactive(PoolId),
    #[error("no position for {holder} in pool {pool}")]
    PositionNotFound { holder: HolderId, pool: PoolId },
    #[error("amount must be positive")]
    ZeroAmount,
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Wad, available: Wad },
    #[error("strategy: {0}")]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Math(#[from] MathError),
    #[error("store: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PoolNotFound(id) => LedgerError::PoolNotFound(id),
            StoreError::PoolExists(id) => LedgerError::PoolExists(id),
            StoreError::PositionNotFound { holder, pool } => {
                LedgerError::PositionNotFound { holder, pool }
            }
            other => LedgerError::Store(other),
        }
    }
}

impl From<EntryValueError> for LedgerError {
    fn from(e: EntryValueError) -> Self {
        match e {
            EntryValueError::InsufficientBalance {
                requested,
                available,
            } => LedgerError::InsufficientBalance {
                requested,
                available,
            },
            EntryValueError::ZeroEntryIndex => LedgerError::Math(MathError::DivisionByZero),
            EntryValueError::Math(m) => LedgerError::Math(m),
        }
    }
}

/// Everything needed to open a pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(flatten)]
    pub key: PoolKey,
    #[serde(default)]
    pub strategy_allocations: Vec<StrategyAllocation>,
}

/// A holder's position priced at the pool's committed index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderBalance {
    pub holder_id: HolderId,
    pub pool_id: PoolId,
    pub shares: Wad,
    pub entry_index: Wad,
    pub current_index: Wad,
    pub current_value: Wad,
    pub yield_earned: Wad,
    pub total_deposited: Wad,
    pub total_withdrawn: Wad,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub pool_id: PoolId,
    pub holder_id: HolderId,
    pub amount: Wad,
    pub shares_issued: Wad,
    pub index_at_deposit: Wad,
    pub entry_index: Wad,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalReceipt {
    pub pool_id: PoolId,
    pub holder_id: HolderId,
    pub amount: Wad,
    pub shares_burned: Wad,
    pub remaining_shares: Wad,
    /// Taken from capital not yet activated.
    pub from_pending: Wad,
    pub from_staked: Wad,
    pub pool_staked_after: Wad,
    pub percentage_of_staked: Wad,
}

fn locked_pool(tx: &mut dyn LedgerTx, id: &PoolId) -> Result<Pool, LedgerError> {
    tx.get_pool_for_update(id)?
        .ok_or_else(|| LedgerError::PoolNotFound(id.clone()))
}

pub fn create_pool<L: Ledger>(
    ledger: &L,
    spec: PoolSpec,
    now: OffsetDateTime,
) -> Result<Pool, LedgerError> {
    validate_allocations(&spec.strategy_allocations)?;
    let pool = Pool::new(spec.key, spec.strategy_allocations, now);
    ledger.transaction(|tx| tx.insert_pool(&pool).map_err(LedgerError::from))?;
    info!(pool = %pool.id, "pool created");
    Ok(pool)
}

pub fn set_strategy<L: Ledger>(
    ledger: &L,
    id: &PoolId,
    allocations: &[StrategyAllocation],
) -> Result<(), LedgerError> {
    validate_allocations(allocations)?;
    ledger.transaction(|tx| tx.update_pool_strategy(id, allocations).map_err(LedgerError::from))?;
    info!(pool = %id, protocols = allocations.len(), "strategy updated");
    Ok(())
}

/// Deactivated pools are kept but no longer accrue or accept deposits.
pub fn set_pool_active<L: Ledger>(ledger: &L, id: &PoolId, active: bool) -> Result<(), LedgerError> {
    ledger.transaction(|tx| tx.set_pool_active(id, active).map_err(LedgerError::from))?;
    info!(pool = %id, active, "pool activity changed");
    Ok(())
}

/// Record a deposit into the pool's pending balance and issue shares at the current index.
pub fn deposit<L: Ledger>(
    ledger: &L,
    pool_id: &PoolId,
    holder_id: &HolderId,
    amount: Wad,
    now: OffsetDateTime,
) -> Result<DepositReceipt, LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::ZeroAmount);
    }
    let receipt = ledger.transaction(|tx| {
        let pool = locked_pool(tx, pool_id)?;
        if !pool.is_active {
            return Err(LedgerError::PoolInactive(pool_id.clone()));
        }
        let index = pool.current_index;
        let shares = amount;
        let mut position = tx
            .get_position_for_update(holder_id, pool_id)?
            .unwrap_or_else(|| HolderPosition::open(holder_id.clone(), pool_id.clone(), index));
        position.weighted_entry_index =
            recombine_entry_index(position.shares, position.weighted_entry_index, shares, index)?;
        position.shares = position.shares.checked_add(shares)?;
        position.total_deposited = position.total_deposited.checked_add(amount)?;
        position.last_deposit_at = Some(now);
        position.is_active = true;

        tx.update_pool_balances(
            pool_id,
            pool.total_shares.checked_add(shares)?,
            pool.total_staked_balance,
            pool.pending_deposit_balance.checked_add(amount)?,
        )?;
        tx.apply_deposit(&position)?;
        Ok(DepositReceipt {
            pool_id: pool_id.clone(),
            holder_id: holder_id.clone(),
            amount,
            shares_issued: shares,
            index_at_deposit: index,
            entry_index: position.weighted_entry_index,
        })
    })?;
    info!(pool = %pool_id, holder = %holder_id, amount = %amount, "deposit recorded");
    Ok(receipt)
}

/// Move pending capital into the accruing balance. `None` moves all of it.
pub fn activate_pending<L: Ledger>(
    ledger: &L,
    pool_id: &PoolId,
    amount: Option<Wad>,
) -> Result<Wad, LedgerError> {
    let moved = ledger.transaction(|tx| {
        let pool = locked_pool(tx, pool_id)?;
        let pending = pool.pending_deposit_balance;
        let amount = amount.unwrap_or(pending);
        if amount > pending {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: pending,
            });
        }
        tx.update_pool_balances(
            pool_id,
            pool.total_shares,
            pool.total_staked_balance.checked_add(amount)?,
            pending.checked_sub(amount)?,
        )?;
        Ok(amount)
    })?;
    info!(pool = %pool_id, amount = %moved, "pending capital activated");
    Ok(moved)
}

/// Withdraw `amount` of value. Pending capital is drawn first, the rest from the staked balance.
pub fn withdraw<L: Ledger>(
    ledger: &L,
    pool_id: &PoolId,
    holder_id: &HolderId,
    amount: Wad,
    now: OffsetDateTime,
) -> Result<WithdrawalReceipt, LedgerError> {
    if amount.is_zero() {
        return Err(LedgerError::ZeroAmount);
    }
    let receipt = ledger.transaction(|tx| {
        let pool = locked_pool(tx, pool_id)?;
        let mut position = tx
            .get_position_for_update(holder_id, pool_id)?
            .ok_or_else(|| LedgerError::PositionNotFound {
                holder: holder_id.clone(),
                pool: pool_id.clone(),
            })?;
        let index = pool.current_index;
        let value = current_value(position.shares, position.weighted_entry_index, index)?;
        if amount > value {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available: value,
            });
        }
        let burned = if amount == value {
            position.shares
        } else {
            shares_for_value(amount, position.weighted_entry_index, index)?.min(position.shares)
        };

        let from_pending = amount.min(pool.pending_deposit_balance);
        let from_staked = amount.checked_sub(from_pending)?;
        let impact = withdrawal_impact(pool.total_staked_balance, from_staked, index)?;
        tx.update_pool_balances(
            pool_id,
            pool.total_shares.saturating_sub(burned),
            impact.new_total_staked,
            pool.pending_deposit_balance.checked_sub(from_pending)?,
        )?;

        position.shares = position.shares.checked_sub(burned)?;
        position.total_withdrawn = position.total_withdrawn.checked_add(amount)?;
        position.last_withdrawal_at = Some(now);
        position.is_active = !position.shares.is_zero();
        tx.apply_withdrawal(&position)?;
        Ok(WithdrawalReceipt {
            pool_id: pool_id.clone(),
            holder_id: holder_id.clone(),
            amount,
            shares_burned: burned,
            remaining_shares: position.shares,
            from_pending,
            from_staked,
            pool_staked_after: impact.new_total_staked,
            percentage_of_staked: impact.percentage_withdrawn,
        })
    })?;
    info!(
        pool = %pool_id,
        holder = %holder_id,
        amount = %amount,
        shares_burned = %receipt.shares_burned,
        "withdrawal recorded"
    );
    Ok(receipt)
}

pub fn holder_balance<L: Ledger>(
    ledger: &L,
    pool_id: &PoolId,
    holder_id: &HolderId,
) -> Result<HolderBalance, LedgerError> {
    ledger.transaction(|tx| {
        let pool = locked_pool(tx, pool_id)?;
        let position = tx
            .get_position_for_update(holder_id, pool_id)?
            .ok_or_else(|| LedgerError::PositionNotFound {
                holder: holder_id.clone(),
                pool: pool_id.clone(),
            })?;
        let value = current_value(
            position.shares,
            position.weighted_entry_index,
            pool.current_index,
        )?;
        Ok(HolderBalance {
            holder_id: position.holder_id,
            pool_id: position.pool_id,
            shares: position.shares,
            entry_index: position.weighted_entry_index,
            current_index: pool.current_index,
            current_value: value,
            yield_earned: value.saturating_sub(position.shares),
            total_deposited: position.total_deposited,
            total_withdrawn: position.total_withdrawn,
            is_active: position.is_active,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedger;

    fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    fn pool_spec() -> PoolSpec {
        PoolSpec {
            key: PoolKey::new("client_a", "base", "usdc"),
            strategy_allocations: vec![
                StrategyAllocation::new("AAVE", Wad::from_int(60)),
                StrategyAllocation::new("COMPOUND", Wad::from_int(40)),
            ],
        }
    }

    fn bump_index(ledger: &MemoryLedger, id: &PoolId, index: &str) {
        ledger
            .transaction(|tx| {
                let p = tx.get_pool_for_update(id)?.unwrap();
                tx.update_pool_accrual(id, wad(index), Wad::ZERO, p.total_staked_balance, ts(10))
            })
            .unwrap();
    }

    #[test]
    fn create_rejects_bad_strategy_and_duplicates() {
        let ledger = MemoryLedger::new();
        let mut bad = pool_spec();
        bad.strategy_allocations[0].allocation_percent = Wad::from_int(70);
        assert!(matches!(
            create_pool(&ledger, bad, ts(0)),
            Err(LedgerError::Allocation(AllocationError::SumExceeded(_)))
        ));
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        assert_eq!(pool.current_index, Wad::ONE);
        assert!(matches!(
            create_pool(&ledger, pool_spec(), ts(0)),
            Err(LedgerError::PoolExists(_))
        ));
    }

    #[test]
    fn deposit_activate_withdraw() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        let alice = HolderId::from("alice");

        let d = deposit(&ledger, &pool.id, &alice, wad("1000"), ts(1)).unwrap();
        assert_eq!(d.shares_issued, wad("1000"));
        assert_eq!(d.entry_index, Wad::ONE);
        let p = ledger.get_pool(&pool.id).unwrap().unwrap();
        assert_eq!(p.pending_deposit_balance, wad("1000"));
        assert_eq!(p.total_staked_balance, Wad::ZERO);

        assert_eq!(activate_pending(&ledger, &pool.id, None).unwrap(), wad("1000"));
        bump_index(&ledger, &pool.id, "1.05");

        let b = holder_balance(&ledger, &pool.id, &alice).unwrap();
        assert_eq!(b.current_value, wad("1050"));
        assert_eq!(b.yield_earned, wad("50"));

        let w = withdraw(&ledger, &pool.id, &alice, wad("105"), ts(2)).unwrap();
        assert_eq!(w.shares_burned, wad("100"));
        assert_eq!(w.from_staked, wad("105"));
        assert_eq!(w.pool_staked_after, wad("895"));
        let b = holder_balance(&ledger, &pool.id, &alice).unwrap();
        assert_eq!(b.shares, wad("900"));
        assert_eq!(b.current_value, wad("945"));
    }

    #[test]
    fn second_deposit_recombines_entry() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        let bob = HolderId::from("bob");
        deposit(&ledger, &pool.id, &bob, wad("100"), ts(1)).unwrap();
        activate_pending(&ledger, &pool.id, None).unwrap();
        bump_index(&ledger, &pool.id, "1.2");
        let d = deposit(&ledger, &pool.id, &bob, wad("300"), ts(2)).unwrap();
        assert_eq!(d.index_at_deposit, wad("1.2"));
        assert_eq!(d.entry_index, wad("1.15"));
    }

    #[test]
    fn withdrawal_guards() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        let carol = HolderId::from("carol");
        assert!(matches!(
            withdraw(&ledger, &pool.id, &carol, wad("1"), ts(1)),
            Err(LedgerError::PositionNotFound { .. })
        ));
        deposit(&ledger, &pool.id, &carol, wad("100"), ts(1)).unwrap();
        let err = withdraw(&ledger, &pool.id, &carol, wad("150"), ts(2)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance { requested, available }
                if requested == wad("150") && available == wad("100")
        ));
        assert!(matches!(
            withdraw(&ledger, &pool.id, &carol, Wad::ZERO, ts(2)),
            Err(LedgerError::ZeroAmount)
        ));
        assert!(matches!(
            activate_pending(&ledger, &pool.id, Some(wad("101"))),
            Err(LedgerError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn full_exit_from_pending_deactivates_position() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        let dave = HolderId::from("dave");
        deposit(&ledger, &pool.id, &dave, wad("40"), ts(1)).unwrap();
        let w = withdraw(&ledger, &pool.id, &dave, wad("40"), ts(2)).unwrap();
        assert_eq!(w.from_pending, wad("40"));
        assert_eq!(w.remaining_shares, Wad::ZERO);
        let pos = ledger.get_position(&dave, &pool.id).unwrap().unwrap();
        assert!(!pos.is_active);
        assert_eq!(pos.total_withdrawn, wad("40"));
        let p = ledger.get_pool(&pool.id).unwrap().unwrap();
        assert_eq!(p.total_shares, Wad::ZERO);
        assert_eq!(p.pending_deposit_balance, Wad::ZERO);
    }

    #[test]
    fn inactive_pool_refuses_deposits() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        set_pool_active(&ledger, &pool.id, false).unwrap();
        assert!(matches!(
            deposit(&ledger, &pool.id, &HolderId::from("erin"), wad("1"), ts(1)),
            Err(LedgerError::PoolInactive(_))
        ));
        assert!(matches!(
            set_pool_active(&ledger, &PoolId::from("missing"), true),
            Err(LedgerError::PoolNotFound(_))
        ));
    }

    #[test]
    fn strategy_replacement_is_validated() {
        let ledger = MemoryLedger::new();
        let pool = create_pool(&ledger, pool_spec(), ts(0)).unwrap();
        let next = [StrategyAllocation::new("MORPHO", Wad::from_int(100))];
        set_strategy(&ledger, &pool.id, &next).unwrap();
        assert_eq!(
            ledger.get_pool(&pool.id).unwrap().unwrap().strategy_allocations,
            next.to_vec()
        );
        let dup = [
            StrategyAllocation::new("MORPHO", Wad::from_int(10)),
            StrategyAllocation::new("morpho", Wad::from_int(10)),
        ];
        assert!(matches!(
            set_strategy(&ledger, &pool.id, &dup),
            Err(LedgerError::Allocation(AllocationError::Duplicate(_)))
        ));
    }
}
