//! In-process ledger. Each transaction works on a staged copy that replaces
//! the live state only when the closure succeeds.

use super::{
    index_at_end_of, HistoryStore, Ledger, LedgerTx, PoolStore, PositionStore, RunLockStore,
    StoreError,
};
use crate::math::{Rate, Wad};
use crate::model::{AccrualRecord, HolderId, HolderPosition, Pool, PoolId, StrategyAllocation};
use std::collections::BTreeMap;
use std::sync::Mutex;
use time::OffsetDateTime;

#[derive(Clone, Debug, Default)]
struct State {
    pools: BTreeMap<PoolId, Pool>,
    history: Vec<AccrualRecord>,
    positions: BTreeMap<(PoolId, HolderId), HolderPosition>,
    run_lease: Option<RunLease>,
}

#[derive(Clone, Debug)]
struct RunLease {
    owner: String,
    expires_at: OffsetDateTime,
}

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Ledger for MemoryLedger {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut live = self
            .state
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let mut staged = live.clone();
        let out = f(&mut staged)?;
        *live = staged;
        Ok(out)
    }
}

impl State {
    fn pool_mut(&mut self, id: &PoolId) -> Result<&mut Pool, StoreError> {
        self.pools
            .get_mut(id)
            .ok_or_else(|| StoreError::PoolNotFound(id.clone()))
    }
}

impl PoolStore for State {
    fn get_pool_for_update(&mut self, id: &PoolId) -> Result<Option<Pool>, StoreError> {
        Ok(self.pools.get(id).cloned())
    }

    fn insert_pool(&mut self, pool: &Pool) -> Result<(), StoreError> {
        if self.pools.contains_key(&pool.id) {
            return Err(StoreError::PoolExists(pool.id.clone()));
        }
        self.pools.insert(pool.id.clone(), pool.clone());
        Ok(())
    }

    fn list_pools(&mut self) -> Result<Vec<Pool>, StoreError> {
        Ok(self.pools.values().cloned().collect())
    }

    fn update_pool_accrual(
        &mut self,
        id: &PoolId,
        new_index: Wad,
        added_yield: Wad,
        staked: Wad,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let pool = self.pool_mut(id)?;
        pool.current_index = new_index;
        pool.cumulative_yield = pool.cumulative_yield.checked_add(added_yield)?;
        pool.total_staked_balance = staked;
        pool.last_accrual_at = Some(at);
        Ok(())
    }

    fn update_pool_rolling_apy(
        &mut self,
        id: &PoolId,
        apy_7: Option<Rate>,
        apy_30: Option<Rate>,
    ) -> Result<(), StoreError> {
        let pool = self.pool_mut(id)?;
        pool.apy_rolling_7 = apy_7;
        pool.apy_rolling_30 = apy_30;
        Ok(())
    }

    fn update_pool_balances(
        &mut self,
        id: &PoolId,
        total_shares: Wad,
        total_staked: Wad,
        pending_deposit: Wad,
    ) -> Result<(), StoreError> {
        let pool = self.pool_mut(id)?;
        pool.total_shares = total_shares;
        pool.total_staked_balance = total_staked;
        pool.pending_deposit_balance = pending_deposit;
        Ok(())
    }

    fn update_pool_strategy(
        &mut self,
        id: &PoolId,
        allocations: &[StrategyAllocation],
    ) -> Result<(), StoreError> {
        self.pool_mut(id)?.strategy_allocations = allocations.to_vec();
        Ok(())
    }

    fn set_pool_active(&mut self, id: &PoolId, active: bool) -> Result<(), StoreError> {
        self.pool_mut(id)?.is_active = active;
        Ok(())
    }
}

impl HistoryStore for State {
    fn append_accrual_record(&mut self, record: &AccrualRecord) -> Result<(), StoreError> {
        self.history.push(record.clone());
        Ok(())
    }

    fn get_index_at_or_before(
        &mut self,
        pool: &PoolId,
        period: i64,
    ) -> Result<Option<Wad>, StoreError> {
        let mut records: Vec<&AccrualRecord> =
            self.history.iter().filter(|r| &r.pool_id == pool).collect();
        records.sort_by_key(|r| r.period);
        Ok(index_at_end_of(&records, period))
    }

    fn list_accrual_records(
        &mut self,
        pool: &PoolId,
        limit: usize,
    ) -> Result<Vec<AccrualRecord>, StoreError> {
        Ok(self
            .history
            .iter()
            .rev()
            .filter(|r| &r.pool_id == pool)
            .take(limit)
            .cloned()
            .collect())
    }
}

impl PositionStore for State {
    fn get_position_for_update(
        &mut self,
        holder: &HolderId,
        pool: &PoolId,
    ) -> Result<Option<HolderPosition>, StoreError> {
        Ok(self
            .positions
            .get(&(pool.clone(), holder.clone()))
            .cloned())
    }

    fn apply_deposit(&mut self, position: &HolderPosition) -> Result<(), StoreError> {
        self.positions.insert(
            (position.pool_id.clone(), position.holder_id.clone()),
            position.clone(),
        );
        Ok(())
    }

    fn apply_withdrawal(&mut self, position: &HolderPosition) -> Result<(), StoreError> {
        let key = (position.pool_id.clone(), position.holder_id.clone());
        match self.positions.get_mut(&key) {
            Some(slot) => {
                *slot = position.clone();
                Ok(())
            }
            None => Err(StoreError::PositionNotFound {
                holder: position.holder_id.clone(),
                pool: position.pool_id.clone(),
            }),
        }
    }
}

impl RunLockStore for State {
    fn try_acquire_run_lease(
        &mut self,
        owner: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        if let Some(held) = &self.run_lease {
            if held.owner != owner && held.expires_at > now {
                return Ok(false);
            }
        }
        self.run_lease = Some(RunLease {
            owner: owner.to_string(),
            expires_at,
        });
        Ok(true)
    }

    fn release_run_lease(&mut self, owner: &str) -> Result<(), StoreError> {
        if self.run_lease.as_ref().is_some_and(|l| l.owner == owner) {
            self.run_lease = None;
        }
        Ok(())
    }
}
