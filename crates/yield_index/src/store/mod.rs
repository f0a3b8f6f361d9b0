//! Persistence ports and adapters.
//!
//! Every mutation goes through [`Ledger::transaction`]: the closure receives a
//! [`LedgerTx`] that holds the store's exclusive write lock until it returns.
//! `Ok` commits, `Err` rolls back. Reads made through the transaction
//! (`*_for_update`) therefore see the same state the writes are applied to.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use crate::math::{MathError, Rate, Wad};
use crate::model::{AccrualRecord, HolderId, HolderPosition, Pool, PoolId, StrategyAllocation};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("pool {0} not found")]
    PoolNotFound(PoolId),
    #[error("pool {0} already exists")]
    PoolExists(PoolId),
    #[error("no position for {holder} in pool {pool}")]
    PositionNotFound { holder: HolderId, pool: PoolId },
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
    #[error(transparent)]
    Math(#[from] MathError),
}

/// Pool records.
pub trait PoolStore {
    /// Read a pool while holding the write lock.
    fn get_pool_for_update(&mut self, id: &PoolId) -> Result<Option<Pool>, StoreError>;

    fn insert_pool(&mut self, pool: &Pool) -> Result<(), StoreError>;

    fn list_pools(&mut self) -> Result<Vec<Pool>, StoreError>;

    /// Active pools with a non-zero staked balance, ordered by id.
    fn list_active_pools_with_balance(&mut self) -> Result<Vec<Pool>, StoreError> {
        Ok(self
            .list_pools()?
            .into_iter()
            .filter(Pool::is_accruable)
            .collect())
    }

    /// Commit one accrual: set the index, add to cumulative yield, record the
    /// staked balance it ran against and the accrual time.
    fn update_pool_accrual(
        &mut self,
        id: &PoolId,
        new_index: Wad,
        added_yield: Wad,
        staked: Wad,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    fn update_pool_rolling_apy(
        &mut self,
        id: &PoolId,
        apy_7: Option<Rate>,
        apy_30: Option<Rate>,
    ) -> Result<(), StoreError>;

    fn update_pool_balances(
        &mut self,
        id: &PoolId,
        total_shares: Wad,
        total_staked: Wad,
        pending_deposit: Wad,
    ) -> Result<(), StoreError>;

    fn update_pool_strategy(
        &mut self,
        id: &PoolId,
        allocations: &[StrategyAllocation],
    ) -> Result<(), StoreError>;

    fn set_pool_active(&mut self, id: &PoolId, active: bool) -> Result<(), StoreError>;
}

/// Append-only accrual history.
pub trait HistoryStore {
    fn append_accrual_record(&mut self, record: &AccrualRecord) -> Result<(), StoreError>;

    /// Pool index as of the end of `period`: the `new_index` of the latest
    /// record at or before it, else the `old_index` of a record in the period
    /// right after. `None` when history does not reach back that far.
    fn get_index_at_or_before(
        &mut self,
        pool: &PoolId,
        period: i64,
    ) -> Result<Option<Wad>, StoreError>;

    /// Most recent first.
    fn list_accrual_records(
        &mut self,
        pool: &PoolId,
        limit: usize,
    ) -> Result<Vec<AccrualRecord>, StoreError>;
}

/// Holder positions.
pub trait PositionStore {
    fn get_position_for_update(
        &mut self,
        holder: &HolderId,
        pool: &PoolId,
    ) -> Result<Option<HolderPosition>, StoreError>;

    /// Insert or replace the position after a deposit.
    fn apply_deposit(&mut self, position: &HolderPosition) -> Result<(), StoreError>;

    /// Replace an existing position after a withdrawal.
    fn apply_withdrawal(&mut self, position: &HolderPosition) -> Result<(), StoreError>;
}

/// Store-wide lease that admits one accrual run at a time, across every
/// orchestrator and process sharing the store.
pub trait RunLockStore {
    /// Claim the lease for `owner` until `expires_at`. Fails (returns `false`)
    /// while a different owner holds a lease that has not expired at `now`.
    fn try_acquire_run_lease(
        &mut self,
        owner: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Drop the lease if `owner` still holds it.
    fn release_run_lease(&mut self, owner: &str) -> Result<(), StoreError>;
}

/// Everything reachable inside one transaction.
pub trait LedgerTx: PoolStore + HistoryStore + PositionStore + RunLockStore {}

impl<T: PoolStore + HistoryStore + PositionStore + RunLockStore> LedgerTx for T {}

/// A store that can run [`LedgerTx`] closures atomically.
///
/// The write lock is store-wide, which also gives every pool and position
/// its own exclusive lock.
pub trait Ledger: Send + Sync {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>;

    fn get_pool(&self, id: &PoolId) -> Result<Option<Pool>, StoreError> {
        self.transaction(|tx| tx.get_pool_for_update(id))
    }

    fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        self.transaction(|tx| tx.list_pools())
    }

    fn list_active_pools_with_balance(&self) -> Result<Vec<Pool>, StoreError> {
        self.transaction(|tx| tx.list_active_pools_with_balance())
    }

    fn get_position(
        &self,
        holder: &HolderId,
        pool: &PoolId,
    ) -> Result<Option<HolderPosition>, StoreError> {
        self.transaction(|tx| tx.get_position_for_update(holder, pool))
    }

    fn list_accrual_records(
        &self,
        pool: &PoolId,
        limit: usize,
    ) -> Result<Vec<AccrualRecord>, StoreError> {
        self.transaction(|tx| tx.list_accrual_records(pool, limit))
    }
}

impl<L: Ledger> Ledger for std::sync::Arc<L> {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        (**self).transaction(f)
    }
}

/// Shared lookup rule for [`HistoryStore::get_index_at_or_before`] over
/// records sorted by ascending period.
pub(crate) fn index_at_end_of(records: &[&AccrualRecord], period: i64) -> Option<Wad> {
    if let Some(r) = records.iter().rev().find(|r| r.period <= period) {
        return Some(r.new_index);
    }
    records
        .iter()
        .find(|r| r.period == period + 1)
        .map(|r| r.old_index)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Behaviour every adapter must share.

    use super::*;
    use crate::model::PoolKey;

    pub fn ts(unix: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(unix).unwrap()
    }

    pub fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    pub fn sample_pool() -> Pool {
        let mut p = Pool::new(
            PoolKey::new("client_a", "base", "usdc"),
            vec![StrategyAllocation::new("AAVE", Wad::from_int(100))],
            ts(1_700_000_000),
        );
        p.total_staked_balance = wad("1000");
        p.total_shares = wad("1000");
        p
    }

    pub fn record(pool: &PoolId, period: i64, old: &str, new: &str) -> AccrualRecord {
        AccrualRecord {
            pool_id: pool.clone(),
            period,
            old_index: wad(old),
            new_index: wad(new),
            yield_generated: wad("0.1"),
            growth_rate_percent: "0.01".parse().unwrap(),
            annual_percent: "3.7".parse().unwrap(),
            total_staked_at_run: wad("1000"),
            timestamp: ts(period * 86_400),
        }
    }

    pub fn pool_round_trip<L: Ledger>(ledger: &L) {
        let pool = sample_pool();
        ledger
            .transaction(|tx| tx.insert_pool(&pool))
            .unwrap();
        assert_eq!(ledger.get_pool(&pool.id).unwrap(), Some(pool.clone()));
        let dup = ledger.transaction(|tx| tx.insert_pool(&pool));
        assert!(matches!(dup, Err(StoreError::PoolExists(_))));

        ledger
            .transaction(|tx| {
                tx.update_pool_accrual(&pool.id, wad("1.01"), wad("10"), wad("1000"), ts(1_700_086_400))
            })
            .unwrap();
        ledger
            .transaction(|tx| tx.update_pool_rolling_apy(&pool.id, Some("3.5".parse().unwrap()), None))
            .unwrap();
        let got = ledger.get_pool(&pool.id).unwrap().unwrap();
        assert_eq!(got.current_index, wad("1.01"));
        assert_eq!(got.cumulative_yield, wad("10"));
        assert_eq!(got.last_accrual_at, Some(ts(1_700_086_400)));
        assert_eq!(got.apy_rolling_7, Some("3.5".parse().unwrap()));
        assert_eq!(got.apy_rolling_30, None);

        let missing = PoolId::from("nope");
        let err = ledger.transaction(|tx| tx.set_pool_active(&missing, false));
        assert!(matches!(err, Err(StoreError::PoolNotFound(_))));
    }

    pub fn active_listing<L: Ledger>(ledger: &L) {
        let funded = sample_pool();
        let mut empty = Pool::new(PoolKey::new("client_a", "base", "weth"), vec![], ts(0));
        empty.pending_deposit_balance = wad("5");
        let mut inactive = Pool::new(PoolKey::new("client_b", "base", "usdc"), vec![], ts(0));
        inactive.total_staked_balance = wad("5");
        inactive.is_active = false;
        ledger
            .transaction(|tx| {
                tx.insert_pool(&funded)?;
                tx.insert_pool(&empty)?;
                tx.insert_pool(&inactive)
            })
            .unwrap();
        let active = ledger.list_active_pools_with_balance().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, funded.id);
        assert_eq!(ledger.list_pools().unwrap().len(), 3);
    }

    pub fn failed_transaction_rolls_back<L: Ledger>(ledger: &L) {
        let pool = sample_pool();
        ledger.transaction(|tx| tx.insert_pool(&pool)).unwrap();
        let res: Result<(), StoreError> = ledger.transaction(|tx| {
            tx.update_pool_accrual(&pool.id, wad("1.5"), wad("500"), wad("1000"), ts(1))?;
            tx.append_accrual_record(&record(&pool.id, 1, "1", "1.5"))?;
            Err(StoreError::Poisoned("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(ledger.get_pool(&pool.id).unwrap().unwrap().current_index, Wad::ONE);
        assert!(ledger.list_accrual_records(&pool.id, 10).unwrap().is_empty());
    }

    pub fn history_lookup<L: Ledger>(ledger: &L) {
        let pool = sample_pool();
        ledger
            .transaction(|tx| {
                tx.insert_pool(&pool)?;
                tx.append_accrual_record(&record(&pool.id, 10, "1", "1.1"))?;
                tx.append_accrual_record(&record(&pool.id, 11, "1.1", "1.2"))?;
                tx.append_accrual_record(&record(&pool.id, 13, "1.2", "1.3"))
            })
            .unwrap();
        let at = |period| {
            ledger
                .transaction(|tx| tx.get_index_at_or_before(&pool.id, period))
                .unwrap()
        };
        assert_eq!(at(9), Some(wad("1")));
        assert_eq!(at(10), Some(wad("1.1")));
        assert_eq!(at(12), Some(wad("1.2")));
        assert_eq!(at(20), Some(wad("1.3")));
        assert_eq!(at(8), None);

        let recent = ledger.list_accrual_records(&pool.id, 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].period, 13);
        assert_eq!(recent[1].period, 11);
    }

    pub fn run_lease<L: Ledger>(ledger: &L) {
        let acquire = |owner: &str, now: i64, until: i64| {
            ledger
                .transaction(|tx| tx.try_acquire_run_lease(owner, ts(now), ts(until)))
                .unwrap()
        };
        let release = |owner: &str| ledger.transaction(|tx| tx.release_run_lease(owner)).unwrap();

        assert!(acquire("a", 100, 200));
        assert!(!acquire("b", 150, 250));
        // Holder may renew.
        assert!(acquire("a", 160, 260));
        // Expired leases are taken over.
        assert!(acquire("b", 260, 360));
        release("a");
        assert!(!acquire("c", 300, 400));
        release("b");
        assert!(acquire("c", 300, 400));
    }

    pub fn positions<L: Ledger>(ledger: &L) {
        let pool = sample_pool();
        let holder = HolderId::from("user_1");
        let mut pos = HolderPosition::open(holder.clone(), pool.id.clone(), wad("1.02"));
        pos.shares = wad("40");
        pos.total_deposited = wad("40");
        pos.last_deposit_at = Some(ts(1_700_000_100));
        ledger
            .transaction(|tx| {
                tx.insert_pool(&pool)?;
                tx.apply_deposit(&pos)
            })
            .unwrap();
        assert_eq!(ledger.get_position(&holder, &pool.id).unwrap(), Some(pos.clone()));

        pos.shares = Wad::ZERO;
        pos.total_withdrawn = wad("41");
        pos.is_active = false;
        ledger.transaction(|tx| tx.apply_withdrawal(&pos)).unwrap();
        assert_eq!(ledger.get_position(&holder, &pool.id).unwrap(), Some(pos));

        let stranger = HolderPosition::open(HolderId::from("user_2"), pool.id.clone(), Wad::ONE);
        let err = ledger.transaction(|tx| tx.apply_withdrawal(&stranger));
        assert!(matches!(err, Err(StoreError::PositionNotFound { .. })));
    }
}
