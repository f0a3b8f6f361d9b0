//! SQLite ledger. Fixed-point values are stored as decimal TEXT, timestamps as
//! unix seconds. Transactions use `BEGIN IMMEDIATE`, so the write lock is held
//! from the first read of a `*_for_update` call until commit.

use super::{
    HistoryStore, Ledger, LedgerTx, PoolStore, PositionStore, RunLockStore, StoreError,
};
use crate::math::{MathError, Rate, Wad};
use crate::model::{
    AccrualRecord, HolderId, HolderPosition, Pool, PoolId, PoolKey, StrategyAllocation,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pools (
    id TEXT PRIMARY KEY,
    client_id TEXT NOT NULL,
    chain TEXT NOT NULL,
    token TEXT NOT NULL,
    current_index TEXT NOT NULL,
    total_shares TEXT NOT NULL,
    total_staked TEXT NOT NULL,
    pending_deposit TEXT NOT NULL,
    cumulative_yield TEXT NOT NULL,
    apy_rolling_7 TEXT,
    apy_rolling_30 TEXT,
    strategy TEXT NOT NULL,
    is_active INTEGER NOT NULL,
    last_accrual_at INTEGER,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pools_client ON pools(client_id);

CREATE TABLE IF NOT EXISTS accrual_history (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    pool_id TEXT NOT NULL REFERENCES pools(id),
    period INTEGER NOT NULL,
    old_index TEXT NOT NULL,
    new_index TEXT NOT NULL,
    yield_generated TEXT NOT NULL,
    growth_rate_percent TEXT NOT NULL,
    annual_percent TEXT NOT NULL,
    total_staked_at_run TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_pool_period ON accrual_history(pool_id, period);
CREATE TRIGGER IF NOT EXISTS accrual_history_no_update
    BEFORE UPDATE ON accrual_history
    BEGIN SELECT RAISE(ABORT, 'accrual history is append-only'); END;
CREATE TRIGGER IF NOT EXISTS accrual_history_no_delete
    BEFORE DELETE ON accrual_history
    BEGIN SELECT RAISE(ABORT, 'accrual history is append-only'); END;

CREATE TABLE IF NOT EXISTS positions (
    holder_id TEXT NOT NULL,
    pool_id TEXT NOT NULL REFERENCES pools(id),
    shares TEXT NOT NULL,
    weighted_entry_index TEXT NOT NULL,
    total_deposited TEXT NOT NULL,
    total_withdrawn TEXT NOT NULL,
    last_deposit_at INTEGER,
    last_withdrawal_at INTEGER,
    is_active INTEGER NOT NULL,
    PRIMARY KEY (holder_id, pool_id)
);

CREATE TABLE IF NOT EXISTS run_lease (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const POOL_COLUMNS: &str = "id, client_id, chain, token, current_index, total_shares, \
     total_staked, pending_deposit, cumulative_yield, apy_rolling_7, apy_rolling_30, \
     strategy, is_active, last_accrual_at, created_at";

const HISTORY_COLUMNS: &str = "pool_id, period, old_index, new_index, yield_generated, \
     growth_rate_percent, annual_percent, total_staked_at_run, timestamp";

const POSITION_COLUMNS: &str = "holder_id, pool_id, shares, weighted_entry_index, \
     total_deposited, total_withdrawn, last_deposit_at, last_withdrawal_at, is_active";

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open or create the ledger at `path`. Creates parent dirs if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Ledger for SqliteLedger {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn LedgerTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StoreError::from)?;
        let out = f(&mut SqliteTx { conn: &tx })?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

fn conversion_error<E>(idx: usize, ty: Type, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(e))
}

fn decimal<T: FromStr<Err = MathError>>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = r.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, Type::Text, e))
}

fn optional_decimal<T: FromStr<Err = MathError>>(
    r: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let text: Option<String> = r.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, Type::Text, e)))
        .transpose()
}

fn timestamp(r: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = r.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| conversion_error(idx, Type::Integer, e))
}

fn optional_timestamp(r: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    let secs: Option<i64> = r.get(idx)?;
    secs.map(|s| {
        OffsetDateTime::from_unix_timestamp(s).map_err(|e| conversion_error(idx, Type::Integer, e))
    })
    .transpose()
}

fn pool_from_row(r: &Row<'_>) -> rusqlite::Result<Pool> {
    let strategy: String = r.get(11)?;
    let strategy_allocations: Vec<StrategyAllocation> =
        serde_json::from_str(&strategy).map_err(|e| conversion_error(11, Type::Text, e))?;
    Ok(Pool {
        id: PoolId(r.get(0)?),
        key: PoolKey {
            client_id: r.get(1)?,
            chain: r.get(2)?,
            token: r.get(3)?,
        },
        current_index: decimal(r, 4)?,
        total_shares: decimal(r, 5)?,
        total_staked_balance: decimal(r, 6)?,
        pending_deposit_balance: decimal(r, 7)?,
        cumulative_yield: decimal(r, 8)?,
        apy_rolling_7: optional_decimal(r, 9)?,
        apy_rolling_30: optional_decimal(r, 10)?,
        strategy_allocations,
        is_active: r.get(12)?,
        last_accrual_at: optional_timestamp(r, 13)?,
        created_at: timestamp(r, 14)?,
    })
}

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<AccrualRecord> {
    Ok(AccrualRecord {
        pool_id: PoolId(r.get(0)?),
        period: r.get(1)?,
        old_index: decimal(r, 2)?,
        new_index: decimal(r, 3)?,
        yield_generated: decimal(r, 4)?,
        growth_rate_percent: decimal(r, 5)?,
        annual_percent: decimal(r, 6)?,
        total_staked_at_run: decimal(r, 7)?,
        timestamp: timestamp(r, 8)?,
    })
}

fn position_from_row(r: &Row<'_>) -> rusqlite::Result<HolderPosition> {
    Ok(HolderPosition {
        holder_id: HolderId(r.get(0)?),
        pool_id: PoolId(r.get(1)?),
        shares: decimal(r, 2)?,
        weighted_entry_index: decimal(r, 3)?,
        total_deposited: decimal(r, 4)?,
        total_withdrawn: decimal(r, 5)?,
        last_deposit_at: optional_timestamp(r, 6)?,
        last_withdrawal_at: optional_timestamp(r, 7)?,
        is_active: r.get(8)?,
    })
}

fn strategy_json(allocations: &[StrategyAllocation]) -> Result<String, StoreError> {
    serde_json::to_string(allocations)
        .map_err(|e| StoreError::Sqlite(conversion_error(11, Type::Text, e)))
}

impl SqliteTx<'_> {
    fn expect_pool_row(&self, id: &PoolId, changed: usize) -> Result<(), StoreError> {
        if changed == 0 {
            return Err(StoreError::PoolNotFound(id.clone()));
        }
        Ok(())
    }
}

impl PoolStore for SqliteTx<'_> {
    fn get_pool_for_update(&mut self, id: &PoolId) -> Result<Option<Pool>, StoreError> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pools WHERE id = ?1");
        Ok(self
            .conn
            .query_row(&sql, [id.as_str()], pool_from_row)
            .optional()?)
    }

    fn insert_pool(&mut self, pool: &Pool) -> Result<(), StoreError> {
        if self.get_pool_for_update(&pool.id)?.is_some() {
            return Err(StoreError::PoolExists(pool.id.clone()));
        }
        let sql = format!(
            "INSERT INTO pools ({POOL_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        );
        self.conn.execute(
            &sql,
            params![
                pool.id.as_str(),
                pool.key.client_id,
                pool.key.chain,
                pool.key.token,
                pool.current_index.to_string(),
                pool.total_shares.to_string(),
                pool.total_staked_balance.to_string(),
                pool.pending_deposit_balance.to_string(),
                pool.cumulative_yield.to_string(),
                pool.apy_rolling_7.map(|r| r.to_string()),
                pool.apy_rolling_30.map(|r| r.to_string()),
                strategy_json(&pool.strategy_allocations)?,
                pool.is_active,
                pool.last_accrual_at.map(OffsetDateTime::unix_timestamp),
                pool.created_at.unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    fn list_pools(&mut self) -> Result<Vec<Pool>, StoreError> {
        let sql = format!("SELECT {POOL_COLUMNS} FROM pools ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], pool_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn update_pool_accrual(
        &mut self,
        id: &PoolId,
        new_index: Wad,
        added_yield: Wad,
        staked: Wad,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let cumulative: Option<String> = self
            .conn
            .query_row(
                "SELECT cumulative_yield FROM pools WHERE id = ?1",
                [id.as_str()],
                |r| r.get(0),
            )
            .optional()?;
        let Some(cumulative) = cumulative else {
            return Err(StoreError::PoolNotFound(id.clone()));
        };
        let cumulative = cumulative.parse::<Wad>()?.checked_add(added_yield)?;
        let changed = self.conn.execute(
            "UPDATE pools SET current_index = ?2, cumulative_yield = ?3, total_staked = ?4, \
             last_accrual_at = ?5 WHERE id = ?1",
            params![
                id.as_str(),
                new_index.to_string(),
                cumulative.to_string(),
                staked.to_string(),
                at.unix_timestamp(),
            ],
        )?;
        self.expect_pool_row(id, changed)
    }

    fn update_pool_rolling_apy(
        &mut self,
        id: &PoolId,
        apy_7: Option<Rate>,
        apy_30: Option<Rate>,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE pools SET apy_rolling_7 = ?2, apy_rolling_30 = ?3 WHERE id = ?1",
            params![
                id.as_str(),
                apy_7.map(|r| r.to_string()),
                apy_30.map(|r| r.to_string()),
            ],
        )?;
        self.expect_pool_row(id, changed)
    }

    fn update_pool_balances(
        &mut self,
        id: &PoolId,
        total_shares: Wad,
        total_staked: Wad,
        pending_deposit: Wad,
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE pools SET total_shares = ?2, total_staked = ?3, pending_deposit = ?4 \
             WHERE id = ?1",
            params![
                id.as_str(),
                total_shares.to_string(),
                total_staked.to_string(),
                pending_deposit.to_string(),
            ],
        )?;
        self.expect_pool_row(id, changed)
    }

    fn update_pool_strategy(
        &mut self,
        id: &PoolId,
        allocations: &[StrategyAllocation],
    ) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE pools SET strategy = ?2 WHERE id = ?1",
            params![id.as_str(), strategy_json(allocations)?],
        )?;
        self.expect_pool_row(id, changed)
    }

    fn set_pool_active(&mut self, id: &PoolId, active: bool) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE pools SET is_active = ?2 WHERE id = ?1",
            params![id.as_str(), active],
        )?;
        self.expect_pool_row(id, changed)
    }
}

impl HistoryStore for SqliteTx<'_> {
    fn append_accrual_record(&mut self, record: &AccrualRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO accrual_history ({HISTORY_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        self.conn.execute(
            &sql,
            params![
                record.pool_id.as_str(),
                record.period,
                record.old_index.to_string(),
                record.new_index.to_string(),
                record.yield_generated.to_string(),
                record.growth_rate_percent.to_string(),
                record.annual_percent.to_string(),
                record.total_staked_at_run.to_string(),
                record.timestamp.unix_timestamp(),
            ],
        )?;
        Ok(())
    }

    fn get_index_at_or_before(
        &mut self,
        pool: &PoolId,
        period: i64,
    ) -> Result<Option<Wad>, StoreError> {
        let settled: Option<String> = self
            .conn
            .query_row(
                "SELECT new_index FROM accrual_history WHERE pool_id = ?1 AND period <= ?2 \
                 ORDER BY period DESC, seq DESC LIMIT 1",
                params![pool.as_str(), period],
                |r| r.get(0),
            )
            .optional()?;
        let text = match settled {
            Some(t) => Some(t),
            None => self
                .conn
                .query_row(
                    "SELECT old_index FROM accrual_history WHERE pool_id = ?1 AND period = ?2 \
                     ORDER BY seq ASC LIMIT 1",
                    params![pool.as_str(), period + 1],
                    |r| r.get(0),
                )
                .optional()?,
        };
        Ok(text.map(|t| t.parse::<Wad>()).transpose()?)
    }

    fn list_accrual_records(
        &mut self,
        pool: &PoolId,
        limit: usize,
    ) -> Result<Vec<AccrualRecord>, StoreError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM accrual_history WHERE pool_id = ?1 \
             ORDER BY seq DESC LIMIT ?2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![pool.as_str(), limit], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl PositionStore for SqliteTx<'_> {
    fn get_position_for_update(
        &mut self,
        holder: &HolderId,
        pool: &PoolId,
    ) -> Result<Option<HolderPosition>, StoreError> {
        let sql =
            format!("SELECT {POSITION_COLUMNS} FROM positions WHERE holder_id = ?1 AND pool_id = ?2");
        Ok(self
            .conn
            .query_row(&sql, [holder.as_str(), pool.as_str()], position_from_row)
            .optional()?)
    }

    fn apply_deposit(&mut self, position: &HolderPosition) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT OR REPLACE INTO positions ({POSITION_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        );
        self.conn.execute(
            &sql,
            params![
                position.holder_id.as_str(),
                position.pool_id.as_str(),
                position.shares.to_string(),
                position.weighted_entry_index.to_string(),
                position.total_deposited.to_string(),
                position.total_withdrawn.to_string(),
                position.last_deposit_at.map(OffsetDateTime::unix_timestamp),
                position.last_withdrawal_at.map(OffsetDateTime::unix_timestamp),
                position.is_active,
            ],
        )?;
        Ok(())
    }

    fn apply_withdrawal(&mut self, position: &HolderPosition) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE positions SET shares = ?3, weighted_entry_index = ?4, total_deposited = ?5, \
             total_withdrawn = ?6, last_deposit_at = ?7, last_withdrawal_at = ?8, is_active = ?9 \
             WHERE holder_id = ?1 AND pool_id = ?2",
            params![
                position.holder_id.as_str(),
                position.pool_id.as_str(),
                position.shares.to_string(),
                position.weighted_entry_index.to_string(),
                position.total_deposited.to_string(),
                position.total_withdrawn.to_string(),
                position.last_deposit_at.map(OffsetDateTime::unix_timestamp),
                position.last_withdrawal_at.map(OffsetDateTime::unix_timestamp),
                position.is_active,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::PositionNotFound {
                holder: position.holder_id.clone(),
                pool: position.pool_id.clone(),
            });
        }
        Ok(())
    }
}

impl RunLockStore for SqliteTx<'_> {
    fn try_acquire_run_lease(
        &mut self,
        owner: &str,
        now: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let held: Option<(String, i64)> = self
            .conn
            .query_row("SELECT owner, expires_at FROM run_lease WHERE id = 1", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        if let Some((holder, until)) = held {
            if holder != owner && until > now.unix_timestamp() {
                return Ok(false);
            }
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO run_lease (id, owner, expires_at) VALUES (1, ?1, ?2)",
            params![owner, expires_at.unix_timestamp()],
        )?;
        Ok(true)
    }

    fn release_run_lease(&mut self, owner: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM run_lease WHERE id = 1 AND owner = ?1", [owner])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;
    use tempfile::TempDir;

    #[test]
    fn pool_round_trip() {
        testing::pool_round_trip(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn active_listing() {
        testing::active_listing(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        testing::failed_transaction_rolls_back(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn history_lookup() {
        testing::history_lookup(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn positions() {
        testing::positions(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn run_lease() {
        testing::run_lease(&SqliteLedger::open_in_memory().unwrap());
    }

    #[test]
    fn run_lease_is_shared_between_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.db");
        let first = SqliteLedger::open(&path).unwrap();
        let second = SqliteLedger::open(&path).unwrap();
        let (now, until) = (testing::ts(100), testing::ts(200));
        assert!(first
            .transaction(|tx| tx.try_acquire_run_lease("one", now, until))
            .unwrap());
        assert!(!second
            .transaction(|tx| tx.try_acquire_run_lease("two", now, until))
            .unwrap());
        first.transaction(|tx| tx.release_run_lease("one")).unwrap();
        assert!(second
            .transaction(|tx| tx.try_acquire_run_lease("two", now, until))
            .unwrap());
    }

    #[test]
    fn history_is_append_only() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let pool = testing::sample_pool();
        ledger
            .transaction(|tx| {
                tx.insert_pool(&pool)?;
                tx.append_accrual_record(&testing::record(&pool.id, 1, "1", "1.1"))
            })
            .unwrap();
        let conn = ledger.conn.lock().unwrap();
        assert!(conn
            .execute("UPDATE accrual_history SET new_index = '9'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM accrual_history", []).is_err());
    }

    #[test]
    fn reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        let pool = testing::sample_pool();
        {
            let ledger = SqliteLedger::open(&path).unwrap();
            ledger.transaction(|tx| tx.insert_pool(&pool)).unwrap();
        }
        let ledger = SqliteLedger::open(&path).unwrap();
        assert_eq!(ledger.get_pool(&pool.id).unwrap(), Some(pool));
    }
}
