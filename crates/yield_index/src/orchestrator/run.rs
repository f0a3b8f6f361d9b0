//! Batch accrual over every active pool.

use super::period::AccrualCalendar;
use super::rolling::{rolling_apy, RollingWindows};
use crate::accrual::{project_index, weighted_apy, AccrualError, MissingQuote};
use crate::math::{MathError, Rate, Wad};
use crate::model::{AccrualRecord, PoolId, YieldQuote};
use crate::oracle::{OracleFetchError, YieldSource};
use crate::store::{Ledger, LedgerTx, StoreError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{error, info, warn};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(15 * 60);

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Lease owner for one run: unique per process and per run within it.
fn run_owner() -> String {
    format!(
        "{}:{}",
        std::process::id(),
        RUN_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("another accrual run is in progress")]
    RunInProgress,
    #[error("yield feed: {0}")]
    Oracle(#[from] OracleFetchError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

/// Why one pool's update failed. The run carries on with the others.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Math(#[from] MathError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    IndexRegression,
    UnrealisticGrowth,
    Math,
    Store,
}

impl PoolError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PoolError::Accrual(AccrualError::IndexRegression { .. }) => FailureKind::IndexRegression,
            PoolError::Accrual(AccrualError::UnrealisticGrowth { .. }) => {
                FailureKind::UnrealisticGrowth
            }
            PoolError::Accrual(AccrualError::Math(_)) | PoolError::Math(_) => FailureKind::Math,
            PoolError::Store(_) => FailureKind::Store,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolOutcome {
    pub pool_id: PoolId,
    pub old_index: Wad,
    pub new_index: Wad,
    pub yield_generated: Wad,
    pub growth_rate_percent: Rate,
    pub annual_percent: Rate,
    pub total_staked_at_run: Wad,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_quotes: Vec<MissingQuote>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPool {
    pub pool_id: PoolId,
    pub kind: FailureKind,
    pub error: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyAccrued,
    Inactive,
    NoStakedBalance,
    /// Listed at the start of the run but gone when locked.
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPool {
    pub pool_id: PoolId,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingUpdate {
    pub pool_id: PoolId,
    pub apy_rolling_7: Option<Rate>,
    pub apy_rolling_30: Option<Rate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub period: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub quotes: Vec<YieldQuote>,
    pub succeeded: Vec<PoolOutcome>,
    pub failed: Vec<FailedPool>,
    pub skipped: Vec<SkippedPool>,
    pub rolling: Vec<RollingUpdate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub calendar: AccrualCalendar,
    pub windows: RollingWindows,
    pub fetch_timeout: Duration,
    /// How long a run lease stays valid if its run never releases it.
    pub lease_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            calendar: AccrualCalendar::daily(),
            windows: RollingWindows::default(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

enum PoolAccrual {
    Applied(PoolOutcome),
    Skipped(SkipReason),
}

/// Drives one accrual per pool per period. Only one run executes at a time
/// per store, enforced through the store's run lease.
pub struct AccrualOrchestrator<Y, L> {
    source: Y,
    ledger: L,
    config: OrchestratorConfig,
}

impl<Y: YieldSource, L: Ledger> AccrualOrchestrator<Y, L> {
    pub fn new(source: Y, ledger: L, config: OrchestratorConfig) -> Self {
        Self {
            source,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<RunResult, RunError> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Run as if the clock read `now`. The lease itself always runs on the wall clock.
    pub async fn run_at(&self, now: OffsetDateTime) -> Result<RunResult, RunError> {
        let owner = run_owner();
        let clock = OffsetDateTime::now_utc();
        let ttl = time::Duration::try_from(self.config.lease_ttl).unwrap_or(time::Duration::MAX);
        let expires_at = clock.saturating_add(ttl);
        let acquired = self
            .ledger
            .transaction(|tx| tx.try_acquire_run_lease(&owner, clock, expires_at))?;
        if !acquired {
            warn!("accrual run rejected, another run holds the lease");
            return Err(RunError::RunInProgress);
        }
        let outcome = self.run_leased(now).await;
        if let Err(e) = self.ledger.transaction(|tx| tx.release_run_lease(&owner)) {
            warn!(error = %e, %expires_at, "run lease not released, it lapses at expiry");
        }
        outcome
    }

    async fn run_leased(&self, now: OffsetDateTime) -> Result<RunResult, RunError> {
        let period = self.config.calendar.period_of(now);
        info!(period, "accrual run started");

        let quotes = match tokio::time::timeout(self.config.fetch_timeout, self.source.fetch_quotes())
            .await
        {
            Ok(fetched) => fetched?,
            Err(_) => return Err(OracleFetchError::Timeout(self.config.fetch_timeout).into()),
        };
        if quotes.is_empty() {
            warn!("yield feed returned no quotes, pools accrue at zero");
        }
        let pools = self.ledger.list_active_pools_with_balance()?;
        info!(pools = pools.len(), quotes = quotes.len(), "accruing");

        let mut result = RunResult {
            period,
            started_at: now,
            quotes,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            rolling: Vec::new(),
        };
        for pool in pools {
            match self.accrue_pool(&pool.id, &result.quotes, period, now) {
                Ok(PoolAccrual::Applied(outcome)) => {
                    info!(
                        pool = %outcome.pool_id,
                        old_index = %outcome.old_index,
                        new_index = %outcome.new_index,
                        yield_generated = %outcome.yield_generated,
                        "pool accrued"
                    );
                    result.succeeded.push(outcome);
                }
                Ok(PoolAccrual::Skipped(reason)) => {
                    info!(pool = %pool.id, ?reason, "pool skipped");
                    result.skipped.push(SkippedPool {
                        pool_id: pool.id,
                        reason,
                    });
                }
                Err(e) => {
                    let kind = e.kind();
                    if kind == FailureKind::IndexRegression {
                        error!(pool = %pool.id, alert = "operator", error = %e, "index regression, pool update halted");
                    } else {
                        warn!(pool = %pool.id, ?kind, error = %e, "pool accrual failed");
                    }
                    result.failed.push(FailedPool {
                        pool_id: pool.id,
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.refresh_rolling(&mut result);
        info!(
            period,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            "accrual run finished"
        );
        Ok(result)
    }

    fn accrue_pool(
        &self,
        id: &PoolId,
        quotes: &[YieldQuote],
        period: i64,
        now: OffsetDateTime,
    ) -> Result<PoolAccrual, PoolError> {
        let calendar = self.config.calendar;
        self.ledger.transaction(|tx: &mut dyn LedgerTx| {
            let Some(pool) = tx.get_pool_for_update(id)? else {
                return Ok(PoolAccrual::Skipped(SkipReason::NotFound));
            };
            if !pool.is_active {
                return Ok(PoolAccrual::Skipped(SkipReason::Inactive));
            }
            if pool.total_staked_balance.is_zero() {
                return Ok(PoolAccrual::Skipped(SkipReason::NoStakedBalance));
            }
            if pool
                .last_accrual_at
                .is_some_and(|last| calendar.period_of(last) >= period)
            {
                return Ok(PoolAccrual::Skipped(SkipReason::AlreadyAccrued));
            }

            let blended = weighted_apy(&pool.strategy_allocations, quotes)?;
            for m in &blended.missing {
                warn!(
                    pool = %id,
                    protocol = %m.protocol_id,
                    allocation = %m.allocation_percent,
                    "no quote for allocated protocol, counted as zero"
                );
            }
            let projection = project_index(
                pool.current_index,
                pool.total_staked_balance,
                blended.annual_percent,
                calendar.periods_per_year(),
                now,
            )?;
            let staked_after = pool
                .total_staked_balance
                .checked_add(projection.yield_generated)?;
            tx.update_pool_accrual(
                id,
                projection.new_index,
                projection.yield_generated,
                staked_after,
                now,
            )?;
            tx.append_accrual_record(&AccrualRecord {
                pool_id: id.clone(),
                period,
                old_index: projection.old_index,
                new_index: projection.new_index,
                yield_generated: projection.yield_generated,
                growth_rate_percent: projection.growth_rate_percent,
                annual_percent: blended.annual_percent,
                total_staked_at_run: pool.total_staked_balance,
                timestamp: now,
            })?;
            Ok(PoolAccrual::Applied(PoolOutcome {
                pool_id: id.clone(),
                old_index: projection.old_index,
                new_index: projection.new_index,
                yield_generated: projection.yield_generated,
                growth_rate_percent: projection.growth_rate_percent,
                annual_percent: blended.annual_percent,
                total_staked_at_run: pool.total_staked_balance,
                missing_quotes: blended.missing,
            }))
        })
    }

    /// Recompute trailing rates for the pools accrued in this run.
    fn refresh_rolling(&self, result: &mut RunResult) {
        let windows = self.config.windows;
        let per_year = self.config.calendar.periods_per_year();
        let period = result.period;
        for outcome in &result.succeeded {
            let id = &outcome.pool_id;
            let current = outcome.new_index;
            let update = self.ledger.transaction(|tx: &mut dyn LedgerTx| {
                let mut trailing = |window: u32| -> Result<Option<Rate>, PoolError> {
                    match tx.get_index_at_or_before(id, period - i64::from(window))? {
                        Some(past) => Ok(Some(rolling_apy(current, past, window, per_year)?)),
                        None => Ok(None),
                    }
                };
                let apy_7 = trailing(windows.short)?;
                let apy_30 = trailing(windows.long)?;
                tx.update_pool_rolling_apy(id, apy_7, apy_30)?;
                Ok::<_, PoolError>(RollingUpdate {
                    pool_id: id.clone(),
                    apy_rolling_7: apy_7,
                    apy_rolling_30: apy_30,
                })
            });
            match update {
                Ok(u) => result.rolling.push(u),
                Err(e) => warn!(pool = %id, error = %e, "rolling apy not updated"),
            }
        }
    }

    /// Run once per period until `shutdown` resolves. Failed runs are logged and retried next period.
    pub async fn run_every_period<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            match self.run().await {
                Ok(r) => info!(
                    period = r.period,
                    succeeded = r.succeeded.len(),
                    failed = r.failed.len(),
                    "scheduled run complete"
                ),
                Err(e) => error!(error = %e, "scheduled run aborted"),
            }
            let wait = self
                .config
                .calendar
                .until_next_period(OffsetDateTime::now_utc());
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
