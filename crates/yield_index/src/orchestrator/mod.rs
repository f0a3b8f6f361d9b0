//! Scheduled accrual across all pools.

mod period;
mod rolling;
mod run;

pub use period::{
    parse_instant, parse_time_rfc3339, AccrualCalendar, PeriodError, DEFAULT_PERIOD_SECS,
    SECONDS_PER_YEAR,
};
pub use rolling::{rolling_apy, RollingWindows};
pub use run::{
    AccrualOrchestrator, FailedPool, FailureKind, OrchestratorConfig, PoolError, PoolOutcome,
    RollingUpdate, RunError, RunResult, SkipReason, SkippedPool,
};
