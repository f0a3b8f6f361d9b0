//! yield_index: growth-index accounting for pooled yield vaults.
//!
//! Each (client, chain, token) pool carries one monotonically growing index.
//! Depositors hold shares and an entry index, and their value is derived from
//! the pool index rather than updated on every accrual. All persisted
//! quantities are 1e18 fixed point.

pub mod accrual;
pub mod config;
pub mod ledger;
pub mod math;
pub mod model;
pub mod oracle;
pub mod orchestrator;
pub mod store;
pub mod verify;

pub use accrual::{
    current_value, project_index, recombine_entry_index, weighted_apy, withdrawal_impact,
    AccrualError, BlendedApy, IndexProjection, WithdrawalImpact,
};
pub use config::{ConfigError, EngineConfig};
pub use ledger::{client_growth_index, HolderBalance, LedgerError, PoolSpec};
pub use math::{daily_rate, MathError, Rate, Wad};
pub use model::{
    AccrualRecord, HolderId, HolderPosition, Pool, PoolId, PoolKey, StrategyAllocation, YieldQuote,
};
pub use oracle::{HttpYieldSource, OracleFetchError, StaticYieldSource, YieldSource};
pub use orchestrator::{AccrualOrchestrator, OrchestratorConfig, RunError, RunResult};
pub use store::{Ledger, MemoryLedger, SqliteLedger, StoreError};
pub use verify::{receipt_hash, verify_receipt_hash, RunReceipt};
