//! Pool, holder position, accrual history, and quote records.

mod history;
mod pool;
mod position;
mod quote;

pub use history::AccrualRecord;
pub use pool::{
    validate_allocations, AllocationError, Pool, PoolId, PoolKey, StrategyAllocation,
    MAX_ALLOCATION_PERCENT,
};
pub use position::{HolderId, HolderPosition};
pub use quote::YieldQuote;
