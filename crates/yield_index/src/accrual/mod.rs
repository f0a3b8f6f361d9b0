//! Accrual kernel: blended APY, index projection and holder entry values.
//!
//! Everything here is pure. Persistence and scheduling live in `store` and
//! `orchestrator`.

mod entry_value;
mod projector;
mod weighted_apy;

pub use entry_value::{
    current_value, recombine_entry_index, shares_for_value, withdrawal_impact, EntryValueError,
    WithdrawalImpact,
};
pub use projector::{apply_growth, project_index, AccrualError, IndexProjection, MAX_GROWTH_MULTIPLE};
pub use weighted_apy::{weighted_apy, BlendedApy, MissingQuote};
