//! Fixed-point arithmetic and rate conversion.

mod fixed;
mod growth;

pub use fixed::{MathError, Rate, Wad, WAD_DECIMALS, WAD_SCALE};
pub use growth::{daily_rate, nth_root, period_growth_factor, PERIODS_PER_YEAR};
