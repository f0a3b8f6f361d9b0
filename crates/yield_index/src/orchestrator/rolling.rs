//! Trailing annualized performance from index history.

use crate::math::{MathError, Rate, Wad};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingWindows {
    pub short: u32,
    pub long: u32,
}

impl Default for RollingWindows {
    fn default() -> Self {
        Self { short: 7, long: 30 }
    }
}

/// `((current / past) - 1) * (periods_per_year / window) * 100`.
pub fn rolling_apy(
    current_index: Wad,
    past_index: Wad,
    window: u32,
    periods_per_year: u32,
) -> Result<Rate, MathError> {
    if window == 0 {
        return Err(MathError::DivisionByZero);
    }
    let growth = Rate::from_wad(current_index.wad_div(past_index)?)?.checked_sub(Rate::ONE)?;
    growth
        .mul_int(i128::from(periods_per_year) * 100)?
        .div_int(i128::from(window))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    #[test]
    fn one_percent_over_a_week() {
        let apy = rolling_apy(wad("1.01"), wad("1"), 7, 365).unwrap();
        // 0.01 * 365/7 * 100
        assert_eq!(apy.to_string(), "52.142857142857142857");
    }

    #[test]
    fn flat_history_is_zero() {
        assert_eq!(rolling_apy(wad("1.2"), wad("1.2"), 30, 365).unwrap(), Rate::ZERO);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(
            rolling_apy(wad("1"), Wad::ZERO, 7, 365),
            Err(MathError::DivisionByZero)
        );
        assert_eq!(
            rolling_apy(wad("1"), wad("1"), 0, 365),
            Err(MathError::DivisionByZero)
        );
    }
}
