//! Annual → per-period compounding rate conversion.
//!
//! `daily_rate = (1 + annual_percent / 100)^(1/365) - 1`, computed as a fixed-point
//! 365th root so the result is reproducible bit-for-bit across runs and hosts.

use crate::math::fixed::{MathError, Rate, Wad, WAD_SCALE};

/// Accrual periods per year.
pub const PERIODS_PER_YEAR: u32 = 365;

const MAX_ROOT_ITERATIONS: usize = 4096;

/// `x^(1/n)` by Newton iteration, rounded down.
pub fn nth_root(x: Wad, n: u32) -> Result<Wad, MathError> {
    if n == 0 {
        return Err(MathError::InvalidRate("zeroth root".to_string()));
    }
    if n == 1 || x.is_zero() || x == Wad::ONE {
        return Ok(x);
    }
    let n_wide = u128::from(n);
    // Newton descends monotonically from any start above the root.
    let mut y = if x > Wad::ONE {
        upper_seed(x, n)?
    } else {
        Wad::ONE.checked_sub(Wad::from_raw((WAD_SCALE - x.raw()) / n_wide))?
    };
    for _ in 0..MAX_ROOT_ITERATIONS {
        let quotient = x_over_pow(x, y, n - 1)?;
        let weighted = y
            .raw()
            .checked_mul(n_wide - 1)
            .and_then(|v| v.checked_add(quotient.raw()))
            .ok_or(MathError::Overflow)?;
        let next = Wad::from_raw(weighted / n_wide);
        if next >= y {
            return Ok(y);
        }
        y = next;
    }
    Err(MathError::InvalidRate(format!(
        "root {n} of {x} did not converge"
    )))
}

/// Start point at or above `x^(1/n)` for `x > 1`, at most about twice the root.
///
/// With `x < 2^b`, the root is below `2^(b/n)`. For `b <= n` that is at most
/// `1 + b/n`; the tangent `1 + (x-1)/n` is also an upper bound, so take the
/// smaller. For `b > n` use `2^ceil(b/n)`.
fn upper_seed(x: Wad, n: u32) -> Result<Wad, MathError> {
    let whole = x.raw() / WAD_SCALE;
    let bits = u128::BITS - whole.leading_zeros();
    let tangent = Wad::ONE.checked_add(Wad::from_raw((x.raw() - WAD_SCALE) / u128::from(n)))?;
    if bits <= n {
        let bound = Wad::ONE.checked_add(Wad::from_raw(WAD_SCALE * u128::from(bits) / u128::from(n)))?;
        return Ok(tangent.min(bound));
    }
    let shift = bits.div_ceil(n);
    WAD_SCALE
        .checked_shl(shift)
        .filter(|v| v >> shift == WAD_SCALE)
        .map(Wad::from_raw)
        .ok_or(MathError::Overflow)
}

/// `x / y^k` without letting the power overflow.
fn x_over_pow(x: Wad, y: Wad, k: u32) -> Result<Wad, MathError> {
    if y >= Wad::ONE {
        x.wad_mul(Wad::ONE.wad_div(y)?.powi(k)?)
    } else {
        x.wad_div(y.powi(k)?)
    }
}

/// Per-period growth factor `(1 + annual_percent/100)^(1/periods_per_year)`.
pub fn period_growth_factor(annual_percent: Rate, periods_per_year: u32) -> Result<Wad, MathError> {
    let base = Rate::ONE.checked_add(annual_percent.div_int(100)?)?;
    if base.raw() <= 0 {
        return Err(MathError::InvalidRate(format!(
            "annual rate {annual_percent}% leaves no principal"
        )));
    }
    nth_root(base.to_wad()?, periods_per_year)
}

/// Daily compounding rate for an annual percentage (as a fraction, not a percent).
pub fn daily_rate(annual_percent: Rate) -> Result<Rate, MathError> {
    let factor = period_growth_factor(annual_percent, PERIODS_PER_YEAR)?;
    Rate::from_wad(factor)?.checked_sub(Rate::ONE)
}
