//! Holder value from shares and entry index, and withdrawal effects on pool totals.

use crate::math::{MathError, Wad};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryValueError {
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Wad, available: Wad },
    #[error("entry index is zero")]
    ZeroEntryIndex,
    #[error(transparent)]
    Math(#[from] MathError),
}

/// `shares * current_index / entry_index`, rounded down.
pub fn current_value(shares: Wad, entry_index: Wad, current_index: Wad) -> Result<Wad, EntryValueError> {
    if entry_index.is_zero() {
        return Err(EntryValueError::ZeroEntryIndex);
    }
    Ok(shares.mul_div(current_index, entry_index)?)
}

/// Share-weighted average of the held entry index and the index of a new deposit.
///
/// An empty position (no shares before or after) takes `index_at_deposit`.
pub fn recombine_entry_index(
    old_shares: Wad,
    old_entry_index: Wad,
    new_shares: Wad,
    index_at_deposit: Wad,
) -> Result<Wad, EntryValueError> {
    if old_shares.is_zero() {
        return Ok(index_at_deposit);
    }
    if new_shares.is_zero() {
        return Ok(old_entry_index);
    }
    Ok(Wad::weighted_mean(
        old_shares,
        old_entry_index,
        new_shares,
        index_at_deposit,
    )?)
}

/// Shares worth `value` at `current_index` for a position entered at `entry_index`.
pub fn shares_for_value(value: Wad, entry_index: Wad, current_index: Wad) -> Result<Wad, EntryValueError> {
    if current_index.is_zero() {
        return Err(EntryValueError::Math(MathError::DivisionByZero));
    }
    Ok(value.mul_div(entry_index, current_index)?)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalImpact {
    pub new_total_staked: Wad,
    pub remaining_value: Wad,
    /// Share of the staked balance leaving the pool, in percent.
    pub percentage_withdrawn: Wad,
    /// Pool index the withdrawal was priced at.
    pub priced_at_index: Wad,
}

pub fn withdrawal_impact(
    total_staked: Wad,
    amount: Wad,
    current_index: Wad,
) -> Result<WithdrawalImpact, EntryValueError> {
    if amount > total_staked {
        return Err(EntryValueError::InsufficientBalance {
            requested: amount,
            available: total_staked,
        });
    }
    let new_total_staked = total_staked.checked_sub(amount)?;
    let percentage_withdrawn = if total_staked.is_zero() {
        Wad::ZERO
    } else {
        amount.mul_div(Wad::from_int(100), total_staked)?
    };
    Ok(WithdrawalImpact {
        new_total_staked,
        remaining_value: new_total_staked,
        percentage_withdrawn,
        priced_at_index: current_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wad(s: &str) -> Wad {
        s.parse().unwrap()
    }

    #[test]
    fn value_resolution() {
        let v = current_value(wad("1000"), wad("1.0"), wad("1.05")).unwrap();
        assert_eq!(v, wad("1050"));
    }

    #[test]
    fn value_with_zero_entry_rejected() {
        assert_eq!(
            current_value(wad("1"), Wad::ZERO, wad("1")),
            Err(EntryValueError::ZeroEntryIndex)
        );
    }

    #[test]
    fn deposit_then_read_round_trips() {
        let index = wad("1.037215");
        let amount = wad("1234.567891");
        let entry = recombine_entry_index(Wad::ZERO, Wad::ONE, amount, index).unwrap();
        assert_eq!(entry, index);
        assert_eq!(current_value(amount, entry, index).unwrap(), amount);
    }

    #[test]
    fn recombination_weights_by_shares() {
        // 100 @ 1.0 and 300 @ 1.2 -> (100 + 360) / 400
        let e = recombine_entry_index(wad("100"), wad("1.0"), wad("300"), wad("1.2")).unwrap();
        assert_eq!(e, wad("1.15"));
        let same = recombine_entry_index(wad("100"), wad("1.1"), Wad::ZERO, wad("1.3")).unwrap();
        assert_eq!(same, wad("1.1"));
    }

    #[test]
    fn shares_to_burn() {
        // value 105 at index 1.05 from entry 1.0 is 100 shares
        let s = shares_for_value(wad("105"), wad("1.0"), wad("1.05")).unwrap();
        assert_eq!(s, wad("100"));
    }

    #[test]
    fn withdrawal_guard() {
        assert_eq!(
            withdrawal_impact(wad("100"), wad("150"), Wad::ONE),
            Err(EntryValueError::InsufficientBalance {
                requested: wad("150"),
                available: wad("100")
            })
        );
    }

    #[test]
    fn withdrawal_reduces_staked() {
        let i = withdrawal_impact(wad("200"), wad("50"), wad("1.02")).unwrap();
        assert_eq!(i.new_total_staked, wad("150"));
        assert_eq!(i.remaining_value, wad("150"));
        assert_eq!(i.percentage_withdrawn, wad("25"));
        assert_eq!(i.priced_at_index, wad("1.02"));

        let all = withdrawal_impact(wad("200"), wad("200"), Wad::ONE).unwrap();
        assert_eq!(all.new_total_staked, Wad::ZERO);
        assert_eq!(all.percentage_withdrawn, wad("100"));
    }

    #[test]
    fn empty_pool_zero_withdrawal() {
        let i = withdrawal_impact(Wad::ZERO, Wad::ZERO, Wad::ONE).unwrap();
        assert_eq!(i.percentage_withdrawn, Wad::ZERO);
    }
}
