//! Blend per-protocol quotes into one annual rate using a pool's allocations.

use crate::math::{MathError, Rate, Wad};
use crate::model::{StrategyAllocation, YieldQuote};
use serde::{Deserialize, Serialize};

/// An allocation with no matching quote in the feed. It contributes zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingQuote {
    pub protocol_id: String,
    pub allocation_percent: Wad,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlendedApy {
    pub annual_percent: Rate,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingQuote>,
}

/// Σ (allocation/100) × quote.annual_percent over the allocations.
///
/// When the feed carries the same protocol twice the first quote wins.
pub fn weighted_apy(
    allocations: &[StrategyAllocation],
    quotes: &[YieldQuote],
) -> Result<BlendedApy, MathError> {
    let mut annual_percent = Rate::ZERO;
    let mut missing = Vec::new();
    for allocation in allocations {
        match quotes.iter().find(|q| q.matches(&allocation.protocol_id)) {
            Some(quote) => {
                let weight = Rate::from_wad(allocation.allocation_percent)?.div_int(100)?;
                annual_percent = annual_percent.checked_add(weight.rate_mul(quote.annual_percent)?)?;
            }
            None => missing.push(MissingQuote {
                protocol_id: allocation.protocol_id.clone(),
                allocation_percent: allocation.allocation_percent,
            }),
        }
    }
    Ok(BlendedApy {
        annual_percent,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(p: &str, pct: u64) -> StrategyAllocation {
        StrategyAllocation::new(p, Wad::from_int(pct))
    }

    fn quote(p: &str, apy: &str) -> YieldQuote {
        YieldQuote::new(p, apy.parse().unwrap())
    }

    #[test]
    fn two_protocol_blend() {
        let b = weighted_apy(
            &[alloc("AAVE", 60), alloc("COMPOUND", 40)],
            &[quote("AAVE", "5.2"), quote("COMPOUND", "4.1")],
        )
        .unwrap();
        assert_eq!(b.annual_percent, "4.76".parse().unwrap());
        assert!(b.missing.is_empty());
    }

    #[test]
    fn match_is_case_insensitive() {
        let b = weighted_apy(&[alloc("aave", 100)], &[quote("AAVE", "5")]).unwrap();
        assert_eq!(b.annual_percent, Rate::from_int(5));
    }

    #[test]
    fn missing_quote_contributes_zero() {
        let b = weighted_apy(
            &[alloc("AAVE", 60), alloc("MORPHO", 40)],
            &[quote("AAVE", "5")],
        )
        .unwrap();
        assert_eq!(b.annual_percent, Rate::from_int(3));
        assert_eq!(b.missing.len(), 1);
        assert_eq!(b.missing[0].protocol_id, "MORPHO");
    }

    #[test]
    fn nothing_matches() {
        let b = weighted_apy(&[alloc("AAVE", 100)], &[]).unwrap();
        assert_eq!(b.annual_percent, Rate::ZERO);
        let b = weighted_apy(&[], &[quote("AAVE", "5")]).unwrap();
        assert_eq!(b.annual_percent, Rate::ZERO);
        assert!(b.missing.is_empty());
    }

    #[test]
    fn negative_quote_pulls_blend_down() {
        let b = weighted_apy(
            &[alloc("A", 50), alloc("B", 50)],
            &[quote("A", "4"), quote("B", "-2")],
        )
        .unwrap();
        assert_eq!(b.annual_percent, Rate::from_int(1));
    }
}
