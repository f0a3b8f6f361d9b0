//! Per-protocol yield quote, as supplied by the external feed.

use crate::math::{Rate, Wad};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldQuote {
    #[serde(alias = "protocol", alias = "protocolId")]
    pub protocol_id: String,
    /// Annual yield in percent (5.2 for 5.2%).
    #[serde(alias = "apy", alias = "annualPercent")]
    pub annual_percent: Rate,
    #[serde(
        default,
        alias = "tvl",
        alias = "totalValueLocked",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_value_locked: Option<Wad>,
}

impl YieldQuote {
    pub fn new(protocol_id: impl Into<String>, annual_percent: Rate) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            annual_percent,
            total_value_locked: None,
        }
    }

    pub fn matches(&self, protocol_id: &str) -> bool {
        self.protocol_id.trim().eq_ignore_ascii_case(protocol_id.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feed_shapes() {
        let a: YieldQuote =
            serde_json::from_str(r#"{"protocol":"AAVE","apy":5.2,"tvl":1000000000}"#).unwrap();
        let b: YieldQuote =
            serde_json::from_str(r#"{"protocol_id":"AAVE","annual_percent":"5.2"}"#).unwrap();
        assert_eq!(a.annual_percent, b.annual_percent);
        assert_eq!(a.total_value_locked, Some(Wad::from_int(1_000_000_000)));
        assert_eq!(b.total_value_locked, None);
    }

    #[test]
    fn matching_ignores_case() {
        let q = YieldQuote::new("Aave", Rate::ZERO);
        assert!(q.matches("AAVE"));
        assert!(!q.matches("COMPOUND"));
    }
}
