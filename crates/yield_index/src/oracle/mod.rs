//! Yield feeds: where the per-protocol annual rates come from.

mod fixed;
mod http;

pub use fixed::StaticYieldSource;
pub use http::{HttpYieldSource, OracleConfig};

use crate::model::YieldQuote;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleFetchError {
    #[error("request: {0}")]
    Request(#[from] reqwest::Error),
    #[error("url: {0}")]
    Url(#[from] url::ParseError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("api error: status {0} body {1}")]
    Api(u16, String),
    #[error("parse quotes: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Current annual yield per protocol. The feed is untrusted and may omit protocols.
pub trait YieldSource: Send + Sync {
    fn fetch_quotes(&self) -> impl Future<Output = Result<Vec<YieldQuote>, OracleFetchError>> + Send;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QuoteBody {
    Bare(Vec<YieldQuote>),
    Wrapped { quotes: Vec<YieldQuote> },
}

/// Accepts `[{...}]` or `{"quotes": [{...}]}`.
pub fn parse_quotes(body: &str) -> Result<Vec<YieldQuote>, OracleFetchError> {
    let parsed: QuoteBody =
        serde_json::from_str(body).map_err(|e| OracleFetchError::Parse(e.to_string()))?;
    Ok(match parsed {
        QuoteBody::Bare(q) | QuoteBody::Wrapped { quotes: q } => q,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Rate;

    #[test]
    fn both_shapes_parse() {
        let bare = parse_quotes(r#"[{"protocol":"AAVE","apy":5.2}]"#).unwrap();
        let wrapped =
            parse_quotes(r#"{"quotes":[{"protocol_id":"AAVE","annual_percent":"5.2"}]}"#).unwrap();
        assert_eq!(bare, wrapped);
        assert_eq!(bare[0].annual_percent, "5.2".parse::<Rate>().unwrap());
    }

    #[test]
    fn garbage_is_parse_error() {
        assert!(matches!(
            parse_quotes("<html>"),
            Err(OracleFetchError::Parse(_))
        ));
        assert!(matches!(
            parse_quotes(r#"[{"protocol":"AAVE"}]"#),
            Err(OracleFetchError::Parse(_))
        ));
    }
}
