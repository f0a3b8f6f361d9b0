//! Quotes known up front: from code or a JSON file.

use super::{parse_quotes, OracleFetchError, YieldSource};
use crate::model::YieldQuote;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct StaticYieldSource {
    quotes: Vec<YieldQuote>,
}

impl StaticYieldSource {
    pub fn new(quotes: Vec<YieldQuote>) -> Self {
        Self { quotes }
    }

    /// Load quotes from a JSON file in either feed shape.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OracleFetchError> {
        let body = std::fs::read_to_string(path)?;
        Ok(Self::new(parse_quotes(&body)?))
    }

    pub fn quotes(&self) -> &[YieldQuote] {
        &self.quotes
    }
}

impl YieldSource for StaticYieldSource {
    async fn fetch_quotes(&self) -> Result<Vec<YieldQuote>, OracleFetchError> {
        Ok(self.quotes.clone())
    }
}
