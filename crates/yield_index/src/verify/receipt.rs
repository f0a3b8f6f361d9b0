//! Sealed accrual runs and their SHA-256 digests.

use crate::model::YieldQuote;
use crate::orchestrator::{FailedPool, PoolOutcome, RunResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("format time: {0}")]
    Time(#[from] time::error::Format),
}

const RECEIPT_VERSION: u32 = 2;
const RECEIPT_SUFFIX: &str = ".receipt.json";
const MAX_NAME_COLLISIONS: u32 = 1000;

/// What one accrual run fed in and what it committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReceipt {
    pub version: u32,
    pub period: i64,
    /// Start of the sealed run, unix seconds. Tells apart runs in one period.
    pub started_at_unix: i64,
    pub created_utc_rfc3339: String,
    /// Sorted by protocol id.
    pub quotes: Vec<YieldQuote>,
    /// Sorted by pool id.
    pub succeeded: Vec<PoolOutcome>,
    /// Sorted by pool id.
    pub failed: Vec<FailedPool>,
}

impl RunReceipt {
    pub fn seal(result: &RunResult, created: OffsetDateTime) -> Result<Self, VerifyError> {
        let mut quotes = result.quotes.clone();
        quotes.sort_by(|a, b| a.protocol_id.cmp(&b.protocol_id));
        let mut succeeded = result.succeeded.clone();
        succeeded.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        let mut failed = result.failed.clone();
        failed.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        Ok(Self {
            version: RECEIPT_VERSION,
            period: result.period,
            started_at_unix: result.started_at.unix_timestamp(),
            created_utc_rfc3339: created.format(&Rfc3339)?,
            quotes,
            succeeded,
            failed,
        })
    }

    /// `<period>-<started_at_unix>`
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.period, self.started_at_unix)
    }
}

/// Normalize JSON for hashing: sort keys and no whitespace.
pub fn normalize_for_hash(value: &serde_json::Value) -> Result<String, VerifyError> {
    Ok(serde_json::to_string(&sort_json_keys(value))?)
}

fn sort_json_keys(v: &serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(m) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = m.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_json_keys(v)))
                    .collect(),
            )
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_json_keys).collect())
        }
        other => other.clone(),
    }
}

/// SHA-256 over the normalized receipt JSON, lowercase hex.
pub fn receipt_hash(receipt: &RunReceipt) -> Result<String, VerifyError> {
    let json = serde_json::to_value(receipt)?;
    let normalized = normalize_for_hash(&json)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub receipt_hash: String,
    pub expected_hash: String,
    pub matches: bool,
}

/// Compare a receipt against the content of its `.sha256` file.
pub fn verify_receipt_hash(
    receipt: &RunReceipt,
    expected_hex: &str,
) -> Result<VerificationResult, VerifyError> {
    let receipt_hash = receipt_hash(receipt)?;
    let expected = expected_hex
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    Ok(VerificationResult {
        matches: receipt_hash == expected,
        receipt_hash,
        expected_hash: expected,
    })
}

/// Where [`write_receipt`] put a receipt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WrittenReceipt {
    pub receipt_path: PathBuf,
    pub digest_path: PathBuf,
    pub hash: String,
}

/// Write `<stem>.receipt.json` and `<stem>.sha256` into `dir`. Existing
/// receipts are never replaced: on a name clash the stem gets `-1`, `-2`, ...
pub fn write_receipt(receipt: &RunReceipt, dir: &Path) -> Result<WrittenReceipt, VerifyError> {
    std::fs::create_dir_all(dir)?;
    let hash = receipt_hash(receipt)?;
    let body = serde_json::to_vec_pretty(receipt)?;
    let stem = receipt.file_stem();
    for n in 0..MAX_NAME_COLLISIONS {
        let name = if n == 0 { stem.clone() } else { format!("{stem}-{n}") };
        let receipt_path = dir.join(format!("{name}{RECEIPT_SUFFIX}"));
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&receipt_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };
        file.write_all(&body)?;
        let digest_path = digest_path_for(&receipt_path);
        std::fs::write(&digest_path, format!("{hash}\n"))?;
        return Ok(WrittenReceipt {
            receipt_path,
            digest_path,
            hash,
        });
    }
    Err(VerifyError::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("{MAX_NAME_COLLISIONS} receipts already named {stem}"),
    )))
}

/// `x.receipt.json` pairs with `x.sha256` in the same directory.
fn digest_path_for(receipt_path: &Path) -> PathBuf {
    let name = receipt_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(RECEIPT_SUFFIX).unwrap_or(&name);
    receipt_path.with_file_name(format!("{base}.sha256"))
}

/// Read a receipt and the `.sha256` file next to it, then verify.
pub fn verify_receipt_file(path: &Path) -> Result<VerificationResult, VerifyError> {
    let receipt: RunReceipt = serde_json::from_slice(&std::fs::read(path)?)?;
    let expected = std::fs::read_to_string(digest_path_for(path))?;
    verify_receipt_hash(&receipt, &expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Wad;
    use crate::model::PoolId;
    use crate::orchestrator::FailureKind;
    use tempfile::TempDir;

    fn result() -> RunResult {
        RunResult {
            period: 20_000,
            started_at: OffsetDateTime::from_unix_timestamp(1_728_000_000).unwrap(),
            quotes: vec![
                YieldQuote::new("COMPOUND", "4.1".parse().unwrap()),
                YieldQuote::new("AAVE", "5.2".parse().unwrap()),
            ],
            succeeded: vec![PoolOutcome {
                pool_id: PoolId::from("c:base:usdc"),
                old_index: Wad::ONE,
                new_index: "1.0001".parse().unwrap(),
                yield_generated: "0.1".parse().unwrap(),
                growth_rate_percent: "0.01".parse().unwrap(),
                annual_percent: "3.7".parse().unwrap(),
                total_staked_at_run: Wad::from_int(1000),
                missing_quotes: vec![],
            }],
            failed: vec![FailedPool {
                pool_id: PoolId::from("c:base:weth"),
                kind: FailureKind::IndexRegression,
                error: "index regression".into(),
            }],
            skipped: vec![],
            rolling: vec![],
        }
    }

    fn created() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_728_000_100).unwrap()
    }

    #[test]
    fn normalize_deterministic() {
        let a = serde_json::json!({"z":1,"a":{"y":2,"b":3}});
        let b = serde_json::json!({"a":{"b":3,"y":2},"z":1});
        assert_eq!(normalize_for_hash(&a).unwrap(), normalize_for_hash(&b).unwrap());
    }

    #[test]
    fn hash_ignores_quote_order() {
        let r1 = RunReceipt::seal(&result(), created()).unwrap();
        let mut shuffled = result();
        shuffled.quotes.reverse();
        let r2 = RunReceipt::seal(&shuffled, created()).unwrap();
        assert_eq!(r1.quotes[0].protocol_id, "AAVE");
        let h = receipt_hash(&r1).unwrap();
        assert_eq!(h, receipt_hash(&r2).unwrap());
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn verify_detects_tampering() {
        let receipt = RunReceipt::seal(&result(), created()).unwrap();
        let good = receipt_hash(&receipt).unwrap();
        assert!(verify_receipt_hash(&receipt, &good.to_uppercase()).unwrap().matches);
        let mut tampered = receipt.clone();
        tampered.succeeded[0].new_index = "1.5".parse().unwrap();
        assert!(!verify_receipt_hash(&tampered, &good).unwrap().matches);
    }

    #[test]
    fn write_then_verify_files() {
        let dir = TempDir::new().unwrap();
        let receipt = RunReceipt::seal(&result(), created()).unwrap();
        let written = write_receipt(&receipt, dir.path()).unwrap();
        assert_eq!(written.receipt_path, dir.path().join("20000-1728000000.receipt.json"));
        assert_eq!(written.digest_path, dir.path().join("20000-1728000000.sha256"));
        let v = verify_receipt_file(&written.receipt_path).unwrap();
        assert!(v.matches);
        assert_eq!(v.receipt_hash, written.hash);

        std::fs::write(&written.digest_path, "00".repeat(32)).unwrap();
        assert!(!verify_receipt_file(&written.receipt_path).unwrap().matches);
    }

    #[test]
    fn runs_in_one_period_keep_separate_receipts() {
        let dir = TempDir::new().unwrap();
        let first = RunReceipt::seal(&result(), created()).unwrap();
        let mut retry = result();
        retry.started_at = OffsetDateTime::from_unix_timestamp(1_728_003_600).unwrap();
        retry.succeeded.clear();
        let second = RunReceipt::seal(&retry, created()).unwrap();
        assert_eq!(first.period, second.period);

        let a = write_receipt(&first, dir.path()).unwrap();
        let b = write_receipt(&second, dir.path()).unwrap();
        // Same start instant: suffixed, never overwritten.
        let c = write_receipt(&second, dir.path()).unwrap();
        assert_ne!(a.receipt_path, b.receipt_path);
        assert_eq!(c.receipt_path, dir.path().join("20000-1728003600-1.receipt.json"));

        let kept: RunReceipt =
            serde_json::from_slice(&std::fs::read(&a.receipt_path).unwrap()).unwrap();
        assert_eq!(kept.succeeded.len(), 1);
        for w in [&a, &b, &c] {
            assert!(verify_receipt_file(&w.receipt_path).unwrap().matches);
        }
    }
}
