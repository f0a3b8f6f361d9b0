//! Run receipts and reproducibility hashing.

mod receipt;

pub use receipt::normalize_for_hash;
pub use receipt::{
    receipt_hash, verify_receipt_file, verify_receipt_hash, write_receipt, RunReceipt,
    VerificationResult, VerifyError, WrittenReceipt,
};
