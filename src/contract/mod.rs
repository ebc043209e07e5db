//! Contract storage subsystem.
//!
//! - [`value`]: storage queries, tagged values, and key composition
//! - [`storage`]: the layered contract state store (persistent / committed /
//!   temporary overlays with revert buffers)
//! - [`json`]: nested state-JSON assembly helpers
//! - [`ipc`]: JSON-RPC client for the external contract execution process

pub mod ipc;
pub mod json;
pub mod storage;
pub mod value;

use crate::storage::kv::StorageError;
use crate::types::encoding::DecodeError;
use shardchain_derive::Error;

/// Errors surfaced by contract-storage operations.
///
/// Fetches distinguish "missing" (`Ok` with `found = false`) from these
/// hard failures.
#[derive(Debug, Error)]
pub enum ContractStorageError {
    /// Malformed query, value, or JSON payload.
    #[error("parse error: {0}")]
    Parse(String),
    /// Depth mismatch, reserved name write, or non-map where a map is expected.
    #[error("schema error: {0}")]
    Schema(String),
    /// Scalar fetch of an absent key with map depth zero.
    #[error("not found: {0}")]
    NotFound(String),
    /// Underlying key/value store failure.
    #[error("database error: {0}")]
    Db(String),
    /// Contract execution process call failure.
    #[error("ipc error: {0}")]
    Ipc(String),
}

impl From<StorageError> for ContractStorageError {
    fn from(value: StorageError) -> Self {
        ContractStorageError::Db(value.to_string())
    }
}

impl From<DecodeError> for ContractStorageError {
    fn from(value: DecodeError) -> Self {
        ContractStorageError::Parse(value.to_string())
    }
}
