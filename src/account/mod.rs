//! Account state subsystem.
//!
//! - [`account`]: the account record bound into the state trie
//! - [`transaction`] / [`receipt`]: the transaction-application surface
//! - [`base`]: address-to-account map bound to the trie
//! - [`temp`]: transactional working set above the base store
//! - [`delta`]: serialized difference between temp and base
//! - [`store`]: the orchestrating account store (commit, revert, persistence)

pub mod account;
pub mod base;
pub mod delta;
pub mod receipt;
pub mod store;
pub mod temp;
pub mod transaction;

use crate::contract::ContractStorageError;
use crate::storage::kv::StorageError;
use crate::types::address::Address;
use crate::types::encoding::DecodeError;
use shardchain_derive::Error;

/// Errors surfaced by account-store operations.
#[derive(Debug, Error)]
pub enum AccountStoreError {
    /// Underlying key/value or trie failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// Contract storage failure during delta application.
    #[error("contract storage error: {0}")]
    Contract(String),
    /// Malformed serialized store or delta.
    #[error("decode error: {0}")]
    Decode(String),
    /// Account lookup failed for the given address.
    #[error("no account exists for address {0}")]
    MissingAccount(Address),
    /// Debit would drive a balance negative.
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u128, need: u128 },
    /// Credit would exceed the maximum representable balance.
    #[error("balance overflow: adding {increment} to {current}")]
    BalanceOverflow { current: u128, increment: u128 },
}

impl From<StorageError> for AccountStoreError {
    fn from(value: StorageError) -> Self {
        AccountStoreError::Storage(value.to_string())
    }
}

impl From<ContractStorageError> for AccountStoreError {
    fn from(value: ContractStorageError) -> Self {
        AccountStoreError::Contract(value.to_string())
    }
}

impl From<DecodeError> for AccountStoreError {
    fn from(value: DecodeError) -> Self {
        AccountStoreError::Decode(value.to_string())
    }
}
