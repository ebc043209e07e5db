//! Core state-management engine of a sharded smart-contract chain node.
//!
//! Provides the authenticated account store, layered contract storage, and
//! the proof-of-work engine, plus the persistence and crypto primitives they
//! are built on.

pub mod account;
pub mod config;
pub mod contract;
pub mod crypto;
pub mod pow;
pub mod storage;
pub mod types;
pub mod utils;
