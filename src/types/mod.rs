//! Core type definitions for the state engine.
//!
//! This module provides the fundamental types used throughout the crate:
//! - [`hash::Hash`]: fixed-size 32-byte digests (SHA-256 for protocol hashes)
//! - [`address::Address`]: 20-byte account identifiers
//! - [`bytes::Bytes`]: reference-counted byte buffers
//! - [`encoding`]: deterministic binary serialization traits

pub mod address;
pub mod bytes;
pub mod encoding;
pub mod hash;
