//! Proof-of-work subsystem.
//!
//! - [`ethash`]: the memory-hard hash (epoch caches, dataset items,
//!   hashimoto) backing nonce search and verification
//! - [`miner`]: the engine dispatching light/full/device/remote nonce search
//! - [`remote`]: JSON-RPC client for the remote mining proxy

pub mod ethash;
pub mod miner;
pub mod remote;

use shardchain_derive::Error;

/// Errors surfaced by the proof-of-work engine.
#[derive(Debug, Error)]
pub enum PowError {
    /// Signing a proxy request failed.
    #[error("signature error: {0}")]
    Signature(String),
    /// Mining proxy call failed (transport or JSON-RPC error).
    #[error("mining proxy error: {0}")]
    Proxy(String),
    /// Proxy returned a malformed payload.
    #[error("invalid proxy response: {0}")]
    InvalidResponse(String),
}
