//! 20-byte account addresses.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use std::fmt;

/// Address length in bytes.
pub const ADDRESS_SIZE: usize = 20;

/// Fixed-size 20-byte address identifying an account.
///
/// Derived from public keys via SHA3-256 hashing, taking the last 20 bytes.
/// This type is `Copy` for efficient passing in validation and lookup operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    /// Creates a zero-valued address (all bytes are 0x00).
    ///
    /// Used as the recipient sentinel for contract-creation transactions.
    pub const fn zero() -> Address {
        Address([0u8; ADDRESS_SIZE])
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Returns the address as a byte slice.
    pub const fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Creates an address from a byte slice.
    ///
    /// Returns `None` if the slice length is not exactly [`ADDRESS_SIZE`] bytes.
    pub fn from_slice(slice: &[u8]) -> Option<Address> {
        if slice.len() != ADDRESS_SIZE {
            return None;
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(slice);
        Some(Address(bytes))
    }

    /// Returns the lowercase hex rendering used as a storage-key prefix.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

impl Encode for Address {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&self.0);
    }
}

impl Decode for Address {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let bytes = <[u8; ADDRESS_SIZE]>::decode(input)?;
        Ok(Address(bytes))
    }
}
