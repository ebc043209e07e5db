//! Transactions applied against the temp account store.

use crate::crypto::key_pair::{PrivateKey, PublicKey, SerializableSignature};
use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use shardchain_derive::BinaryCodec;

/// Gas charged for a plain payment.
pub const NORMAL_TRAN_GAS: u64 = 50;
/// Minimum gas limit for invoking a contract.
pub const CONTRACT_INVOKE_GAS: u64 = 100;
/// Minimum gas limit for deploying a contract.
pub const CONTRACT_CREATE_GAS: u64 = 500;

/// How a transaction is processed, derived from its payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    /// Native token transfer between accounts.
    Payment,
    /// Contract deployment: zero recipient and non-empty code.
    DeployContract,
    /// Invocation of an existing contract via its data payload.
    CallContract,
}

/// A signed transaction.
///
/// Uses `Bytes` for the code/data payloads - transactions are immutable
/// after creation and shared between the pool, the temp store, and receipts.
#[derive(Debug, Clone, PartialEq, Eq, BinaryCodec)]
pub struct Transaction {
    /// Sender's public key, also used for signature verification.
    pub from: PublicKey,
    /// Schnorr signature over the transaction's signing hash.
    pub signature: SerializableSignature,

    /// Recipient account; the zero address selects contract deployment.
    pub to_addr: Address,
    /// Native token amount to transfer to the recipient.
    pub amount: u128,
    /// Price per gas unit offered by the sender.
    pub gas_price: u128,
    /// Maximum gas the sender authorizes for execution.
    pub gas_limit: u64,
    /// Sender nonce; must be exactly one above the stored account nonce.
    pub nonce: u128,
    /// Contract code for deployments.
    pub code: Bytes,
    /// Call data for contract invocations.
    pub data: Bytes,
}

impl Transaction {
    /// Creates a new signed transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        to_addr: Address,
        amount: u128,
        gas_price: u128,
        gas_limit: u64,
        nonce: u128,
        code: impl Into<Bytes>,
        data: impl Into<Bytes>,
        key: &PrivateKey,
    ) -> Self {
        let code = code.into();
        let data = data.into();
        let from = key.public_key();

        let signing_hash = Self::signing_hash_from_parts(
            &from, &to_addr, amount, gas_price, gas_limit, nonce, &code, &data,
        );

        Transaction {
            from,
            signature: key.sign(signing_hash.as_slice()),
            to_addr,
            amount,
            gas_price,
            gas_limit,
            nonce,
            code,
            data,
        }
    }

    /// Returns the processing kind derived from the payload shape.
    pub fn kind(&self) -> TxnKind {
        if self.to_addr.is_zero() && !self.code.is_empty() {
            TxnKind::DeployContract
        } else if !self.data.is_empty() {
            TxnKind::CallContract
        } else {
            TxnKind::Payment
        }
    }

    /// Returns the unique transaction identifier.
    pub fn id(&self) -> Hash {
        let mut h = Hash::sha256();
        h.update(b"TXID");
        self.encode(&mut h);
        h.finalize()
    }

    /// Verifies the transaction signature against the sender's public key.
    pub fn verify(&self) -> bool {
        let hash = Self::signing_hash_from_parts(
            &self.from,
            &self.to_addr,
            self.amount,
            self.gas_price,
            self.gas_limit,
            self.nonce,
            &self.code,
            &self.data,
        );
        self.from.verify(hash.as_slice(), self.signature)
    }

    /// Sender address shorthand.
    pub fn sender(&self) -> Address {
        self.from.address
    }

    #[allow(clippy::too_many_arguments)]
    fn signing_hash_from_parts(
        from: &PublicKey,
        to_addr: &Address,
        amount: u128,
        gas_price: u128,
        gas_limit: u64,
        nonce: u128,
        code: &Bytes,
        data: &Bytes,
    ) -> Hash {
        let mut buf = Hash::sha256();
        buf.update(b"TX");
        from.encode(&mut buf);
        to_addr.encode(&mut buf);
        amount.encode(&mut buf);
        gas_price.encode(&mut buf);
        gas_limit.encode(&mut buf);
        nonce.encode(&mut buf);
        code.encode(&mut buf);
        data.encode(&mut buf);
        buf.finalize()
    }
}

/// Derives the address a deployment lands on: SHA-256 over the sender
/// address and nonce, last 20 bytes.
pub fn contract_address(sender: &Address, nonce: u128) -> Address {
    let mut h = Hash::sha256();
    h.update(sender.as_slice());
    nonce.encode(&mut h);
    let full = h.finalize();
    Address::from_slice(&full.as_slice()[12..]).expect("20-byte tail of a 32-byte hash")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Decode;

    fn payment(key: &PrivateKey, nonce: u128) -> Transaction {
        Transaction::new(Address([2u8; 20]), 100, 1, 100, nonce, "", "", key)
    }

    #[test]
    fn payment_kind_and_verify() {
        let key = PrivateKey::new();
        let tx = payment(&key, 1);
        assert_eq!(tx.kind(), TxnKind::Payment);
        assert!(tx.verify());
    }

    #[test]
    fn deploy_kind_requires_zero_recipient() {
        let key = PrivateKey::new();
        let tx = Transaction::new(Address::zero(), 0, 1, 600, 1, "code", "", &key);
        assert_eq!(tx.kind(), TxnKind::DeployContract);
    }

    #[test]
    fn call_kind_from_data_payload() {
        let key = PrivateKey::new();
        let tx = Transaction::new(Address([2u8; 20]), 0, 1, 200, 1, "", "{\"_tag\":\"f\"}", &key);
        assert_eq!(tx.kind(), TxnKind::CallContract);
    }

    #[test]
    fn verify_fails_on_tampered_amount() {
        let key = PrivateKey::new();
        let mut tx = payment(&key, 1);
        tx.amount += 1;
        assert!(!tx.verify());
    }

    #[test]
    fn serialize_deserialize_roundtrip() {
        let key = PrivateKey::new();
        let tx = payment(&key, 3);
        let encoded = tx.to_bytes();
        let decoded = Transaction::from_bytes(&encoded).expect("decode");
        assert_eq!(decoded, tx);
        assert!(decoded.verify());
    }

    #[test]
    fn id_is_deterministic() {
        let key = PrivateKey::new();
        let tx = payment(&key, 1);
        assert_eq!(tx.id(), tx.id());
    }

    #[test]
    fn contract_address_depends_on_sender_and_nonce() {
        let a = Address([1u8; 20]);
        let b = Address([2u8; 20]);
        assert_eq!(contract_address(&a, 1), contract_address(&a, 1));
        assert_ne!(contract_address(&a, 1), contract_address(&a, 2));
        assert_ne!(contract_address(&a, 1), contract_address(&b, 1));
    }
}
