//! Account records persisted in the state trie.

use crate::types::bytes::Bytes;
use crate::types::hash::Hash;
use shardchain_derive::BinaryCodec;

/// Canonical representation of account state persisted in the state trie.
///
/// All fields are encoded deterministically for hashing and delta exchange.
/// An account is a contract iff its code is non-empty.
#[derive(BinaryCodec, Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Spendable balance denominated in the native currency.
    balance: u128,
    /// Monotonic counter of successful transactions from this account.
    nonce: u128,
    /// Deployed contract code; empty for externally owned accounts.
    code: Bytes,
    /// Immutable contract initialization data.
    init_data: Bytes,
    /// Hash of the contract's field state; zero for accounts without storage.
    storage_root: Hash,
}

impl Account {
    /// Creates an account with the given balance and nonce.
    pub fn new(balance: u128, nonce: u128) -> Self {
        Self {
            balance,
            nonce,
            ..Default::default()
        }
    }

    /// Returns the account's current balance.
    pub fn balance(&self) -> u128 {
        self.balance
    }

    /// Returns the account's current nonce.
    pub fn nonce(&self) -> u128 {
        self.nonce
    }

    /// Returns the deployed contract code.
    pub fn code(&self) -> &Bytes {
        &self.code
    }

    /// Returns the contract initialization data.
    pub fn init_data(&self) -> &Bytes {
        &self.init_data
    }

    /// Returns the contract storage commitment.
    pub fn storage_root(&self) -> Hash {
        self.storage_root
    }

    /// Returns true if this account holds contract code.
    pub fn is_contract(&self) -> bool {
        !self.code.is_empty()
    }

    /// Installs contract code and init data (deploy path).
    pub fn set_contract(&mut self, code: Bytes, init_data: Bytes) {
        self.code = code;
        self.init_data = init_data;
    }

    /// Updates the contract storage commitment.
    pub fn set_storage_root(&mut self, root: Hash) {
        self.storage_root = root;
    }

    /// Credits the balance; `false` on overflow.
    pub fn increase_balance(&mut self, delta: u128) -> bool {
        match self.balance.checked_add(delta) {
            Some(balance) => {
                self.balance = balance;
                true
            }
            None => false,
        }
    }

    /// Debits the balance; `false` if funds are insufficient.
    pub fn decrease_balance(&mut self, delta: u128) -> bool {
        match self.balance.checked_sub(delta) {
            Some(balance) => {
                self.balance = balance;
                true
            }
            None => false,
        }
    }

    /// Bumps the nonce after a successfully applied transaction.
    pub fn increase_nonce(&mut self) {
        self.nonce = self.nonce.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};

    #[test]
    fn new_creates_eoa() {
        let account = Account::new(1_000_000, 0);
        assert_eq!(account.balance(), 1_000_000);
        assert_eq!(account.nonce(), 0);
        assert!(!account.is_contract());
        assert_eq!(account.storage_root(), Hash::zero());
    }

    #[test]
    fn set_contract_makes_contract() {
        let mut account = Account::new(0, 0);
        account.set_contract(Bytes::new(b"code"), Bytes::new(b"init"));
        assert!(account.is_contract());
        assert_eq!(account.code().as_slice(), b"code");
        assert_eq!(account.init_data().as_slice(), b"init");
    }

    #[test]
    fn balance_arithmetic_is_checked() {
        let mut account = Account::new(10, 0);
        assert!(account.increase_balance(5));
        assert_eq!(account.balance(), 15);

        assert!(!account.decrease_balance(100));
        assert_eq!(account.balance(), 15);

        assert!(account.decrease_balance(15));
        assert_eq!(account.balance(), 0);

        let mut maxed = Account::new(u128::MAX, 0);
        assert!(!maxed.increase_balance(1));
    }

    #[test]
    fn nonce_increments() {
        let mut account = Account::new(0, 7);
        account.increase_nonce();
        assert_eq!(account.nonce(), 8);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut account = Account::new(123_456_789, 42);
        account.set_contract(Bytes::new(b"(* c *)"), Bytes::new(b"[]"));
        account.set_storage_root(Hash([9u8; 32]));

        let encoded = account.to_bytes();
        let decoded = Account::from_bytes(&encoded).expect("decode");
        assert_eq!(decoded, account);
    }
}
