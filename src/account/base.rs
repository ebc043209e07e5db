//! Address-to-account map bound to the state trie.

use crate::account::AccountStoreError;
use crate::account::account::Account;
use crate::storage::trie::StateTrie;
use crate::types::address::Address;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use std::collections::HashMap;

/// The primary account map plus the trie that commits to it.
///
/// The map acts as a decode cache over the trie; every mutation that must be
/// reflected in the state root goes through [`AccountStoreBase::update_trie`]
/// or [`AccountStoreBase::remove_from_trie`].
pub struct AccountStoreBase {
    accounts: HashMap<Address, Account>,
    trie: StateTrie,
}

impl AccountStoreBase {
    pub fn new(trie: StateTrie) -> Self {
        Self {
            accounts: HashMap::new(),
            trie,
        }
    }

    /// Clears the cache and repoints the trie at the empty root.
    pub fn init(&mut self) {
        self.accounts.clear();
        self.trie.set_root(Hash::zero());
    }

    /// Drops the decode cache without touching the trie.
    pub fn clear_cache(&mut self) {
        self.accounts.clear();
    }

    pub fn trie(&self) -> &StateTrie {
        &self.trie
    }

    /// Iterates the cached accounts.
    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Fetches an account, caching trie hits in the map.
    pub fn get_account(&mut self, addr: &Address) -> Result<Option<Account>, AccountStoreError> {
        if let Some(account) = self.accounts.get(addr) {
            return Ok(Some(account.clone()));
        }
        match self.peek_trie(addr)? {
            Some(account) => {
                self.accounts.insert(*addr, account.clone());
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Fetches an account without populating the cache.
    pub fn peek_account(&self, addr: &Address) -> Result<Option<Account>, AccountStoreError> {
        if let Some(account) = self.accounts.get(addr) {
            return Ok(Some(account.clone()));
        }
        self.peek_trie(addr)
    }

    fn peek_trie(&self, addr: &Address) -> Result<Option<Account>, AccountStoreError> {
        match self.trie.get(addr.as_slice())? {
            Some(bytes) => Ok(Some(Account::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces an account in the map only.
    pub fn add_account(&mut self, addr: Address, account: Account) {
        self.accounts.insert(addr, account);
    }

    /// Removes an account from the map only.
    pub fn remove_account(&mut self, addr: &Address) {
        self.accounts.remove(addr);
    }

    /// Writes the account's encoding into the trie.
    pub fn update_trie(
        &mut self,
        addr: &Address,
        account: &Account,
    ) -> Result<(), AccountStoreError> {
        self.trie
            .put(addr.as_slice(), account.to_bytes().to_vec())?;
        Ok(())
    }

    /// Removes the account's entry from the trie.
    pub fn remove_from_trie(&mut self, addr: &Address) -> Result<(), AccountStoreError> {
        self.trie.remove(addr.as_slice())?;
        Ok(())
    }

    /// Returns the stored nonce, zero for unknown addresses.
    pub fn get_nonce(&mut self, addr: &Address) -> Result<u128, AccountStoreError> {
        Ok(self.get_account(addr)?.map(|a| a.nonce()).unwrap_or(0))
    }

    /// Returns the stored balance, zero for unknown addresses.
    pub fn get_balance(&mut self, addr: &Address) -> Result<u128, AccountStoreError> {
        Ok(self.get_account(addr)?.map(|a| a.balance()).unwrap_or(0))
    }

    /// Moves `amount` between two accounts, updating map and trie.
    pub fn transfer_balance(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<(), AccountStoreError> {
        let mut from_account = self
            .get_account(from)?
            .ok_or(AccountStoreError::MissingAccount(*from))?;
        if !from_account.decrease_balance(amount) {
            return Err(AccountStoreError::InsufficientBalance {
                have: from_account.balance(),
                need: amount,
            });
        }

        let mut to_account = self.get_account(to)?.unwrap_or_default();
        if !to_account.increase_balance(amount) {
            return Err(AccountStoreError::BalanceOverflow {
                current: to_account.balance(),
                increment: amount,
            });
        }

        self.add_account(*from, from_account.clone());
        self.update_trie(from, &from_account)?;
        self.add_account(*to, to_account.clone());
        self.update_trie(to, &to_account)?;
        Ok(())
    }

    /// Serializes the whole store as sorted `(address, account)` pairs.
    pub fn serialize(&self) -> Vec<u8> {
        let mut entries: Vec<(Address, Account)> = self
            .accounts
            .iter()
            .map(|(addr, account)| (*addr, account.clone()))
            .collect();
        entries.sort_by_key(|(addr, _)| *addr);
        entries.to_bytes().to_vec()
    }

    /// Rebuilds the store (map and trie) from serialized pairs.
    pub fn deserialize(&mut self, bytes: &[u8]) -> Result<(), AccountStoreError> {
        let entries = Vec::<(Address, Account)>::from_bytes(bytes)?;
        self.init();
        for (addr, account) in entries {
            self.update_trie(&addr, &account)?;
            self.add_account(addr, account);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::open_state_db;

    fn test_base() -> AccountStoreBase {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = open_state_db(&dir.keep()).expect("failed to open test db");
        AccountStoreBase::new(StateTrie::new(db))
    }

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[test]
    fn add_and_get_account() {
        let mut base = test_base();
        base.add_account(addr(1), Account::new(100, 0));
        assert_eq!(base.get_account(&addr(1)).unwrap().unwrap().balance(), 100);
        assert!(base.get_account(&addr(2)).unwrap().is_none());
    }

    #[test]
    fn trie_roundtrip_survives_cache_clear() {
        let mut base = test_base();
        let account = Account::new(55, 3);
        base.add_account(addr(1), account.clone());
        base.update_trie(&addr(1), &account).unwrap();

        base.clear_cache();
        let restored = base.get_account(&addr(1)).unwrap().unwrap();
        assert_eq!(restored, account);
    }

    #[test]
    fn root_tracks_account_set() {
        let mut base = test_base();
        let empty = base.trie().root();

        base.update_trie(&addr(1), &Account::new(1, 0)).unwrap();
        let one = base.trie().root();
        assert_ne!(empty, one);

        base.remove_from_trie(&addr(1)).unwrap();
        assert_ne!(base.trie().root(), one);
        assert!(base.get_account(&addr(1)).unwrap().is_none());
    }

    #[test]
    fn transfer_balance_moves_funds() {
        let mut base = test_base();
        base.add_account(addr(1), Account::new(100, 0));
        base.update_trie(&addr(1), &Account::new(100, 0)).unwrap();

        base.transfer_balance(&addr(1), &addr(2), 30).unwrap();
        assert_eq!(base.get_balance(&addr(1)).unwrap(), 70);
        assert_eq!(base.get_balance(&addr(2)).unwrap(), 30);
    }

    #[test]
    fn transfer_rejects_overdraft() {
        let mut base = test_base();
        base.add_account(addr(1), Account::new(10, 0));

        let err = base.transfer_balance(&addr(1), &addr(2), 30).unwrap_err();
        assert!(matches!(err, AccountStoreError::InsufficientBalance { .. }));
        assert_eq!(base.get_balance(&addr(1)).unwrap(), 10);
    }

    #[test]
    fn transfer_from_missing_account_fails() {
        let mut base = test_base();
        let err = base.transfer_balance(&addr(9), &addr(2), 1).unwrap_err();
        assert!(matches!(err, AccountStoreError::MissingAccount(_)));
    }

    #[test]
    fn serialize_deserialize_identity() {
        let mut base = test_base();
        for i in 1..=3u8 {
            let account = Account::new(i as u128 * 10, i as u128);
            base.add_account(addr(i), account.clone());
            base.update_trie(&addr(i), &account).unwrap();
        }
        let root = base.trie().root();
        let serialized = base.serialize();

        let mut restored = test_base();
        restored.deserialize(&serialized).unwrap();
        assert_eq!(restored.trie().root(), root);
        assert_eq!(restored.serialize(), serialized);
    }

    #[test]
    fn nonce_defaults_to_zero() {
        let mut base = test_base();
        assert_eq!(base.get_nonce(&addr(7)).unwrap(), 0);
    }
}
