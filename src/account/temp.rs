//! Transactional working set above the base account store.

use crate::account::AccountStoreError;
use crate::account::account::Account;
use crate::account::base::AccountStoreBase;
use crate::account::receipt::{TransactionReceipt, TxnStatus};
use crate::account::transaction::{
    CONTRACT_CREATE_GAS, CONTRACT_INVOKE_GAS, NORMAL_TRAN_GAS, Transaction, TxnKind,
    contract_address,
};
use crate::contract::ipc::ExecClient;
use crate::contract::storage::{ContractStorage, UNKNOWN_SHARD_ID, address_shard_index};
use crate::contract::value::{StorageQuery, StorageValue};
use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::warn;
use serde_json::{Value, json};
use std::collections::HashMap;

/// Working address-to-account map capturing uncommitted transaction effects.
///
/// Reads fall through to the base store (passed as an explicit handle, never
/// held); writes stay here until the delta is serialized and committed.
#[derive(Default)]
pub struct AccountStoreTemp {
    accounts: HashMap<Address, Account>,
}

impl AccountStoreTemp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every uncommitted account.
    pub fn init(&mut self) {
        self.accounts.clear();
    }

    /// Iterates the working set.
    pub fn accounts(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Fetches an account, falling through to the base store.
    pub fn get_account(
        &mut self,
        base: &AccountStoreBase,
        addr: &Address,
    ) -> Result<Option<Account>, AccountStoreError> {
        if let Some(account) = self.accounts.get(addr) {
            return Ok(Some(account.clone()));
        }
        match base.peek_account(addr)? {
            Some(account) => {
                self.accounts.insert(*addr, account.clone());
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    /// Returns whether `addr` is present in the working set itself.
    pub fn contains(&self, addr: &Address) -> bool {
        self.accounts.contains_key(addr)
    }

    /// Inserts or replaces a working-set account.
    pub fn add_account(&mut self, addr: Address, account: Account) {
        self.accounts.insert(addr, account);
    }

    /// Returns the working-set nonce, falling through to base.
    pub fn get_nonce(
        &mut self,
        base: &AccountStoreBase,
        addr: &Address,
    ) -> Result<u128, AccountStoreError> {
        Ok(self.get_account(base, addr)?.map(|a| a.nonce()).unwrap_or(0))
    }

    /// Moves `amount` between two working-set accounts.
    pub fn transfer_balance(
        &mut self,
        base: &AccountStoreBase,
        from: &Address,
        to: &Address,
        amount: u128,
    ) -> Result<(), AccountStoreError> {
        let mut from_account = self
            .get_account(base, from)?
            .ok_or(AccountStoreError::MissingAccount(*from))?;
        if !from_account.decrease_balance(amount) {
            return Err(AccountStoreError::InsufficientBalance {
                have: from_account.balance(),
                need: amount,
            });
        }
        let mut to_account = self.get_account(base, to)?.unwrap_or_default();
        if !to_account.increase_balance(amount) {
            return Err(AccountStoreError::BalanceOverflow {
                current: to_account.balance(),
                increment: amount,
            });
        }
        self.accounts.insert(*from, from_account);
        self.accounts.insert(*to, to_account);
        Ok(())
    }

    /// Applies one transaction against the working set.
    ///
    /// Validates nonce and gas funding, debits/credits balances, and for
    /// contract transactions drives the external executor, recording any
    /// storage writes through the contract storage temp tier. Returns `true`
    /// on success; on failure `error_code` says why and the working set is
    /// left untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn update_accounts(
        &mut self,
        base: &AccountStoreBase,
        contract_storage: &ContractStorage,
        exec: Option<&ExecClient>,
        block_num: u64,
        num_shards: u32,
        is_ds: bool,
        tx: &Transaction,
        receipt: &mut TransactionReceipt,
        error_code: &mut TxnStatus,
    ) -> Result<bool, AccountStoreError> {
        *error_code = TxnStatus::NotPresent;
        let sender_addr = tx.sender();
        let kind = tx.kind();

        // Contract work for another shard's contract belongs to the DS
        // committee, not here.
        if kind != TxnKind::Payment && num_shards != UNKNOWN_SHARD_ID && !is_ds {
            let from_shard = address_shard_index(&sender_addr, num_shards);
            let to_shard = match kind {
                TxnKind::DeployContract => from_shard,
                _ => address_shard_index(&tx.to_addr, num_shards),
            };
            if from_shard != to_shard {
                *error_code = TxnStatus::IncorrectShard;
                return Ok(false);
            }
        }

        let Some(mut sender) = self.get_account(base, &sender_addr)? else {
            *error_code = TxnStatus::InvalidFromAccount;
            return Ok(false);
        };

        let expected_nonce = sender.nonce() + 1;
        if tx.nonce > expected_nonce {
            *error_code = TxnStatus::HigherNonce;
            return Ok(false);
        }
        if tx.nonce < expected_nonce {
            *error_code = TxnStatus::LowerNonce;
            return Ok(false);
        }

        let min_gas = match kind {
            TxnKind::Payment => NORMAL_TRAN_GAS,
            TxnKind::CallContract => CONTRACT_INVOKE_GAS,
            TxnKind::DeployContract => CONTRACT_CREATE_GAS,
        };
        if tx.gas_limit < min_gas {
            *error_code = TxnStatus::InsufficientGasLimit;
            return Ok(false);
        }

        let Some(gas_deposit) = (tx.gas_limit as u128).checked_mul(tx.gas_price) else {
            *error_code = TxnStatus::MathError;
            return Ok(false);
        };
        let Some(required) = gas_deposit.checked_add(tx.amount) else {
            *error_code = TxnStatus::MathError;
            return Ok(false);
        };
        if sender.balance() < required {
            *error_code = TxnStatus::InsufficientBalance;
            return Ok(false);
        }

        match kind {
            TxnKind::Payment => {
                let gas_cost = NORMAL_TRAN_GAS as u128 * tx.gas_price;
                sender.decrease_balance(gas_cost + tx.amount);
                sender.increase_nonce();
                self.accounts.insert(sender_addr, sender);

                let mut recipient = self.get_account(base, &tx.to_addr)?.unwrap_or_default();
                if !recipient.increase_balance(tx.amount) {
                    *error_code = TxnStatus::MathError;
                    return Ok(false);
                }
                self.accounts.insert(tx.to_addr, recipient);

                receipt.set_result(true, NORMAL_TRAN_GAS);
                Ok(true)
            }
            TxnKind::DeployContract => self.deploy_contract(
                contract_storage,
                exec,
                block_num,
                tx,
                sender,
                receipt,
                error_code,
            ),
            TxnKind::CallContract => self.call_contract(
                base,
                contract_storage,
                exec,
                block_num,
                tx,
                sender,
                receipt,
                error_code,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deploy_contract(
        &mut self,
        contract_storage: &ContractStorage,
        exec: Option<&ExecClient>,
        block_num: u64,
        tx: &Transaction,
        mut sender: Account,
        receipt: &mut TransactionReceipt,
        error_code: &mut TxnStatus,
    ) -> Result<bool, AccountStoreError> {
        let sender_addr = tx.sender();
        let contract_addr = contract_address(&sender_addr, tx.nonce);

        let mut contract = Account::new(0, 0);
        contract.set_contract(tx.code.clone(), tx.data.clone());

        contract_storage.put_contract_code(&contract_addr, &tx.code)?;
        contract_storage.put_init_data(&contract_addr, &tx.data)?;

        // The checker provides the field depth schema and sharding metadata;
        // without an executor the contract deploys with empty schemas.
        let (depths, sharding) = match exec {
            Some(exec) => {
                let version = contract_storage
                    .interpreter_version(&contract_addr)
                    .unwrap_or(0);
                let check_req = json!({
                    "code": String::from_utf8_lossy(&tx.code),
                    "init": String::from_utf8_lossy(&tx.data),
                    "block_num": block_num.to_string(),
                });
                match exec.check_contract(version, &check_req) {
                    Ok(info) => (
                        info.get("contract_info")
                            .and_then(|i| i.get("fields_map_depth"))
                            .cloned()
                            .unwrap_or_else(|| json!({})),
                        info.get("contract_info")
                            .and_then(|i| i.get("sharding_info"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    ),
                    Err(e) => {
                        warn!("contract checker failed for {contract_addr}: {e}");
                        if let Err(e) = contract_storage.delete_contract_code(&contract_addr) {
                            warn!("failed to roll back code for {contract_addr}: {e}");
                        }
                        if let Err(e) = contract_storage.delete_init_data(&contract_addr) {
                            warn!("failed to roll back init data for {contract_addr}: {e}");
                        }
                        receipt.add_error(format!("checker failed: {e}"));
                        receipt.set_result(false, CONTRACT_CREATE_GAS);
                        *error_code = TxnStatus::FailedToInvokeContract;
                        return Ok(false);
                    }
                }
            }
            None => (json!({}), Value::Null),
        };
        contract_storage.put_fields_map_depth(&contract_addr, &depths);
        if !sharding.is_null() {
            contract_storage.put_sharding_info(&contract_addr, &sharding);
        }

        let gas_cost = CONTRACT_CREATE_GAS as u128 * tx.gas_price;
        sender.decrease_balance(gas_cost + tx.amount);
        sender.increase_nonce();
        contract.increase_balance(tx.amount);

        let state_hash = contract_storage.contract_state_hash(&contract_addr, true)?;
        contract.set_storage_root(state_hash);

        self.accounts.insert(sender_addr, sender);
        self.accounts.insert(contract_addr, contract);

        receipt.set_result(true, CONTRACT_CREATE_GAS);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn call_contract(
        &mut self,
        base: &AccountStoreBase,
        contract_storage: &ContractStorage,
        exec: Option<&ExecClient>,
        block_num: u64,
        tx: &Transaction,
        mut sender: Account,
        receipt: &mut TransactionReceipt,
        error_code: &mut TxnStatus,
    ) -> Result<bool, AccountStoreError> {
        let sender_addr = tx.sender();

        let Some(mut contract) = self.get_account(base, &tx.to_addr)? else {
            *error_code = TxnStatus::InvalidToAccount;
            return Ok(false);
        };
        if !contract.is_contract() {
            *error_code = TxnStatus::InvalidToAccount;
            return Ok(false);
        }

        let Some(exec) = exec else {
            *error_code = TxnStatus::FailedToInvokeContract;
            return Ok(false);
        };

        let version = contract_storage
            .interpreter_version(&tx.to_addr)
            .unwrap_or(0);
        let run_req = json!({
            "contract": tx.to_addr.hex(),
            "sender": sender_addr.hex(),
            "amount": tx.amount.to_string(),
            "gas_limit": tx.gas_limit,
            "block_num": block_num.to_string(),
            "message": String::from_utf8_lossy(&tx.data),
        });

        let response = match exec.run_contract(version, &run_req) {
            Ok(response) => response,
            Err(e) => {
                receipt.add_error(format!("executor failed: {e}"));
                *error_code = TxnStatus::FailedToInvokeContract;
                return Ok(false);
            }
        };

        let success = response["success"].as_bool().unwrap_or(false);
        let gas_remaining = response["gas_remaining"].as_u64().unwrap_or(0);
        let gas_used = tx.gas_limit.saturating_sub(gas_remaining).max(CONTRACT_INVOKE_GAS);

        if success {
            // Apply the interpreter's writes through the temp tier.
            if let Some(states) = response["states"].as_array() {
                for state in states {
                    let vname = state["vname"].as_str().unwrap_or_default();
                    let indices: Vec<String> = state["indices"]
                        .as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    let depth = state["depth"].as_u64().unwrap_or(0) as u32;
                    let value = state["value"].as_str().unwrap_or_default();

                    let query = StorageQuery {
                        name: vname.to_string(),
                        indices,
                        map_depth: depth,
                        ignore_val: false,
                    };
                    contract_storage.update_state_value(
                        &tx.to_addr,
                        &query,
                        &StorageValue::Bval(Bytes::new(value.as_bytes())),
                    )?;
                }
            }
            if let Some(events) = response["events"].as_array() {
                for event in events {
                    receipt.add_event(event.clone());
                }
            }
        }

        let gas_cost = gas_used as u128 * tx.gas_price;
        sender.decrease_balance(gas_cost);
        sender.increase_nonce();

        if success {
            sender.decrease_balance(tx.amount);
            contract.increase_balance(tx.amount);
            let state_hash = contract_storage.contract_state_hash(&tx.to_addr, true)?;
            contract.set_storage_root(state_hash);
            self.accounts.insert(tx.to_addr, contract);
        }
        self.accounts.insert(sender_addr, sender);

        receipt.set_result(success, gas_used);
        if !success {
            *error_code = TxnStatus::FailedToInvokeContract;
        }
        Ok(success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::base::AccountStoreBase;
    use crate::crypto::key_pair::PrivateKey;
    use crate::storage::kv::open_state_db;
    use crate::storage::trie::StateTrie;
    use std::sync::Arc;

    fn fixtures() -> (AccountStoreBase, ContractStorage, AccountStoreTemp) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = open_state_db(&dir.keep()).expect("failed to open test db");
        let base = AccountStoreBase::new(StateTrie::new(Arc::clone(&db)));
        let storage = ContractStorage::new(db, None);
        (base, storage, AccountStoreTemp::new())
    }

    fn fund(base: &mut AccountStoreBase, addr: Address, balance: u128) {
        let account = Account::new(balance, 0);
        base.add_account(addr, account.clone());
        base.update_trie(&addr, &account).unwrap();
    }

    #[test]
    fn payment_moves_funds_and_bumps_nonce() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let sender = key.public_key().address;
        fund(&mut base, sender, 10_000);

        let to = Address([9u8; 20]);
        let tx = Transaction::new(to, 100, 1, 100, 1, "", "", &key);
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();

        assert!(ok);
        assert!(receipt.success());
        assert_eq!(receipt.cum_gas(), NORMAL_TRAN_GAS);

        let sender_after = temp.get_account(&base, &sender).unwrap().unwrap();
        assert_eq!(sender_after.nonce(), 1);
        assert_eq!(
            sender_after.balance(),
            10_000 - 100 - NORMAL_TRAN_GAS as u128
        );
        let to_after = temp.get_account(&base, &to).unwrap().unwrap();
        assert_eq!(to_after.balance(), 100);

        // Base is untouched until the delta commits.
        assert_eq!(base.peek_account(&sender).unwrap().unwrap().balance(), 10_000);
    }

    #[test]
    fn nonce_gap_is_rejected() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        fund(&mut base, key.public_key().address, 10_000);

        let tx = Transaction::new(Address([9u8; 20]), 1, 1, 100, 5, "", "", &key);
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::HigherNonce);
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let sender = key.public_key().address;
        base.add_account(sender, Account::new(10_000, 3));

        let tx = Transaction::new(Address([9u8; 20]), 1, 1, 100, 3, "", "", &key);
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::LowerNonce);
    }

    #[test]
    fn unknown_sender_is_rejected() {
        let (base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let tx = Transaction::new(Address([9u8; 20]), 1, 1, 100, 1, "", "", &key);
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::InvalidFromAccount);
    }

    #[test]
    fn insufficient_balance_is_rejected() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        fund(&mut base, key.public_key().address, 10);

        let tx = Transaction::new(Address([9u8; 20]), 100, 1, 100, 1, "", "", &key);
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::InsufficientBalance);
    }

    #[test]
    fn deploy_without_executor_installs_empty_schema() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let sender = key.public_key().address;
        fund(&mut base, sender, 100_000);

        let tx = Transaction::new(
            Address::zero(),
            0,
            1,
            CONTRACT_CREATE_GAS,
            1,
            "(* contract *)",
            "[]",
            &key,
        );
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                true,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(ok);

        let contract_addr = contract_address(&sender, 1);
        let deployed = temp.get_account(&base, &contract_addr).unwrap().unwrap();
        assert!(deployed.is_contract());
        assert_eq!(
            storage.get_contract_code(&contract_addr).unwrap(),
            Some(b"(* contract *)".to_vec())
        );
        assert_eq!(
            storage.fetch_fields_map_depth(&contract_addr, true).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn call_without_executor_fails() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let sender = key.public_key().address;
        fund(&mut base, sender, 100_000);

        let contract_addr = Address([7u8; 20]);
        let mut contract = Account::new(0, 0);
        contract.set_contract(Bytes::new(b"code"), Bytes::new(b"[]"));
        base.add_account(contract_addr, contract.clone());
        base.update_trie(&contract_addr, &contract).unwrap();

        let tx = Transaction::new(
            contract_addr,
            0,
            1,
            CONTRACT_INVOKE_GAS,
            1,
            "",
            "{\"_tag\":\"f\"}",
            &key,
        );
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                UNKNOWN_SHARD_ID,
                true,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::FailedToInvokeContract);
    }

    #[test]
    fn cross_shard_contract_call_needs_ds() {
        let (mut base, storage, mut temp) = fixtures();
        let key = PrivateKey::new();
        let sender = key.public_key().address;
        fund(&mut base, sender, 100_000);

        // Pick a contract address guaranteed to land on a different shard.
        let mut target = sender;
        target.0[19] = target.0[19].wrapping_add(1);
        let num_shards = 2;
        if address_shard_index(&sender, num_shards) == address_shard_index(&target, num_shards) {
            target.0[19] = target.0[19].wrapping_add(1);
        }

        let tx = Transaction::new(
            target,
            0,
            1,
            CONTRACT_INVOKE_GAS,
            1,
            "",
            "{\"_tag\":\"f\"}",
            &key,
        );
        let mut receipt = TransactionReceipt::new(1);
        let mut status = TxnStatus::NotPresent;

        let ok = temp
            .update_accounts(
                &base,
                &storage,
                None,
                1,
                num_shards,
                false,
                &tx,
                &mut receipt,
                &mut status,
            )
            .unwrap();
        assert!(!ok);
        assert_eq!(status, TxnStatus::IncorrectShard);
    }
}
