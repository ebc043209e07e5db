//! The orchestrating account store.
//!
//! Ties the base store (map + trie), the temp store, contract storage, and
//! persistence together behind one service handle. Lock discipline:
//! `primary` (reader/writer) guards the map-and-trie view, `delta` guards
//! the temp store and the serialized delta buffer, `revertibles` guards the
//! undo records, `db` guards persistence flushes. Multi-lock operations
//! always acquire in the order primary, then delta / revertibles / db.

use crate::account::AccountStoreError;
use crate::account::account::Account;
use crate::account::base::AccountStoreBase;
use crate::account::delta::StateDelta;
use crate::account::receipt::{TransactionReceipt, TxnStatus};
use crate::account::temp::AccountStoreTemp;
use crate::account::transaction::Transaction;
use crate::contract::ipc::ExecClient;
use crate::contract::storage::{ContractStorage, UNKNOWN_SHARD_ID};
use crate::storage::kv::{CF_META, CF_TEMP_STATE, CF_TRIE, KvStore};
use crate::storage::trie::StateTrie;
use crate::types::address::Address;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::{info, warn};
use rocksdb::DB;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

/// Meta key the current state root is persisted under.
const STATE_ROOT_KEY: &str = "StateRoot";
/// Pre-upgrade installations kept the root under the metadata namespace.
const LEGACY_STATE_ROOT_KEY: &str = "Metadata:STATEROOT";

struct DeltaBuf {
    temp: AccountStoreTemp,
    serialized: Vec<u8>,
}

#[derive(Default)]
struct Revertibles {
    changed: HashMap<Address, Account>,
    created: HashSet<Address>,
}

/// Process-wide account store service.
///
/// Constructed once and passed around as a handle; nothing here is a hidden
/// static, which keeps tests able to build as many stores as they like.
pub struct AccountStore {
    primary: RwLock<AccountStoreBase>,
    delta: Mutex<DeltaBuf>,
    revertibles: Mutex<Revertibles>,
    db: Mutex<KvStore>,
    temp_state_db: Mutex<KvStore>,
    trie_db: KvStore,
    contract_storage: Arc<ContractStorage>,
    exec: Option<Arc<ExecClient>>,
}

impl AccountStore {
    /// Builds the account store over the shared database handle.
    pub fn new(db: Arc<DB>, exec: Option<Arc<ExecClient>>) -> Self {
        let contract_storage = Arc::new(ContractStorage::new(Arc::clone(&db), exec.clone()));
        Self {
            primary: RwLock::new(AccountStoreBase::new(StateTrie::new(Arc::clone(&db)))),
            delta: Mutex::new(DeltaBuf {
                temp: AccountStoreTemp::new(),
                serialized: Vec::new(),
            }),
            revertibles: Mutex::new(Revertibles::default()),
            db: Mutex::new(KvStore::new(Arc::clone(&db), CF_META)),
            temp_state_db: Mutex::new(KvStore::new(Arc::clone(&db), CF_TEMP_STATE)),
            trie_db: KvStore::new(db, CF_TRIE),
            contract_storage,
            exec,
        }
    }

    /// The contract storage this store commits through.
    pub fn contract_storage(&self) -> &Arc<ContractStorage> {
        &self.contract_storage
    }

    // ==================== Initialization ====================

    /// Full wipe: soft init plus reset of the trie database and contract
    /// storage.
    pub fn init(&self) -> Result<(), AccountStoreError> {
        self.init_soft()?;

        let _db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        self.contract_storage.reset()?;
        self.trie_db.reset()?;
        Ok(())
    }

    /// Clears in-memory maps, the temp store, and the revertibles; keeps the
    /// on-disk databases.
    pub fn init_soft(&self) -> Result<(), AccountStoreError> {
        {
            let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
            base.init();
        }
        self.init_revertibles();
        self.init_temp();
        Ok(())
    }

    /// Clears the temp store, the serialized delta buffer, and the contract
    /// storage temp tier.
    pub fn init_temp(&self) {
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());
        delta.temp.init();
        delta.serialized.clear();

        self.contract_storage.init_temp_state();
    }

    /// Clears the account undo records and the contract storage revert
    /// journal.
    pub fn init_revertibles(&self) {
        let mut revs = self.revertibles.lock().unwrap_or_else(|e| e.into_inner());
        revs.changed.clear();
        revs.created.clear();

        self.contract_storage.init_revertibles();
    }

    /// Refreshes the trie and metadata databases back to empty.
    pub fn refresh_db(&self) -> Result<(), AccountStoreError> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.refresh()?;
        self.trie_db.refresh()?;
        Ok(())
    }

    // ==================== Reads ====================

    /// Fetches an account from the primary store.
    pub fn get_account(&self, addr: &Address) -> Result<Option<Account>, AccountStoreError> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        base.peek_account(addr)
    }

    /// Fetches an account, preferring the temp store.
    pub fn get_account_temp(&self, addr: &Address) -> Result<Option<Account>, AccountStoreError> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());
        delta.temp.get_account(&base, addr)
    }

    /// Returns the nonce from the temp store if the address was touched
    /// there, the primary store otherwise.
    pub fn get_nonce_temp(&self, addr: &Address) -> Result<u128, AccountStoreError> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());
        if delta.temp.contains(addr) {
            return delta.temp.get_nonce(&base, addr);
        }
        Ok(base.peek_account(addr)?.map(|a| a.nonce()).unwrap_or(0))
    }

    /// Current state trie root.
    pub fn state_root(&self) -> Hash {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        base.trie().root()
    }

    // ==================== Transaction application ====================

    /// Applies a transaction to the temp store.
    #[allow(clippy::too_many_arguments)]
    pub fn update_accounts_temp(
        &self,
        block_num: u64,
        num_shards: u32,
        is_ds: bool,
        tx: &Transaction,
        receipt: &mut TransactionReceipt,
        error_code: &mut TxnStatus,
    ) -> Result<bool, AccountStoreError> {
        let base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());
        delta.temp.update_accounts(
            &base,
            &self.contract_storage,
            self.exec.as_deref(),
            block_num,
            num_shards,
            is_ds,
            tx,
            receipt,
            error_code,
        )
    }

    /// Credits a block reward to `rewardee` inside the temp store.
    pub fn update_coinbase_temp(
        &self,
        rewardee: &Address,
        genesis: &Address,
        amount: u128,
    ) -> Result<(), AccountStoreError> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());
        if delta.temp.get_account(&base, rewardee)?.is_none() {
            delta.temp.add_account(*rewardee, Account::new(0, 0));
        }
        delta.temp.transfer_balance(&base, genesis, rewardee, amount)
    }

    // ==================== Delta lifecycle ====================

    /// Serializes `(temp − base)` into the delta buffer.
    pub fn serialize_delta(&self) -> Result<(), AccountStoreError> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());

        let state_delta = StateDelta::build(&delta.temp, &base, &self.contract_storage)?;
        delta.serialized = Encode::to_bytes(&state_delta).to_vec();
        Ok(())
    }

    /// Copies out the serialized delta buffer.
    pub fn get_serialized_delta(&self) -> Vec<u8> {
        self.delta
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .serialized
            .clone()
    }

    /// SHA-256 of the serialized delta; an all-zero buffer hashes to zero.
    pub fn get_state_delta_hash(&self) -> Hash {
        let delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());

        let is_empty = delta.serialized.iter().all(|&b| b == 0);
        if is_empty {
            return Hash::zero();
        }
        Hash::sha256().chain(&delta.serialized).finalize()
    }

    /// Applies a serialized delta to the primary store.
    ///
    /// With `revertible`, prior account values and created addresses are
    /// recorded so [`AccountStore::revert_commit_temp`] can undo the whole
    /// application.
    pub fn deserialize_delta(
        &self,
        bytes: &[u8],
        revertible: bool,
    ) -> Result<(), AccountStoreError> {
        let state_delta = StateDelta::from_bytes(bytes)?;

        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let mut revs = if revertible {
            Some(self.revertibles.lock().unwrap_or_else(|e| e.into_inner()))
        } else {
            None
        };

        for entry in &state_delta.entries {
            if let Some(revs) = revs.as_mut() {
                match base.peek_account(&entry.addr)? {
                    Some(prior) => {
                        revs.changed.entry(entry.addr).or_insert(prior);
                    }
                    None => {
                        revs.created.insert(entry.addr);
                    }
                }
            }

            let mut account = entry.account.clone();
            if !entry.states.is_empty() || !entry.deleted.is_empty() {
                let states: BTreeMap<String, Vec<u8>> = entry.states.iter().cloned().collect();
                let state_hash = self.contract_storage.update_state_datas_and_to_deletes(
                    &entry.addr,
                    &states,
                    &entry.deleted,
                    false,
                    revertible,
                    UNKNOWN_SHARD_ID,
                    UNKNOWN_SHARD_ID,
                )?;
                account.set_storage_root(state_hash);
            }

            base.update_trie(&entry.addr, &account)?;
            base.add_account(entry.addr, account);
        }
        Ok(())
    }

    /// Applies a serialized delta into the temp store via the sharded-merge
    /// path of contract storage.
    pub fn deserialize_delta_temp(
        &self,
        bytes: &[u8],
        shard_id: u32,
        num_shards: u32,
    ) -> Result<(), AccountStoreError> {
        let state_delta = StateDelta::from_bytes(bytes)?;

        let mut delta = self.delta.lock().unwrap_or_else(|e| e.into_inner());

        for entry in &state_delta.entries {
            if !entry.states.is_empty() || !entry.deleted.is_empty() {
                let states: BTreeMap<String, Vec<u8>> = entry.states.iter().cloned().collect();
                self.contract_storage.update_state_datas_and_to_deletes(
                    &entry.addr,
                    &states,
                    &entry.deleted,
                    true,
                    false,
                    shard_id,
                    num_shards,
                )?;
            }
            delta.temp.add_account(entry.addr, entry.account.clone());
        }
        Ok(())
    }

    /// Commits the buffered delta into the primary store.
    pub fn commit_temp(&self) -> Result<(), AccountStoreError> {
        let serialized = self.get_serialized_delta();
        if serialized.is_empty() {
            return Ok(());
        }
        self.deserialize_delta(&serialized, false)
    }

    /// Commits the buffered delta revertibly.
    pub fn commit_temp_revertible(&self) -> Result<(), AccountStoreError> {
        self.init_revertibles();

        let serialized = self.get_serialized_delta();
        if serialized.is_empty() {
            return Ok(());
        }
        self.deserialize_delta(&serialized, true)
    }

    /// Undoes the last revertible commit: restores changed accounts, removes
    /// created ones, and replays the contract storage revert journal.
    pub fn revert_commit_temp(&self) -> Result<(), AccountStoreError> {
        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let mut revs = self.revertibles.lock().unwrap_or_else(|e| e.into_inner());

        for (addr, account) in revs.changed.drain() {
            base.update_trie(&addr, &account)?;
            base.add_account(addr, account);
        }
        for addr in revs.created.drain() {
            base.remove_account(&addr);
            base.remove_from_trie(&addr)?;
        }

        self.contract_storage.revert_contract_states();
        Ok(())
    }

    // ==================== Persistence ====================

    /// Persists new contract code/init-data, flushes contract state and the
    /// trie, records the new root, and drops the in-memory account cache.
    pub fn move_updates_to_disk(&self) -> Result<(), AccountStoreError> {
        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());

        let mut code_batch: Vec<(String, Vec<u8>)> = Vec::new();
        let mut init_batch: Vec<(String, Vec<u8>)> = Vec::new();
        for (addr, account) in base.accounts() {
            if !account.is_contract() {
                continue;
            }
            if self.contract_storage.get_contract_code(addr)?.is_none() {
                code_batch.push((addr.hex(), account.code().to_vec()));
            }
            if self.contract_storage.get_init_data(addr)?.is_none() {
                init_batch.push((addr.hex(), account.init_data().to_vec()));
            }
        }

        self.contract_storage.put_contract_code_batch(&code_batch)?;
        self.contract_storage.put_init_data_batch(&init_batch)?;

        if let Err(e) = self.contract_storage.commit_state_db() {
            warn!("contract state commit failed, rolling back inserted code keys: {e}");
            for (hex_addr, _) in &code_batch {
                if let Some(addr) = Address::from_slice(&hex::decode(hex_addr).unwrap_or_default())
                    && let Err(e) = self.contract_storage.delete_contract_code(&addr)
                {
                    warn!("failed to delete contract code for {addr}: {e}");
                }
            }
            return Err(e.into());
        }

        if let Err(e) = base.trie().commit() {
            warn!("trie commit failed: {e}");
        }
        let root = base.trie().root();
        db.insert(STATE_ROOT_KEY, root.as_slice())?;

        base.clear_cache();
        Ok(())
    }

    /// Discards uncommitted trie nodes and repoints at the last committed
    /// root.
    pub fn discard_unsaved_updates(&self) {
        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let _db = self.db.lock().unwrap_or_else(|e| e.into_inner());

        base.trie().rollback();
        let prev = base.trie().prev_root();
        base.trie().set_root(prev);
        base.clear_cache();
    }

    /// Soft-inits and repoints the trie at the root persisted on disk,
    /// upgrading from the legacy metadata key when necessary.
    pub fn retrieve_from_disk(&self) -> Result<(), AccountStoreError> {
        self.init_soft()?;

        let base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());

        let root_bytes = match db.lookup(STATE_ROOT_KEY)? {
            Some(bytes) => bytes,
            None => match db.lookup(LEGACY_STATE_ROOT_KEY)? {
                Some(bytes) => {
                    // Lookup with a new binary recovering from an old
                    // database: upgrade the key in place.
                    db.insert(STATE_ROOT_KEY, &bytes)?;
                    bytes
                }
                None => {
                    warn!("failed to retrieve state root from disk");
                    return Err(crate::storage::kv::StorageError::MissingStateRoot.into());
                }
            },
        };

        let root = Hash::from_slice(&root_bytes)
            .ok_or(crate::storage::kv::StorageError::InvalidStateRoot)?;
        info!("state root from disk: {root}");
        base.trie().set_root(root);
        Ok(())
    }

    /// Replays the temporary account-state spill into the trie, then clears
    /// it. An empty spill is a successful no-op.
    pub fn update_state_trie_from_temp_state_db(&self) -> Result<(), AccountStoreError> {
        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        let spill = self.temp_state_db.lock().unwrap_or_else(|e| e.into_inner());

        let entries = spill.scan_prefix("")?;
        for (hex_addr, bytes) in &entries {
            let Some(addr) = Address::from_slice(&hex::decode(hex_addr).unwrap_or_default())
            else {
                warn!("skipping malformed spill key {hex_addr:?}");
                continue;
            };
            let account = Account::from_bytes(bytes)?;
            base.update_trie(&addr, &account)?;
            base.add_account(addr, account);
        }

        spill.reset()?;
        Ok(())
    }

    // ==================== Whole-store serialization ====================

    /// Serializes the primary store.
    pub fn serialize(&self) -> Vec<u8> {
        let base = self.primary.read().unwrap_or_else(|e| e.into_inner());
        base.serialize()
    }

    /// Wipes and rebuilds the primary store from serialized bytes.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<(), AccountStoreError> {
        self.init()?;
        let mut base = self.primary.write().unwrap_or_else(|e| e.into_inner());
        base.deserialize(bytes)
    }
}
