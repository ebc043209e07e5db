//! Layered key/value store for contract code, init-data, and field state.
//!
//! State data lives in three tiers with most-recent-first precedence:
//! the temporary overlay (`t_state`/`t_deleted`, uncommitted transaction
//! effects), the committed overlay (`m_state`/`m_deleted`, finalized but not
//! yet flushed), and the persistent store. A key tombstoned in `t_deleted`
//! is hidden everywhere unless re-written in `t_state`; a key in `m_deleted`
//! is hidden from the committed tier and disk unless shadowed by `t_state`.
//!
//! Two more buffers support recovery: a single-slot snapshot
//! (`p_state`/`p_deleted`) swapped back by [`ContractStorage::revert_prev_state`],
//! and a revert journal (`r_state`/`r_deleted`) replayed by
//! [`ContractStorage::revert_contract_states`] to undo a revertible commit.

use crate::contract::ContractStorageError;
use crate::contract::ipc::ExecClient;
use crate::contract::value::{
    INDEX_SEPARATOR, StorageQuery, StorageValue, is_reserved_vname, storage_key,
};
use crate::types::address::Address;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::storage::kv::{CF_CODE, CF_INIT_DATA, CF_STATE_DATA, KvStore};
use crate::{fatal, warn};
use rocksdb::DB;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shard id sentinel meaning "not a sharded contribution".
pub const UNKNOWN_SHARD_ID: u32 = u32::MAX;

/// All state-tier maps live behind one mutex; prefix scans and the state
/// hash depend on their ordered iteration.
#[derive(Default)]
struct StateTiers {
    m_state: BTreeMap<String, Vec<u8>>,
    m_deleted: BTreeSet<String>,
    t_state: BTreeMap<String, Vec<u8>>,
    t_deleted: BTreeSet<String>,
    p_state: BTreeMap<String, Vec<u8>>,
    p_deleted: BTreeSet<String>,
    r_state: BTreeMap<String, Vec<u8>>,
    r_deleted: BTreeMap<String, bool>,
}

struct StateData {
    db: KvStore,
    tiers: StateTiers,
}

/// Layered contract storage over code, init-data, and state databases.
pub struct ContractStorage {
    code: Mutex<KvStore>,
    init_data: Mutex<KvStore>,
    state: Mutex<StateData>,
    exec: Option<Arc<ExecClient>>,
}

impl ContractStorage {
    /// Builds contract storage over the shared database handle.
    ///
    /// `exec` is the executor used for sharded merges; without it, sharded
    /// contributions fall back to plain temp overwrites.
    pub fn new(db: Arc<DB>, exec: Option<Arc<ExecClient>>) -> Self {
        Self {
            code: Mutex::new(KvStore::new(Arc::clone(&db), CF_CODE)),
            init_data: Mutex::new(KvStore::new(Arc::clone(&db), CF_INIT_DATA)),
            state: Mutex::new(StateData {
                db: KvStore::new(db, CF_STATE_DATA),
                tiers: StateTiers::default(),
            }),
            exec,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StateData> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Code
    // ======================================

    pub fn put_contract_code(&self, addr: &Address, code: &[u8]) -> Result<(), ContractStorageError> {
        let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.insert(&addr.hex(), code)?)
    }

    pub fn put_contract_code_batch(
        &self,
        batch: &[(String, Vec<u8>)],
    ) -> Result<(), ContractStorageError> {
        let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.batch_insert(batch)?)
    }

    pub fn get_contract_code(&self, addr: &Address) -> Result<Option<Vec<u8>>, ContractStorageError> {
        let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.lookup(&addr.hex())?)
    }

    pub fn delete_contract_code(&self, addr: &Address) -> Result<(), ContractStorageError> {
        let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.delete(&addr.hex())?)
    }

    // InitData
    // ========================================

    pub fn put_init_data(&self, addr: &Address, init_data: &[u8]) -> Result<(), ContractStorageError> {
        let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.insert(&addr.hex(), init_data)?)
    }

    pub fn put_init_data_batch(
        &self,
        batch: &[(String, Vec<u8>)],
    ) -> Result<(), ContractStorageError> {
        let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.batch_insert(batch)?)
    }

    pub fn get_init_data(&self, addr: &Address) -> Result<Option<Vec<u8>>, ContractStorageError> {
        let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.lookup(&addr.hex())?)
    }

    pub fn delete_init_data(&self, addr: &Address) -> Result<(), ContractStorageError> {
        let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(db.delete(&addr.hex())?)
    }

    /// Reads the interpreter version a contract was deployed with from its
    /// init-data JSON (`[{"vname": "_scilla_version", "value": ...}, ...]`).
    pub fn interpreter_version(&self, addr: &Address) -> Result<u32, ContractStorageError> {
        let raw = self.get_init_data(addr)?.ok_or_else(|| {
            ContractStorageError::NotFound(format!("no init data for {addr}"))
        })?;
        let parsed: Value = serde_json::from_slice(&raw)
            .map_err(|e| ContractStorageError::Parse(format!("init data is not JSON: {e}")))?;

        let entries = parsed.as_array().ok_or_else(|| {
            ContractStorageError::Parse("init data is not a JSON array".to_string())
        })?;
        for entry in entries {
            if entry["vname"] == "_scilla_version" {
                let value = &entry["value"];
                if let Some(v) = value.as_u64() {
                    return Ok(v as u32);
                }
                if let Some(s) = value.as_str()
                    && let Ok(v) = s.parse::<u32>()
                {
                    return Ok(v);
                }
            }
        }
        Err(ContractStorageError::Parse(format!(
            "no _scilla_version in init data for {addr}"
        )))
    }

    // State
    // ========================================

    /// Writes the reserved per-contract map-depth JSON.
    ///
    /// Deploy/upgrade path only; `update_state_value` rejects the reserved
    /// vnames this writes.
    pub fn put_fields_map_depth(&self, addr: &Address, depths: &Value) {
        let mut data = self.lock_state();
        let key = storage_key(addr, crate::contract::value::MAP_DEPTH_INDICATOR, &[]);
        Self::update_state_data(&mut data, &key, depths.to_string().into_bytes(), false);
    }

    /// Writes the reserved per-contract sharding metadata JSON.
    ///
    /// Deploy/upgrade path only.
    pub fn put_sharding_info(&self, addr: &Address, info: &Value) {
        let mut data = self.lock_state();
        let key = storage_key(addr, crate::contract::value::SHARDING_INFO_INDICATOR, &[]);
        Self::update_state_data(&mut data, &key, info.to_string().into_bytes(), false);
    }

    /// Fetches the value addressed by `query` under `addr`.
    ///
    /// Returns `(value, found)`. A scalar query resolves through the tier
    /// precedence; a map query unions all three tiers first-writer-wins and
    /// rebuilds the nested value. `ignore_val` short-circuits to a bare
    /// existence check with `value = None`.
    pub fn fetch_state_value(
        &self,
        addr: &Address,
        query: &StorageQuery,
    ) -> Result<(Option<StorageValue>, bool), ContractStorageError> {
        let data = self.lock_state();

        if is_reserved_vname(&query.name) {
            return Err(ContractStorageError::Schema(format!(
                "query name {} is reserved",
                query.name
            )));
        }

        let key = query.key_prefix(addr);

        if query.indices.len() > query.map_depth as usize {
            return Err(ContractStorageError::Schema(
                "indices are deeper than map depth".to_string(),
            ));
        }

        let exact_depth = query.indices.len() == query.map_depth as usize;

        // A tombstone on the exact key hides the value unless re-written in
        // the temp tier.
        if data.tiers.t_deleted.contains(&key) && exact_depth {
            return Ok((None, false));
        }
        if data.tiers.m_deleted.contains(&key)
            && !data.tiers.t_state.contains_key(&key)
            && exact_depth
        {
            return Ok((None, false));
        }

        if exact_depth {
            return Self::fetch_scalar(&data, &key, query);
        }
        Self::fetch_map(&data, &key, query)
    }

    fn fetch_scalar(
        data: &StateData,
        key: &str,
        query: &StorageQuery,
    ) -> Result<(Option<StorageValue>, bool), ContractStorageError> {
        let bval = if let Some(v) = data.tiers.t_state.get(key) {
            v.clone()
        } else if let Some(v) = data.tiers.m_state.get(key) {
            v.clone()
        } else if data.db.exists(key)? {
            if query.ignore_val {
                return Ok((None, true));
            }
            data.db.lookup(key)?.unwrap_or_default()
        } else if query.map_depth == 0 {
            // A non-map value must exist in the store.
            return Err(ContractStorageError::NotFound(format!(
                "no value for scalar key {key:?}"
            )));
        } else {
            // An in-map value may legitimately be absent.
            return Ok((None, false));
        };

        Ok((Some(StorageValue::bytes(bval)), true))
    }

    fn fetch_map(
        data: &StateData,
        key: &str,
        query: &StorageQuery,
    ) -> Result<(Option<StorageValue>, bool), ContractStorageError> {
        // Union the three tiers first-writer-wins: temp, committed, disk.
        let mut entries: BTreeMap<String, Vec<u8>> = BTreeMap::new();

        for (k, v) in data.tiers.t_state.range(key.to_string()..) {
            if !k.starts_with(key) {
                break;
            }
            if query.ignore_val {
                return Ok((None, true));
            }
            entries.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in data.tiers.m_state.range(key.to_string()..) {
            if !k.starts_with(key) {
                break;
            }
            if query.ignore_val {
                return Ok((None, true));
            }
            entries.entry(k.clone()).or_insert_with(|| v.clone());
        }

        let db_entries = data.db.scan_prefix(key)?;
        if db_entries.is_empty() {
            if entries.is_empty() {
                // An existing-but-empty map is witnessed by a placeholder
                // entry, so a bare variable resolving to nothing means the
                // vname itself is invalid.
                if query.indices.is_empty() {
                    return Err(ContractStorageError::NotFound(format!(
                        "no entries for map variable {:?}",
                        query.name
                    )));
                }
                return Ok((None, false));
            }
        } else {
            if query.ignore_val {
                return Ok((None, true));
            }
            for (k, v) in db_entries {
                entries.entry(k).or_insert(v);
            }
        }

        let mut root = StorageValue::empty_map();
        let mut counter = 0u32;

        for (entry_key, entry_val) in &entries {
            if data.tiers.t_deleted.contains(entry_key) {
                continue;
            }
            if data.tiers.m_deleted.contains(entry_key)
                && !data.tiers.t_state.contains_key(entry_key)
            {
                continue;
            }

            counter += 1;

            if !entry_key.starts_with(key) {
                return Err(ContractStorageError::Schema(
                    "key is not a prefix of stored entry".to_string(),
                ));
            }
            let mut residual: Vec<String> = if entry_key.len() > key.len() {
                entry_key[key.len()..]
                    .split(INDEX_SEPARATOR)
                    .map(|s| s.to_string())
                    .collect()
            } else {
                Vec::new()
            };
            if residual.last().is_some_and(|s| s.is_empty()) {
                residual.pop();
            }

            if query.indices.len() + residual.len() < query.map_depth as usize {
                // Interior entry: must be an encoded empty map.
                let parsed = StorageValue::from_bytes(entry_val).map_err(|e| {
                    ContractStorageError::Parse(format!(
                        "interior entry is not a storage value: {e}"
                    ))
                })?;
                if !parsed.is_empty_map() {
                    return Err(ContractStorageError::Schema(
                        "expected an encoded empty map for an entry with fewer keys than map depth"
                            .to_string(),
                    ));
                }
                Self::ensure_map_at_path(&mut root, &residual);
            } else {
                Self::set_leaf_at_path(&mut root, &residual, entry_val.clone());
            }
        }

        if counter == 0 {
            return Ok((None, false));
        }
        Ok((Some(root), true))
    }

    /// Makes sure a (possibly empty) map node exists at `path`, preserving
    /// any children already folded in.
    fn ensure_map_at_path(root: &mut StorageValue, path: &[String]) {
        let mut node = root;
        for index in path {
            if !matches!(node, StorageValue::Mval(_)) {
                *node = StorageValue::empty_map();
            }
            let StorageValue::Mval(m) = node else {
                unreachable!("just replaced with a map");
            };
            node = m
                .entry(index.clone())
                .or_insert_with(StorageValue::empty_map);
        }
        if !matches!(node, StorageValue::Mval(_)) {
            *node = StorageValue::empty_map();
        }
    }

    fn set_leaf_at_path(root: &mut StorageValue, path: &[String], value: Vec<u8>) {
        if path.is_empty() {
            *root = StorageValue::bytes(value);
            return;
        }
        let mut node = root;
        for index in &path[..path.len() - 1] {
            if !matches!(node, StorageValue::Mval(_)) {
                *node = StorageValue::empty_map();
            }
            let StorageValue::Mval(m) = node else {
                unreachable!("just replaced with a map");
            };
            node = m
                .entry(index.clone())
                .or_insert_with(StorageValue::empty_map);
        }
        if !matches!(node, StorageValue::Mval(_)) {
            *node = StorageValue::empty_map();
        }
        let StorageValue::Mval(m) = node else {
            unreachable!("just replaced with a map");
        };
        m.insert(
            path[path.len() - 1].clone(),
            StorageValue::bytes(value),
        );
    }

    /// Tombstones every key under `prefix` across all tiers.
    fn delete_by_prefix(data: &mut StateData, prefix: &str) -> Result<(), ContractStorageError> {
        let mut doomed: Vec<String> = Vec::new();
        for (k, _) in data.tiers.t_state.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            doomed.push(k.clone());
        }
        for (k, _) in data.tiers.m_state.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            doomed.push(k.clone());
        }
        for (k, _) in data.db.scan_prefix(prefix)? {
            doomed.push(k);
        }
        for k in doomed {
            data.tiers.t_deleted.insert(k);
        }
        Ok(())
    }

    /// Tombstones `index` if it is visible in any tier.
    fn delete_by_index(data: &mut StateData, index: &str) -> Result<(), ContractStorageError> {
        if data.tiers.t_state.contains_key(index)
            || data.tiers.m_state.contains_key(index)
            || data.db.exists(index)?
        {
            data.tiers.t_deleted.insert(index.to_string());
        }
        Ok(())
    }

    /// Removes stale empty-map placeholders along the ancestor prefix chain
    /// of `key`.
    fn clean_empty_map_placeholders(
        data: &mut StateData,
        key: &str,
    ) -> Result<(), ContractStorageError> {
        // key = <addr><sep><vname><sep>[<idx1><sep>...<idxN><sep>]
        let mut fragments: Vec<&str> = key.split(INDEX_SEPARATOR).collect();
        if fragments.last().is_some_and(|s| s.is_empty()) {
            fragments.pop();
        }
        if fragments.len() < 2 {
            return Err(ContractStorageError::Schema(format!(
                "storage key has too few fragments: {}",
                fragments.len()
            )));
        }

        let mut scankey = format!(
            "{}{INDEX_SEPARATOR}{}{INDEX_SEPARATOR}",
            fragments[0], fragments[1]
        );
        Self::delete_by_index(data, &scankey)?;

        // Exclude the final fragment: that is the value key itself.
        if fragments.len() > 2 {
            for fragment in &fragments[2..fragments.len() - 1] {
                scankey.push_str(fragment);
                scankey.push(INDEX_SEPARATOR);
                Self::delete_by_index(data, &scankey)?;
            }
        }
        Ok(())
    }

    /// Writes `value` under `key` in the temp tier, clearing any tombstone.
    fn update_state_data(data: &mut StateData, key: &str, value: Vec<u8>, clean_empty: bool) {
        if clean_empty
            && let Err(e) = Self::clean_empty_map_placeholders(data, key)
        {
            warn!("placeholder cleanup failed for {key:?}: {e}");
        }
        data.tiers.t_deleted.remove(key);
        data.tiers.t_state.insert(key.to_string(), value);
    }

    /// Applies one update query against the temp tier.
    ///
    /// With `query.ignore_val` the addressed subtree is deleted (leaving an
    /// empty-map placeholder if the parent becomes empty); otherwise the
    /// value is written, recursively for nested maps.
    pub fn update_state_value(
        &self,
        addr: &Address,
        query: &StorageQuery,
        value: &StorageValue,
    ) -> Result<(), ContractStorageError> {
        let mut data = self.lock_state();

        if is_reserved_vname(&query.name) {
            return Err(ContractStorageError::Schema(format!(
                "query name {} is reserved",
                query.name
            )));
        }

        let mut key = storage_key(addr, &query.name, &[]);

        if query.ignore_val {
            if query.indices.is_empty() {
                return Err(ContractStorageError::Schema(
                    "indices cannot be empty for a delete".to_string(),
                ));
            }
            for index in &query.indices[..query.indices.len() - 1] {
                key.push_str(index);
                key.push(INDEX_SEPARATOR);
            }
            let parent_key = key.clone();
            key.push_str(&query.indices[query.indices.len() - 1]);
            key.push(INDEX_SEPARATOR);

            Self::delete_by_prefix(&mut data, &key)?;

            let mut siblings = BTreeMap::new();
            Self::fetch_state_data_for_key(&data, &mut siblings, &parent_key, true)?;
            if siblings.is_empty() {
                let placeholder = Encode::to_bytes(&StorageValue::empty_map()).to_vec();
                Self::update_state_data(&mut data, &parent_key, placeholder, false);
            }
            return Ok(());
        }

        for index in &query.indices {
            key.push_str(index);
            key.push(INDEX_SEPARATOR);
        }

        if query.indices.len() > query.map_depth as usize {
            return Err(ContractStorageError::Schema(
                "indices are deeper than map depth".to_string(),
            ));
        }
        if query.indices.len() == query.map_depth as usize {
            let StorageValue::Bval(b) = value else {
                return Err(ContractStorageError::Schema(
                    "value is not bytes but supposed to be".to_string(),
                ));
            };
            Self::update_state_data(&mut data, &key, b.to_vec(), true);
            return Ok(());
        }

        Self::delete_by_prefix(&mut data, &key)?;
        Self::write_map_value(&mut data, &key, value)
    }

    fn write_map_value(
        data: &mut StateData,
        key_acc: &str,
        value: &StorageValue,
    ) -> Result<(), ContractStorageError> {
        let StorageValue::Mval(m) = value else {
            return Err(ContractStorageError::Schema(
                "value is not a map but supposed to be".to_string(),
            ));
        };

        if m.is_empty() {
            // An empty map still needs an entry to witness that the key
            // itself exists.
            let placeholder = Encode::to_bytes(value).to_vec();
            Self::update_state_data(data, key_acc, placeholder, true);
            return Ok(());
        }

        for (index, child) in m {
            let mut child_key = key_acc.to_string();
            child_key.push_str(index);
            child_key.push(INDEX_SEPARATOR);
            match child {
                StorageValue::Mval(_) => Self::write_map_value(data, &child_key, child)?,
                StorageValue::Bval(b) => {
                    Self::update_state_data(data, &child_key, b.to_vec(), true)
                }
            }
        }
        Ok(())
    }

    /// Collects every visible entry under `key` into `states`, honoring the
    /// tier precedence and tombstones.
    ///
    /// With `temp = false` only the committed tier and disk are consulted.
    fn fetch_state_data_for_key(
        data: &StateData,
        states: &mut BTreeMap<String, Vec<u8>>,
        key: &str,
        temp: bool,
    ) -> Result<(), ContractStorageError> {
        if temp {
            for (k, v) in data.tiers.t_state.range(key.to_string()..) {
                if !k.starts_with(key) {
                    break;
                }
                states.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        for (k, v) in data.tiers.m_state.range(key.to_string()..) {
            if !k.starts_with(key) {
                break;
            }
            states.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in data.db.scan_prefix(key)? {
            states.entry(k).or_insert(v);
        }

        if temp {
            states.retain(|k, _| !data.tiers.t_deleted.contains(k));
        }
        states.retain(|k, _| {
            !(data.tiers.m_deleted.contains(k)
                && ((temp && !data.tiers.t_state.contains_key(k)) || !temp))
        });
        Ok(())
    }

    /// Collects every visible entry for `addr`/`vname`/`indices`.
    pub fn fetch_state_data_for_contract(
        &self,
        addr: &Address,
        vname: &str,
        indices: &[String],
        temp: bool,
    ) -> Result<BTreeMap<String, Vec<u8>>, ContractStorageError> {
        let data = self.lock_state();
        let key = storage_key(addr, vname, indices);
        let mut states = BTreeMap::new();
        Self::fetch_state_data_for_key(&data, &mut states, &key, temp)?;
        Ok(states)
    }

    /// Collects the updated states and tombstones recorded for `addr` in the
    /// requested tier, for delta serialization.
    pub fn fetch_updated_state_values_for_address(
        &self,
        addr: &Address,
        temp: bool,
    ) -> Result<(BTreeMap<String, Vec<u8>>, Vec<String>), ContractStorageError> {
        let data = self.lock_state();

        if addr.is_zero() {
            warn!("address provided is empty");
            return Ok((BTreeMap::new(), Vec::new()));
        }

        let prefix = addr.hex();
        let mut states = BTreeMap::new();
        let mut deleted = Vec::new();

        if temp {
            for (k, v) in data.tiers.t_state.range(prefix.clone()..) {
                if !k.starts_with(&prefix) {
                    break;
                }
                states.insert(k.clone(), v.clone());
            }
            for k in data.tiers.t_deleted.range(prefix.clone()..) {
                if !k.starts_with(&prefix) {
                    break;
                }
                deleted.push(k.clone());
            }
        } else {
            for (k, v) in data.tiers.m_state.range(prefix.clone()..) {
                if !k.starts_with(&prefix) {
                    break;
                }
                states.insert(k.clone(), v.clone());
            }
            for (k, v) in data.db.scan_prefix(&prefix)? {
                states.entry(k).or_insert(v);
            }
            for k in data.tiers.m_deleted.range(prefix.clone()..) {
                if !k.starts_with(&prefix) {
                    break;
                }
                deleted.push(k.clone());
            }
        }

        Ok((states, deleted))
    }

    fn fetch_reserved_json(
        data: &StateData,
        addr: &Address,
        vname: &str,
        temp: bool,
    ) -> Result<Value, ContractStorageError> {
        let key = storage_key(addr, vname, &[]);
        let mut states = BTreeMap::new();
        Self::fetch_state_data_for_key(data, &mut states, &key, temp)?;

        let raw = match (states.len(), states.get(&key)) {
            (1, Some(raw)) => raw,
            _ => {
                return Err(ContractStorageError::NotFound(format!(
                    "cannot find {vname} for {addr}"
                )));
            }
        };

        serde_json::from_slice(raw)
            .map_err(|e| ContractStorageError::Parse(format!("cannot parse {vname} JSON: {e}")))
    }

    /// Reads the per-contract map-depth JSON written at deploy time.
    pub fn fetch_fields_map_depth(
        &self,
        addr: &Address,
        temp: bool,
    ) -> Result<Value, ContractStorageError> {
        let data = self.lock_state();
        Self::fetch_reserved_json(&data, addr, crate::contract::value::MAP_DEPTH_INDICATOR, temp)
    }

    /// Reads the per-contract sharding metadata JSON written at deploy time.
    pub fn fetch_sharding_info(&self, addr: &Address) -> Result<Value, ContractStorageError> {
        let data = self.lock_state();
        Self::fetch_reserved_json(
            &data,
            addr,
            crate::contract::value::SHARDING_INFO_INDICATOR,
            false,
        )
    }

    /// Joins a contract's flat state fragments into one nested JSON document.
    pub fn fetch_state_json_for_contract(
        &self,
        addr: &Address,
        vname: &str,
        indices: &[String],
        temp: bool,
    ) -> Result<Value, ContractStorageError> {
        let data = self.lock_state();

        let key = storage_key(addr, vname, indices);
        let mut states = BTreeMap::new();
        Self::fetch_state_data_for_key(&data, &mut states, &key, temp)?;

        let map_depths = match Self::fetch_reserved_json(
            &data,
            addr,
            crate::contract::value::MAP_DEPTH_INDICATOR,
            temp,
        ) {
            Ok(v) => v,
            Err(e) => {
                warn!("fetching fields map depth failed for contract {addr}: {e}");
                Value::Null
            }
        };

        let addr_hex = addr.hex();
        let mut doc = Value::Null;
        for (state_key, state_val) in &states {
            let mut fragments: Vec<String> = state_key
                .split(INDEX_SEPARATOR)
                .map(|s| s.to_string())
                .collect();
            if fragments.first().map(String::as_str) != Some(addr_hex.as_str()) {
                return Err(ContractStorageError::Schema(format!(
                    "wrong state fetched: {state_key:?}"
                )));
            }
            if fragments.last().is_some_and(|s| s.is_empty()) {
                fragments.pop();
            }
            if fragments.len() < 2 {
                continue;
            }

            let state_vname = fragments[1].clone();
            if is_reserved_vname(&state_vname) {
                continue;
            }

            let map_indices = &fragments[2..];
            let depth = match &map_depths {
                Value::Object(m) => m
                    .get(&state_vname)
                    .and_then(Value::as_i64)
                    .unwrap_or(-1),
                _ => -1,
            };
            crate::contract::json::fold_fragment(
                &mut doc[state_vname.as_str()],
                map_indices,
                state_val,
                depth,
            );
        }

        Ok(doc)
    }

    /// Applies a batch of state updates and tombstones for `addr`.
    ///
    /// Three modes:
    /// 1. temp + sharded contribution: three-way merge through the executor's
    ///    sharding merger; a failed merge aborts the process rather than lose
    ///    writes silently.
    /// 2. temp overwrite: writes straight into the temp tier.
    /// 3. commit (`temp = false`): writes into the committed tier, journaling
    ///    prior values when `revertible`.
    ///
    /// Returns the contract's state hash over the written tier.
    #[allow(clippy::too_many_arguments)]
    pub fn update_state_datas_and_to_deletes(
        &self,
        addr: &Address,
        states: &BTreeMap<String, Vec<u8>>,
        to_delete: &[String],
        temp: bool,
        revertible: bool,
        shard_id: u32,
        num_shards: u32,
    ) -> Result<Hash, ContractStorageError> {
        // Interpreter version lookup takes the init-data lock; do it before
        // entering the state critical section.
        let sharded_candidate = temp
            && !states.is_empty()
            && shard_id != UNKNOWN_SHARD_ID
            && num_shards != UNKNOWN_SHARD_ID;
        let version = if sharded_candidate {
            self.interpreter_version(addr).ok()
        } else {
            None
        };

        let mut data = self.lock_state();

        if temp {
            let sharding_info = if sharded_candidate {
                Self::fetch_reserved_json(
                    &data,
                    addr,
                    crate::contract::value::SHARDING_INFO_INDICATOR,
                    false,
                )
                .ok()
            } else {
                None
            };

            match (&self.exec, sharding_info, version) {
                (Some(exec), Some(sharding_info), Some(version)) => {
                    Self::merge_sharded_states(
                        &mut data,
                        exec,
                        addr,
                        states,
                        &sharding_info,
                        version,
                        shard_id,
                        num_shards,
                    );
                }
                _ => {
                    for (key, value) in states {
                        data.tiers.t_state.insert(key.clone(), value.clone());
                        data.tiers.t_deleted.remove(key);
                    }
                }
            }

            for index in to_delete {
                data.tiers.t_deleted.insert(index.clone());
            }
        } else {
            for (key, value) in states {
                if revertible {
                    let old = data.tiers.m_state.get(key).cloned().unwrap_or_default();
                    // First write wins: the journal must restore the state
                    // before this commit batch, not an intermediate value.
                    data.tiers.r_state.entry(key.clone()).or_insert(old);
                }
                data.tiers.m_state.insert(key.clone(), value.clone());
                if data.tiers.m_deleted.remove(key) && revertible {
                    data.tiers.r_deleted.entry(key.clone()).or_insert(false);
                }
            }
            for index in to_delete {
                if revertible {
                    data.tiers.r_deleted.entry(index.clone()).or_insert(true);
                }
                data.tiers.m_deleted.insert(index.clone());
            }
        }

        Self::state_hash_core(&data, addr, temp)
    }

    /// Three-way merge of a shard's contribution, performed by the external
    /// merger. Holds the state lock for the whole call so the temp tier
    /// stays consistent with the ancestor/temp values shipped out.
    #[allow(clippy::too_many_arguments)]
    fn merge_sharded_states(
        data: &mut StateData,
        exec: &ExecClient,
        addr: &Address,
        states: &BTreeMap<String, Vec<u8>>,
        sharding_info: &Value,
        version: u32,
        shard_id: u32,
        num_shards: u32,
    ) {
        let mut merge_states = serde_json::Map::new();
        for (key, shard_val) in states {
            let mut ancestor_m = BTreeMap::new();
            let mut temp_m = BTreeMap::new();
            if let Err(e) = Self::fetch_state_data_for_key(data, &mut ancestor_m, key, false)
                .and_then(|_| Self::fetch_state_data_for_key(data, &mut temp_m, key, true))
            {
                fatal!("sharded merge state fetch failed for {key:?}: {e}");
            }
            let ancestor = ancestor_m.get(key).cloned().unwrap_or_default();
            let temp_val = temp_m.get(key).cloned().unwrap_or_default();

            merge_states.insert(
                key.clone(),
                json!({
                    "ancestor": String::from_utf8_lossy(&ancestor),
                    "temp": String::from_utf8_lossy(&temp_val),
                    "shard": String::from_utf8_lossy(shard_val),
                }),
            );
        }

        let merge_req = json!({
            "req_type": "join",
            "shard_id": shard_id,
            "contract_shard": address_shard_index(addr, num_shards),
            "num_shards": num_shards,
            "sharding_info": sharding_info,
            "states": Value::Object(merge_states),
        });

        let response = match exec.call_sharding(version, &merge_req) {
            Ok(resp) => resp,
            Err(e) => fatal!("sharded state merge failed for {addr}: {e}"),
        };
        let Some(merged) = response.get("states").and_then(Value::as_object) else {
            fatal!("sharded state merge returned no states for {addr}");
        };
        for (key, value) in merged {
            let Some(value) = value.as_str() else {
                fatal!("sharded state merge returned a non-string value for {key:?}");
            };
            data.tiers
                .t_state
                .insert(key.clone(), value.as_bytes().to_vec());
        }
    }

    fn state_hash_core(
        data: &StateData,
        addr: &Address,
        temp: bool,
    ) -> Result<Hash, ContractStorageError> {
        if addr.is_zero() {
            warn!("null address rejected for state hash");
            return Ok(Hash::zero());
        }

        let key = storage_key(addr, "", &[]);
        let mut states = BTreeMap::new();
        Self::fetch_state_data_for_key(data, &mut states, &key, temp)?;

        let mut hasher = Hash::sha256();
        for (state_key, state_val) in &states {
            hasher.update(state_key.as_bytes());
            if !state_val.is_empty() {
                hasher.update(state_val);
            }
        }
        Ok(hasher.finalize())
    }

    /// SHA-256 over the contract's sorted, addr-scoped keys and values.
    pub fn contract_state_hash(
        &self,
        addr: &Address,
        temp: bool,
    ) -> Result<Hash, ContractStorageError> {
        let data = self.lock_state();
        Self::state_hash_core(&data, addr, temp)
    }

    /// Snapshots the temp tier and committed tombstones into the single
    /// buffer slot.
    pub fn buffer_current_state(&self) {
        let mut data = self.lock_state();
        data.tiers.p_state = data.tiers.t_state.clone();
        data.tiers.p_deleted = data.tiers.m_deleted.clone();
    }

    /// Swaps the buffered snapshot back in.
    pub fn revert_prev_state(&self) {
        let mut data = self.lock_state();
        data.tiers.t_state = mem::take(&mut data.tiers.p_state);
        data.tiers.m_deleted = mem::take(&mut data.tiers.p_deleted);
    }

    /// Replays the revert journal to undo the last revertible commit batch.
    pub fn revert_contract_states(&self) {
        let mut data = self.lock_state();

        let journal = mem::take(&mut data.tiers.r_state);
        for (key, value) in journal {
            if value.is_empty() {
                data.tiers.m_state.remove(&key);
            } else {
                data.tiers.m_state.insert(key, value);
            }
        }

        let deletions = mem::take(&mut data.tiers.r_deleted);
        for (key, added) in deletions {
            if added {
                // revert a newly added tombstone
                data.tiers.m_deleted.remove(&key);
            } else {
                // revert a newly removed tombstone
                data.tiers.m_deleted.insert(key);
            }
        }
    }

    /// Clears the revert journal.
    pub fn init_revertibles(&self) {
        let mut data = self.lock_state();
        data.tiers.r_state.clear();
        data.tiers.r_deleted.clear();
    }

    /// Clears the temp tier.
    pub fn init_temp_state(&self) {
        let mut data = self.lock_state();
        Self::init_temp_core(&mut data);
    }

    fn init_temp_core(data: &mut StateData) {
        data.tiers.t_state.clear();
        data.tiers.t_deleted.clear();
    }

    /// Flushes the committed tier to disk: batch-inserts `m_state`, deletes
    /// every `m_deleted` key, clears both, and resets the temp tier.
    pub fn commit_state_db(&self) -> Result<(), ContractStorageError> {
        let mut data = self.lock_state();

        let batch: Vec<(String, Vec<u8>)> = data
            .tiers
            .m_state
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        data.db.batch_insert(&batch)?;

        let doomed: Vec<String> = data.tiers.m_deleted.iter().cloned().collect();
        data.db.batch_delete(&doomed)?;

        data.tiers.m_state.clear();
        data.tiers.m_deleted.clear();

        Self::init_temp_core(&mut data);
        Ok(())
    }

    /// Full wipe of all three databases and every overlay tier.
    pub fn reset(&self) -> Result<(), ContractStorageError> {
        {
            let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
            db.reset()?;
        }
        {
            let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
            db.reset()?;
        }
        let mut data = self.lock_state();
        data.db.reset()?;
        data.tiers = StateTiers::default();
        Ok(())
    }

    /// Refreshes all three databases back to empty.
    pub fn refresh_all(&self) -> Result<(), ContractStorageError> {
        {
            let db = self.code.lock().unwrap_or_else(|e| e.into_inner());
            db.refresh()?;
        }
        {
            let db = self.init_data.lock().unwrap_or_else(|e| e.into_inner());
            db.refresh()?;
        }
        let data = self.lock_state();
        data.db.refresh()?;
        Ok(())
    }
}

/// Shard a contract address lands on: the last four address bytes modulo the
/// shard count.
pub fn address_shard_index(addr: &Address, num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    let bytes = addr.as_slice();
    let tail: [u8; 4] = bytes[bytes.len() - 4..].try_into().expect("20-byte address");
    u32::from_be_bytes(tail) % num_shards
}
