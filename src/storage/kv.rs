//! RocksDB-backed key/value store adapter.
//!
//! The node keeps one RocksDB instance with a column family per logical
//! database: contract code, contract init-data, contract state, trie nodes,
//! metadata, and the temporary account-state spill used during recovery.
//! A [`KvStore`] binds the shared handle to a single column family and
//! provides the ordered-scan and batched-write operations the overlay
//! stores depend on.

use crate::types::encoding::DecodeError;
use crate::warn;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use shardchain_derive::Error;
use std::path::Path;
use std::sync::Arc;

/// Column family for contract code, keyed by address hex.
pub const CF_CODE: &str = "code";
/// Column family for contract init-data, keyed by address hex.
pub const CF_INIT_DATA: &str = "init_data";
/// Column family for contract field state, keyed by storage key.
pub const CF_STATE_DATA: &str = "state_data";
/// Column family for Merkle-Patricia trie nodes, keyed by node hash.
pub const CF_TRIE: &str = "trie";
/// Column family for metadata (state root, legacy keys).
pub const CF_META: &str = "meta";
/// Column family for the temporary account-state spill.
pub const CF_TEMP_STATE: &str = "temp_state";

/// Errors that can occur while interacting with storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database operation failed.
    #[error("database error: {0}")]
    Db(String),
    /// Failed to decode data read from storage.
    #[error("decode error: {0}")]
    Decode(String),
    /// Trie operation failed.
    #[error("trie error: {0}")]
    Trie(String),
    /// No state root has been persisted yet.
    #[error("no state root found on disk")]
    MissingStateRoot,
    /// The persisted state root bytes are not a valid hash.
    #[error("persisted state root is not a valid 32-byte hash")]
    InvalidStateRoot,
}

impl From<rocksdb::Error> for StorageError {
    fn from(value: rocksdb::Error) -> Self {
        StorageError::Db(value.to_string())
    }
}

impl From<DecodeError> for StorageError {
    fn from(value: DecodeError) -> Self {
        StorageError::Decode(value.to_string())
    }
}

/// Returns the column family descriptors for a state database.
pub fn cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    [
        CF_CODE,
        CF_INIT_DATA,
        CF_STATE_DATA,
        CF_TRIE,
        CF_META,
        CF_TEMP_STATE,
    ]
    .into_iter()
    .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
    .collect()
}

/// Opens (or creates) the node's state database with all column families.
pub fn open_state_db(path: &Path) -> Result<Arc<DB>, StorageError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let db = DB::open_cf_descriptors(&opts, path, cf_descriptors())?;
    Ok(Arc::new(db))
}

/// A key/value view over one column family of the shared database.
///
/// Keys are strings (storage keys and address hex); values are raw bytes.
/// Iteration follows RocksDB's lexicographic byte order, which map-value
/// assembly and state hashing rely on.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<DB>,
    cf: &'static str,
}

impl KvStore {
    /// Binds a view over the named column family.
    pub fn new(db: Arc<DB>, cf: &'static str) -> Self {
        Self { db, cf }
    }

    fn cf_handle(&self) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(self.cf).expect("column family must exist")
    }

    /// Fetches the value stored under `key`, or `None` if absent.
    pub fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get_cf(self.cf_handle(), key.as_bytes())?)
    }

    /// Returns `true` if `key` is present.
    pub fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Writes a single key/value pair.
    pub fn insert(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        Ok(self.db.put_cf(self.cf_handle(), key.as_bytes(), value)?)
    }

    /// Writes all pairs atomically in one batch.
    pub fn batch_insert(&self, batch: &[(String, Vec<u8>)]) -> Result<(), StorageError> {
        let cf = self.cf_handle();
        let mut wb = WriteBatch::default();
        for (key, value) in batch {
            wb.put_cf(cf, key.as_bytes(), value);
        }
        Ok(self.db.write(wb)?)
    }

    /// Deletes a single key.
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        Ok(self.db.delete_cf(self.cf_handle(), key.as_bytes())?)
    }

    /// Deletes all keys atomically in one batch.
    pub fn batch_delete<S: AsRef<str>>(&self, keys: &[S]) -> Result<(), StorageError> {
        let cf = self.cf_handle();
        let mut wb = WriteBatch::default();
        for key in keys {
            wb.delete_cf(cf, key.as_ref().as_bytes());
        }
        Ok(self.db.write(wb)?)
    }

    /// Returns all entries whose key starts with `prefix`, in lexicographic
    /// byte order.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let cf = self.cf_handle();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut entries = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            match String::from_utf8(key.into_vec()) {
                Ok(key) => entries.push((key, value.into_vec())),
                Err(e) => {
                    warn!("scan_prefix: skipping non-utf8 key in {}: {e}", self.cf);
                }
            }
        }
        Ok(entries)
    }

    /// Deletes every key in the column family.
    pub fn reset(&self) -> Result<(), StorageError> {
        let cf = self.cf_handle();
        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        let mut wb = WriteBatch::default();
        for item in iter {
            let (key, _) = item?;
            wb.delete_cf(cf, key);
        }
        Ok(self.db.write(wb)?)
    }

    /// Deletes every key and compacts the column family back to empty files.
    pub fn refresh(&self) -> Result<(), StorageError> {
        self.reset()?;
        self.db
            .compact_range_cf(self.cf_handle(), None::<&[u8]>, None::<&[u8]>);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> KvStore {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = open_state_db(&dir.keep()).expect("failed to open test db");
        KvStore::new(db, CF_STATE_DATA)
    }

    #[test]
    fn insert_lookup_delete() {
        let store = test_store();
        assert!(store.lookup("k").unwrap().is_none());

        store.insert("k", b"v").unwrap();
        assert_eq!(store.lookup("k").unwrap(), Some(b"v".to_vec()));
        assert!(store.exists("k").unwrap());

        store.delete("k").unwrap();
        assert!(!store.exists("k").unwrap());
    }

    #[test]
    fn batch_insert_writes_all_pairs() {
        let store = test_store();
        let batch = vec![
            ("a".to_string(), vec![1u8]),
            ("b".to_string(), vec![2u8]),
        ];
        store.batch_insert(&batch).unwrap();
        assert_eq!(store.lookup("a").unwrap(), Some(vec![1]));
        assert_eq!(store.lookup("b").unwrap(), Some(vec![2]));
    }

    #[test]
    fn scan_prefix_is_lexicographic_and_bounded() {
        let store = test_store();
        store.insert("aa.x", b"1").unwrap();
        store.insert("aa.y", b"2").unwrap();
        store.insert("ab.z", b"3").unwrap();

        let entries = store.scan_prefix("aa.").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "aa.x");
        assert_eq!(entries[1].0, "aa.y");
    }

    #[test]
    fn scan_prefix_empty_for_missing_prefix() {
        let store = test_store();
        store.insert("other", b"1").unwrap();
        assert!(store.scan_prefix("missing").unwrap().is_empty());
    }

    #[test]
    fn reset_clears_everything() {
        let store = test_store();
        store.insert("a", b"1").unwrap();
        store.insert("b", b"2").unwrap();
        store.reset().unwrap();
        assert!(store.scan_prefix("").unwrap().is_empty());
    }

    #[test]
    fn stores_on_different_cfs_are_isolated() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db = open_state_db(&dir.keep()).expect("failed to open test db");
        let code = KvStore::new(Arc::clone(&db), CF_CODE);
        let state = KvStore::new(db, CF_STATE_DATA);

        code.insert("k", b"code").unwrap();
        assert!(state.lookup("k").unwrap().is_none());
    }
}
