//! Merkle-Patricia state trie over an overlay node store.
//!
//! Trie nodes are buffered in an in-memory overlay ([`OverlayDb`]) layered
//! above the `trie` column family. Mutations only touch the overlay;
//! [`StateTrie::commit`] makes them durable in one batch and
//! [`StateTrie::rollback`] discards them, which is what lets a failed block
//! application walk away without leaving partial trie nodes on disk.

use crate::storage::kv::{CF_TRIE, StorageError};
use crate::types::hash::Hash;
use cita_trie::{PatriciaTrie, Trie};
use hasher::HasherKeccak;
use rocksdb::{DB, WriteBatch};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Trie node store with a dirty in-memory overlay above RocksDB.
///
/// Reads consult the overlay first, then disk. Writes and removals only
/// mark the overlay; nothing reaches disk until [`OverlayDb::commit`].
pub struct OverlayDb {
    db: Arc<DB>,
    dirty: RwLock<HashMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl OverlayDb {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            db,
            dirty: RwLock::new(HashMap::new()),
        }
    }

    fn cf_handle(&self) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(CF_TRIE).expect("CF_TRIE must exist")
    }

    /// Flushes the overlay to disk in one atomic batch and clears it.
    pub fn commit(&self) -> Result<(), StorageError> {
        let mut dirty = self.dirty.write().unwrap_or_else(|e| e.into_inner());
        let cf = self.cf_handle();
        let mut wb = WriteBatch::default();
        for (key, value) in dirty.iter() {
            match value {
                Some(v) => wb.put_cf(cf, key, v),
                None => wb.delete_cf(cf, key),
            }
        }
        self.db.write(wb)?;
        dirty.clear();
        Ok(())
    }

    /// Discards all buffered writes without touching disk.
    pub fn discard(&self) {
        self.dirty
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of buffered (uncommitted) node writes.
    pub fn dirty_len(&self) -> usize {
        self.dirty.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl cita_trie::DB for OverlayDb {
    type Error = StorageError;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        if let Some(entry) = self
            .dirty
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Ok(entry.clone());
        }
        Ok(self.db.get_cf(self.cf_handle(), key)?)
    }

    fn contains(&self, key: &[u8]) -> Result<bool, Self::Error> {
        Ok(cita_trie::DB::get(self, key)?.is_some())
    }

    fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), Self::Error> {
        self.dirty
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<(), Self::Error> {
        self.dirty
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_vec(), None);
        Ok(())
    }

    fn flush(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct TrieInner {
    db: Arc<OverlayDb>,
    hasher: Arc<HasherKeccak>,
    root: Hash,
    prev_root: Hash,
}

/// The address-to-account authenticated map.
///
/// A dedicated mutex serializes all trie mutation; callers never observe a
/// half-applied update. `Hash::zero()` is the "fresh trie" sentinel.
pub struct StateTrie {
    inner: Mutex<TrieInner>,
}

impl StateTrie {
    pub fn new(db: Arc<DB>) -> Self {
        Self {
            inner: Mutex::new(TrieInner {
                db: Arc::new(OverlayDb::new(db)),
                hasher: Arc::new(HasherKeccak::new()),
                root: Hash::zero(),
                prev_root: Hash::zero(),
            }),
        }
    }

    fn open(inner: &TrieInner) -> Result<PatriciaTrie<OverlayDb, HasherKeccak>, StorageError> {
        if inner.root.is_zero() {
            Ok(PatriciaTrie::new(
                Arc::clone(&inner.db),
                Arc::clone(&inner.hasher),
            ))
        } else {
            PatriciaTrie::from(
                Arc::clone(&inner.db),
                Arc::clone(&inner.hasher),
                inner.root.as_slice(),
            )
            .map_err(|e| StorageError::Trie(e.to_string()))
        }
    }

    /// Fetches the value stored under `key` at the current root.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.root.is_zero() {
            return Ok(None);
        }
        let trie = Self::open(&inner)?;
        trie.get(key).map_err(|e| StorageError::Trie(e.to_string()))
    }

    /// Inserts `value` under `key` and returns the new root.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Result<Hash, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut trie = Self::open(&inner)?;
        trie.insert(key.to_vec(), value)
            .map_err(|e| StorageError::Trie(e.to_string()))?;
        let root = trie
            .root()
            .map_err(|e| StorageError::Trie(e.to_string()))?;
        inner.root = Hash::from_slice(&root).ok_or(StorageError::InvalidStateRoot)?;
        Ok(inner.root)
    }

    /// Removes `key` and returns the new root.
    pub fn remove(&self, key: &[u8]) -> Result<Hash, StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.root.is_zero() {
            return Ok(inner.root);
        }
        let mut trie = Self::open(&inner)?;
        trie.remove(key)
            .map_err(|e| StorageError::Trie(e.to_string()))?;
        let root = trie
            .root()
            .map_err(|e| StorageError::Trie(e.to_string()))?;
        inner.root = Hash::from_slice(&root).ok_or(StorageError::InvalidStateRoot)?;
        Ok(inner.root)
    }

    /// Returns the current root commitment.
    pub fn root(&self) -> Hash {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).root
    }

    /// Returns the root at the last successful commit.
    pub fn prev_root(&self) -> Hash {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .prev_root
    }

    /// Repoints the trie at a different root without touching node storage.
    pub fn set_root(&self, root: Hash) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.root = root;
        inner.prev_root = root;
    }

    /// Flushes dirty nodes to disk and records the committed root.
    pub fn commit(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.db.commit()?;
        inner.prev_root = inner.root;
        Ok(())
    }

    /// Discards dirty nodes; the caller is expected to restore the root via
    /// [`StateTrie::set_root`] with [`StateTrie::prev_root`].
    pub fn rollback(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.db.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::open_state_db;
    use std::path::PathBuf;

    fn test_db() -> (Arc<DB>, PathBuf) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.keep();
        (open_state_db(&path).expect("failed to open test db"), path)
    }

    #[test]
    fn put_then_get_roundtrip() {
        let (db, _path) = test_db();
        let trie = StateTrie::new(db);

        trie.put(b"addr-1", b"account-1".to_vec()).unwrap();
        trie.put(b"addr-2", b"account-2".to_vec()).unwrap();

        assert_eq!(trie.get(b"addr-1").unwrap(), Some(b"account-1".to_vec()));
        assert_eq!(trie.get(b"addr-2").unwrap(), Some(b"account-2".to_vec()));
        assert_eq!(trie.get(b"addr-3").unwrap(), None);
    }

    #[test]
    fn root_changes_with_content() {
        let (db, _path) = test_db();
        let trie = StateTrie::new(db);

        let empty = trie.root();
        let r1 = trie.put(b"a", b"1".to_vec()).unwrap();
        let r2 = trie.put(b"b", b"2".to_vec()).unwrap();

        assert_ne!(empty, r1);
        assert_ne!(r1, r2);
    }

    #[test]
    fn same_content_same_root() {
        let (db1, _p1) = test_db();
        let (db2, _p2) = test_db();
        let t1 = StateTrie::new(db1);
        let t2 = StateTrie::new(db2);

        // Insertion order must not matter for the commitment.
        t1.put(b"a", b"1".to_vec()).unwrap();
        t1.put(b"b", b"2".to_vec()).unwrap();
        t2.put(b"b", b"2".to_vec()).unwrap();
        t2.put(b"a", b"1".to_vec()).unwrap();

        assert_eq!(t1.root(), t2.root());
    }

    #[test]
    fn remove_restores_prior_root() {
        let (db, _path) = test_db();
        let trie = StateTrie::new(db);

        let r1 = trie.put(b"a", b"1".to_vec()).unwrap();
        trie.put(b"b", b"2".to_vec()).unwrap();
        let r3 = trie.remove(b"b").unwrap();

        assert_eq!(r1, r3);
        assert_eq!(trie.get(b"b").unwrap(), None);
    }

    #[test]
    fn commit_makes_nodes_durable_across_reopen() {
        let (db, _path) = test_db();
        let root = {
            let trie = StateTrie::new(Arc::clone(&db));
            let root = trie.put(b"a", b"1".to_vec()).unwrap();
            trie.commit().unwrap();
            root
        };

        let reopened = StateTrie::new(db);
        reopened.set_root(root);
        assert_eq!(reopened.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn rollback_discards_uncommitted_nodes() {
        let (db, _path) = test_db();
        let trie = StateTrie::new(Arc::clone(&db));

        trie.put(b"a", b"1".to_vec()).unwrap();
        trie.commit().unwrap();
        let committed = trie.root();

        let dirty_root = trie.put(b"b", b"2".to_vec()).unwrap();
        trie.rollback();
        trie.set_root(trie.prev_root());

        assert_eq!(trie.root(), committed);
        assert_eq!(trie.get(b"a").unwrap(), Some(b"1".to_vec()));

        // The discarded root's nodes are gone from the store.
        let stale = StateTrie::new(db);
        stale.set_root(dirty_root);
        assert!(stale.get(b"b").is_err());
    }

    #[test]
    fn prev_root_tracks_last_commit() {
        let (db, _path) = test_db();
        let trie = StateTrie::new(db);

        let r1 = trie.put(b"a", b"1".to_vec()).unwrap();
        trie.commit().unwrap();
        assert_eq!(trie.prev_root(), r1);

        let r2 = trie.put(b"b", b"2".to_vec()).unwrap();
        assert_eq!(trie.prev_root(), r1);
        trie.commit().unwrap();
        assert_eq!(trie.prev_root(), r2);
    }
}
