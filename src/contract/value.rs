//! Storage queries, tagged storage values, and key composition.
//!
//! Contract field state is addressed by flat keys of the form
//! `<addr-hex> SEP <vname> SEP <idx1> SEP ... SEP <idxN> SEP` where `SEP` is
//! a fixed one-byte separator. Nested map values are flattened into one such
//! key per leaf; an interior node with no leaves is witnessed by an encoded
//! empty-map placeholder at its prefix.

use crate::types::address::Address;
use crate::types::bytes::Bytes;
use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use shardchain_derive::BinaryCodec;
use std::collections::BTreeMap;

/// One-byte separator between storage-key components.
pub const INDEX_SEPARATOR: char = '\u{16}';

/// Reserved vname holding the per-contract map-depth JSON.
pub const MAP_DEPTH_INDICATOR: &str = "_depth";

/// Reserved vname holding the per-contract sharding metadata JSON.
pub const SHARDING_INFO_INDICATOR: &str = "_sharding";

/// Returns `true` for vnames that normal update paths must reject.
pub fn is_reserved_vname(name: &str) -> bool {
    name == MAP_DEPTH_INDICATOR || name == SHARDING_INFO_INDICATOR
}

/// Composes the flat storage key for `addr`/`vname`/`indices`.
///
/// An empty `vname` yields just the address hex, which prefix-scans the
/// contract's entire state.
pub fn storage_key(addr: &Address, vname: &str, indices: &[String]) -> String {
    let mut ret = addr.hex();
    if !vname.is_empty() {
        ret.push(INDEX_SEPARATOR);
        ret.push_str(vname);
        ret.push(INDEX_SEPARATOR);
        for index in indices {
            ret.push_str(index);
            ret.push(INDEX_SEPARATOR);
        }
    }
    ret
}

/// A state query against one contract variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, BinaryCodec)]
pub struct StorageQuery {
    /// Variable name.
    pub name: String,
    /// Map indices addressing into the variable, outermost first.
    pub indices: Vec<String>,
    /// Declared nesting depth of the variable (0 for scalars).
    pub map_depth: u32,
    /// Existence/deletion flag: fetches short-circuit to an existence check,
    /// updates delete the addressed subtree.
    pub ignore_val: bool,
}

impl StorageQuery {
    pub fn new(name: &str, indices: &[&str], map_depth: u32, ignore_val: bool) -> Self {
        Self {
            name: name.to_string(),
            indices: indices.iter().map(|s| s.to_string()).collect(),
            map_depth,
            ignore_val,
        }
    }

    /// Key prefix addressed by this query under `addr`.
    pub fn key_prefix(&self, addr: &Address) -> String {
        storage_key(addr, &self.name, &self.indices)
    }
}

/// A tagged storage value: raw bytes or a string-keyed map of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageValue {
    /// Scalar payload.
    Bval(Bytes),
    /// Nested map payload.
    Mval(BTreeMap<String, StorageValue>),
}

impl StorageValue {
    /// Scalar value from raw bytes.
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        StorageValue::Bval(data.into())
    }

    /// The empty-map placeholder value.
    pub fn empty_map() -> Self {
        StorageValue::Mval(BTreeMap::new())
    }

    /// Returns `true` iff this is a map with no entries.
    pub fn is_empty_map(&self) -> bool {
        matches!(self, StorageValue::Mval(m) if m.is_empty())
    }

    /// Returns the scalar payload, if this is a scalar.
    pub fn as_bval(&self) -> Option<&Bytes> {
        match self {
            StorageValue::Bval(b) => Some(b),
            StorageValue::Mval(_) => None,
        }
    }

    /// Returns the map entries, if this is a map.
    pub fn as_mval(&self) -> Option<&BTreeMap<String, StorageValue>> {
        match self {
            StorageValue::Bval(_) => None,
            StorageValue::Mval(m) => Some(m),
        }
    }
}

// The recursive enum needs hand-written codec impls: the derive only walks
// struct fields.
impl Encode for StorageValue {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            StorageValue::Bval(b) => {
                0u8.encode(out);
                b.encode(out);
            }
            StorageValue::Mval(m) => {
                1u8.encode(out);
                m.len().encode(out);
                for (key, value) in m {
                    key.encode(out);
                    value.encode(out);
                }
            }
        }
    }
}

impl Decode for StorageValue {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(StorageValue::Bval(Bytes::decode(input)?)),
            1 => {
                let len = usize::decode(input)?;
                let mut m = BTreeMap::new();
                for _ in 0..len {
                    let key = String::decode(input)?;
                    let value = StorageValue::decode(input)?;
                    m.insert(key, value);
                }
                Ok(StorageValue::Mval(m))
            }
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    #[test]
    fn storage_key_layout() {
        let a = addr(0xAA);
        let key = storage_key(&a, "m", &["x".to_string(), "y".to_string()]);
        let sep = INDEX_SEPARATOR;
        assert_eq!(key, format!("{}{sep}m{sep}x{sep}y{sep}", a.hex()));
    }

    #[test]
    fn storage_key_empty_vname_is_bare_address() {
        let a = addr(0x01);
        assert_eq!(storage_key(&a, "", &[]), a.hex());
    }

    #[test]
    fn reserved_vnames() {
        assert!(is_reserved_vname("_depth"));
        assert!(is_reserved_vname("_sharding"));
        assert!(!is_reserved_vname("balance"));
    }

    #[test]
    fn query_roundtrip() {
        let query = StorageQuery::new("m", &["x", "y"], 2, false);
        let bytes = query.to_bytes();
        assert_eq!(StorageQuery::from_bytes(&bytes).unwrap(), query);
    }

    #[test]
    fn scalar_value_roundtrip() {
        let value = StorageValue::bytes(vec![0x2A]);
        let bytes = Encode::to_bytes(&value);
        assert_eq!(StorageValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn nested_value_roundtrip() {
        let mut inner = BTreeMap::new();
        inner.insert("y".to_string(), StorageValue::bytes(vec![0x2A]));
        inner.insert("z".to_string(), StorageValue::empty_map());
        let mut outer = BTreeMap::new();
        outer.insert("x".to_string(), StorageValue::Mval(inner));
        let value = StorageValue::Mval(outer);

        let bytes = Encode::to_bytes(&value);
        assert_eq!(StorageValue::from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn empty_map_is_detected() {
        assert!(StorageValue::empty_map().is_empty_map());
        assert!(!StorageValue::bytes(vec![]).is_empty_map());

        let mut m = BTreeMap::new();
        m.insert("k".to_string(), StorageValue::bytes(vec![1]));
        assert!(!StorageValue::Mval(m).is_empty_map());
    }

    #[test]
    fn empty_map_encoding_is_stable() {
        // The placeholder written for empty interior maps must decode back
        // to an empty map regardless of who wrote it.
        let bytes = Encode::to_bytes(&StorageValue::empty_map());
        let decoded = StorageValue::from_bytes(&bytes).unwrap();
        assert!(decoded.is_empty_map());
    }
}
