//! Nested state-JSON assembly.
//!
//! Contract state is stored as flat key/value fragments; RPC surfaces and
//! the delta inspector want it back as one nested JSON document. The folder
//! here rebuilds that document using the per-contract map-depth schema:
//! interior prefixes become objects, leaves are parsed as JSON where they
//! are valid JSON and kept as strings otherwise.

use serde_json::Value;

/// Strips one leading and one trailing double quote, if present.
///
/// Map keys arrive quoted from the interpreter's JSON literals.
pub fn unquote(input: &mut String) {
    if input.is_empty() {
        return;
    }
    if input.starts_with('"') {
        input.remove(0);
    }
    if input.ends_with('"') {
        input.pop();
    }
}

/// Parses `s` as JSON, returning `None` when it is not valid JSON.
pub fn str_to_json(s: &str) -> Option<Value> {
    serde_json::from_str(s).ok()
}

/// Inserts a leaf value into the state JSON.
///
/// Values that parse as JSON arrays/objects keep their structure; everything
/// else is inserted as a string. With `nokey` the value replaces `json`
/// wholesale (scalar variables at the document root).
pub fn insert_value_to_state_json(
    json: &mut Value,
    key: &str,
    value: &str,
    unquote_key: bool,
    nokey: bool,
) {
    let mut key = key.to_string();
    if unquote_key {
        unquote(&mut key);
    }

    let parsed = str_to_json(value);
    let structured = matches!(&parsed, Some(v) if v.is_array() || v.is_object());

    let leaf = if structured {
        parsed.expect("checked above")
    } else {
        let mut value = value.to_string();
        if unquote_key && !nokey {
            unquote(&mut value);
        }
        match parsed {
            Some(v) => v,
            None => Value::String(value),
        }
    };

    if nokey {
        *json = leaf;
    } else {
        json[key.as_str()] = leaf;
    }
}

/// Folds one flat state fragment into the nested document.
///
/// `indices` is the fragment's residual index path, `value` its raw bytes,
/// and `map_depth` the variable's declared depth (-1 when the schema entry
/// is unavailable).
pub fn fold_fragment(json: &mut Value, indices: &[String], value: &[u8], map_depth: i64) {
    fold_at(json, indices, value, 0, map_depth);
}

fn fold_at(json: &mut Value, indices: &[String], value: &[u8], cur: usize, map_depth: i64) {
    if cur + 1 < indices.len() {
        let mut key = indices[cur].clone();
        unquote(&mut key);
        fold_at(&mut json[key.as_str()], indices, value, cur + 1, map_depth);
        return;
    }

    let text = String::from_utf8_lossy(value).into_owned();

    if map_depth > 0 {
        if indices.len() as i64 == map_depth {
            insert_value_to_state_json(json, &indices[cur], &text, true, false);
        } else if indices.is_empty() {
            *json = Value::Object(Default::default());
        } else {
            let mut key = indices[cur].clone();
            unquote(&mut key);
            json[key.as_str()] = Value::Object(Default::default());
        }
    } else if map_depth == 0 {
        insert_value_to_state_json(json, "", &text, true, true);
    } else {
        // Depth schema unavailable. An encoded empty-map placeholder marks
        // an interior node; anything else is treated as a leaf.
        use crate::contract::value::StorageValue;
        use crate::types::encoding::Decode;
        let is_placeholder = StorageValue::from_bytes(value)
            .map(|v| v.is_empty_map())
            .unwrap_or(false);
        if is_placeholder && !indices.is_empty() {
            let mut key = indices[cur].clone();
            unquote(&mut key);
            json[key.as_str()] = Value::Object(Default::default());
        } else if !indices.is_empty() {
            insert_value_to_state_json(json, &indices[cur], &text, true, false);
        } else {
            insert_value_to_state_json(json, "", &text, true, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unquote_strips_quotes() {
        let mut s = "\"key\"".to_string();
        unquote(&mut s);
        assert_eq!(s, "key");

        let mut bare = "key".to_string();
        unquote(&mut bare);
        assert_eq!(bare, "key");

        let mut empty = String::new();
        unquote(&mut empty);
        assert_eq!(empty, "");
    }

    #[test]
    fn insert_keeps_json_structure() {
        let mut doc = Value::Null;
        insert_value_to_state_json(&mut doc, "m", "{\"a\":1}", false, false);
        assert_eq!(doc, json!({"m": {"a": 1}}));
    }

    #[test]
    fn insert_plain_string_value() {
        let mut doc = Value::Null;
        insert_value_to_state_json(&mut doc, "\"k\"", "hello", true, false);
        assert_eq!(doc, json!({"k": "hello"}));
    }

    #[test]
    fn insert_nokey_replaces_document() {
        let mut doc = Value::Null;
        insert_value_to_state_json(&mut doc, "", "\"42\"", true, true);
        assert_eq!(doc, json!("42"));
    }

    #[test]
    fn fold_scalar_at_depth_zero() {
        let mut doc = Value::Null;
        fold_fragment(&mut doc, &[], b"\"10\"", 0);
        assert_eq!(doc, json!("10"));
    }

    #[test]
    fn fold_nested_leaves() {
        let mut doc = Value::Null;
        fold_fragment(
            &mut doc,
            &["\"x\"".to_string(), "\"y\"".to_string()],
            b"\"1\"",
            2,
        );
        fold_fragment(
            &mut doc,
            &["\"x\"".to_string(), "\"z\"".to_string()],
            b"\"2\"",
            2,
        );
        assert_eq!(doc, json!({"x": {"y": "1", "z": "2"}}));
    }

    #[test]
    fn fold_interior_placeholder_becomes_object() {
        let mut doc = Value::Null;
        fold_fragment(&mut doc, &["\"x\"".to_string()], b"", 2);
        assert_eq!(doc, json!({"x": {}}));
    }
}
