//! Canonical JSON serialization helpers.
//!
//! Fingerprints and archive metadata are computed over canonical JSON: object
//! keys are recursively sorted and the output is compact, so that identical
//! values produce identical bytes on every machine.

use serde::{ser::Error as SerdeSerError, Serialize};
use serde_json::{self, map::Map, Value};
use std::io::Write;

/// Recursively sort JSON object keys to obtain a canonical representation.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, val) in entries {
                sorted.insert(key, canonicalize(val));
            }

            Value::Object(sorted)
        }
        Value::Array(elements) => Value::Array(elements.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Serialize a value into canonical JSON and write it to the provided writer.
pub fn write_canonical_json<T, W>(mut writer: W, value: &T) -> Result<(), serde_json::Error>
where
    T: Serialize + ?Sized,
    W: Write,
{
    let canonical_value = canonicalize(serde_json::to_value(value)?);
    serde_json::to_writer(&mut writer, &canonical_value)
}

/// Serialize a value into canonical JSON bytes.
pub fn canonical_json_bytes<T>(value: &T) -> Result<Vec<u8>, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let mut buffer = Vec::new();
    write_canonical_json(&mut buffer, value)?;
    Ok(buffer)
}

/// Serialize a value into canonical JSON and return it as a String.
pub fn canonical_json_string<T>(value: &T) -> Result<String, serde_json::Error>
where
    T: Serialize + ?Sized,
{
    let buffer = canonical_json_bytes(value)?;
    String::from_utf8(buffer).map_err(|err| SerdeSerError::custom(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "m": [ {"y": 1, "x": 2} ]}});
        let s = canonical_json_string(&value).unwrap();
        assert_eq!(s, r#"{"a":{"m":[{"x":2,"y":1}],"z":true},"b":1}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let s = canonical_json_string(&json!([3, 1, 2])).unwrap();
        assert_eq!(s, "[3,1,2]");
    }
}
