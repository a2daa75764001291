//! Canonical hashing of JSON values
//!
//! Values are encoded with type tags and length prefixes and object keys are
//! visited in sorted order, so structurally equal values hash identically and
//! distinct structures never share an encoding.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Append the canonical encoding of `value` to `out`
fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(if *b { b'1' } else { b'0' });
        }
        Value::Number(n) => encode_tagged(b'd', n.to_string().as_bytes(), out),
        Value::String(s) => encode_tagged(b's', s.as_bytes(), out),
        Value::Array(items) => {
            out.push(b'a');
            out.extend_from_slice(items.len().to_string().as_bytes());
            out.push(b':');
            for item in items {
                encode_value(item, out);
            }
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'o');
            out.extend_from_slice(keys.len().to_string().as_bytes());
            out.push(b':');
            for key in keys {
                encode_tagged(b's', key.as_bytes(), out);
                encode_value(&map[key], out);
            }
        }
    }
}

fn encode_tagged(tag: u8, bytes: &[u8], out: &mut Vec<u8>) {
    out.push(tag);
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

/// Canonical byte encoding of a JSON value
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_value(value, &mut out);
    out
}

/// SHA-256 hex digest of the canonical encoding
pub fn hash_value(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_bytes(value)))
}
