#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **vigil-canonical** – Lossless deterministic canonical encoding for Vigil.
//!
//! Heterogeneous event payloads are normalized into a recursive
//! [`CanonicalValue`] whose stable stringification is the *only* input the
//! hasher ever sees. Two runs over the same inputs therefore agree on every
//! projection hash, anomaly identity, and synthesized span id.
//!
//! Canonicalization contract:
//! - `null`, booleans, safe integers, finite floats, and strings pass through.
//! - Integers whose magnitude exceeds 2^53-1 become decimal strings so the
//!   projection never depends on the host's integer width.
//! - Non-finite floats become their textual form.
//! - Byte arrays become lowercase hex; 32-byte arrays under key-like field
//!   names become base58 (on-chain addresses), other 32-byte arrays stay hex.
//! - Arrays preserve order; objects are re-keyed lexicographically at every
//!   depth.
//! - Recursion depth is bounded; exceeding the bound fails the projection.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum canonicalization recursion depth.
pub const MAX_DEPTH: usize = 64;

/// Largest integer magnitude representable without loss in an IEEE-754
/// double (2^53 - 1). Anything bigger canonicalizes as a decimal string.
pub const MAX_SAFE_INTEGER: i128 = 9_007_199_254_740_991;

/// Field-name suffixes that mark a 32-byte array as an on-chain address.
const KEY_LIKE_SUFFIXES: &[&str] = &[
    "pda", "pubkey", "address", "authority", "agent", "signer", "key",
];

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced by the canonical encoder.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncoderError {
    /// Input nesting exceeded [`MAX_DEPTH`]; the input is malformed.
    #[error("canonical encoding depth exceeded: {depth} > {max}")]
    DepthExceeded {
        /// Depth reached when the bound tripped.
        depth: usize,
        /// The configured bound.
        max: usize,
    },
    /// A serializable value could not be lowered to JSON.
    #[error("value cannot be canonicalized: {0}")]
    Unsupported(String),
}

//─────────────────────────────
//  Canonical value
//─────────────────────────────

/// Canonical structural form of an event payload.
///
/// This is the recursive enum all hashing flows through. `Bytes` and large
/// integers only exist transiently: [`canonicalize`] renders them into
/// strings, so a canonicalized tree round-trips through JSON losslessly.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalValue {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer within the safe range.
    Int(i128),
    /// Integer beyond the safe range, as its decimal string.
    BigInt(String),
    /// Finite IEEE-754 double.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes; stringifies as lowercase hex.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<CanonicalValue>),
    /// Lexicographically keyed map.
    Object(BTreeMap<String, CanonicalValue>),
}

impl From<&[u8]> for CanonicalValue {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

impl From<&str> for CanonicalValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<u64> for CanonicalValue {
    fn from(v: u64) -> Self {
        canonical_int(v as i128)
    }
}

impl From<i64> for CanonicalValue {
    fn from(v: i64) -> Self {
        canonical_int(v as i128)
    }
}

/// Demote an integer to a decimal string when it exceeds the safe range.
fn canonical_int(v: i128) -> CanonicalValue {
    if v.abs() > MAX_SAFE_INTEGER {
        CanonicalValue::BigInt(v.to_string())
    } else {
        CanonicalValue::Int(v)
    }
}

/// Integral doubles in the safe range collapse to their integer form so the
/// canonical tree re-parses to itself (`5.0` and `5` are the same value,
/// and `-0.0` would otherwise stringify unstably).
fn canonical_float(f: f64) -> CanonicalValue {
    if f == 0.0 {
        CanonicalValue::Int(0)
    } else if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER as f64 {
        CanonicalValue::Int(f as i128)
    } else {
        CanonicalValue::Float(f)
    }
}

//─────────────────────────────
//  Canonicalization
//─────────────────────────────

/// Canonicalize an arbitrary JSON value.
pub fn canonicalize(value: &serde_json::Value) -> Result<CanonicalValue, EncoderError> {
    walk(value, None, 0)
}

fn is_key_like(field: &str) -> bool {
    let lower = field.to_ascii_lowercase();
    KEY_LIKE_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// A JSON array of exactly 32 integers in `0..=255` is treated as a 32-byte
/// value (address or hash). Returns the bytes when the shape matches.
fn as_byte_array_32(items: &[serde_json::Value]) -> Option<Vec<u8>> {
    if items.len() != 32 {
        return None;
    }
    let mut bytes = Vec::with_capacity(32);
    for item in items {
        let n = item.as_u64()?;
        if n > 255 {
            return None;
        }
        bytes.push(n as u8);
    }
    Some(bytes)
}

fn walk(
    value: &serde_json::Value,
    field_hint: Option<&str>,
    depth: usize,
) -> Result<CanonicalValue, EncoderError> {
    if depth > MAX_DEPTH {
        return Err(EncoderError::DepthExceeded {
            depth,
            max: MAX_DEPTH,
        });
    }
    let canonical = match value {
        serde_json::Value::Null => CanonicalValue::Null,
        serde_json::Value::Bool(b) => CanonicalValue::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                canonical_int(i as i128)
            } else if let Some(u) = n.as_u64() {
                canonical_int(u as i128)
            } else {
                // serde_json numbers are always finite.
                canonical_float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => CanonicalValue::Str(s.clone()),
        serde_json::Value::Array(items) => {
            if let Some(bytes) = as_byte_array_32(items) {
                if field_hint.map(is_key_like).unwrap_or(false) {
                    CanonicalValue::Str(bs58::encode(&bytes).into_string())
                } else {
                    CanonicalValue::Str(hex::encode(&bytes))
                }
            } else {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(walk(item, None, depth + 1)?);
                }
                CanonicalValue::Array(out)
            }
        }
        serde_json::Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                out.insert(key.clone(), walk(item, Some(key), depth + 1)?);
            }
            CanonicalValue::Object(out)
        }
    };
    Ok(canonical)
}

//─────────────────────────────
//  Stable stringification
//─────────────────────────────

/// Serialize a canonical value with sorted keys and no whitespace.
///
/// This string is the sole hashing input everywhere in the pipeline.
pub fn stable_stringify(value: &CanonicalValue) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &CanonicalValue) {
    match value {
        CanonicalValue::Null => out.push_str("null"),
        CanonicalValue::Bool(true) => out.push_str("true"),
        CanonicalValue::Bool(false) => out.push_str("false"),
        CanonicalValue::Int(i) => out.push_str(&i.to_string()),
        CanonicalValue::BigInt(s) => write_str(out, s),
        CanonicalValue::Float(f) => {
            if *f == 0.0 {
                // Signed zero must not print as "-0".
                out.push('0');
            } else if f.is_finite() {
                // Rust's shortest round-trip formatting.
                out.push_str(&f.to_string());
            } else if f.is_nan() {
                write_str(out, "NaN");
            } else if f.is_sign_positive() {
                write_str(out, "Infinity");
            } else {
                write_str(out, "-Infinity");
            }
        }
        CanonicalValue::Str(s) => write_str(out, s),
        CanonicalValue::Bytes(b) => write_str(out, &hex::encode(b)),
        CanonicalValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        CanonicalValue::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_str(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_str(out: &mut String, s: &str) {
    // serde_json performs the JSON escaping; string serialization never fails.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => out.push_str("\"\""),
    }
}

//─────────────────────────────
//  Content hashing
//─────────────────────────────

/// Blake3 digest of a canonical value's stable stringification.
pub fn digest(value: &CanonicalValue) -> [u8; 32] {
    blake3::hash(stable_stringify(value).as_bytes()).into()
}

/// Hex form of [`digest`].
pub fn digest_hex(value: &CanonicalValue) -> String {
    hex::encode(digest(value))
}

/// Blake3 digest of raw bytes, for callers hashing pre-rendered strings
/// (replay hashes over concatenated projection hashes, span synthesis).
pub fn digest_bytes(bytes: &[u8]) -> [u8; 32] {
    blake3::hash(bytes).into()
}

/// Canonicalize any serializable value and return its stable string.
///
/// Used by the sled driver for record bytes and by identity computations
/// over composite structures.
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, EncoderError> {
    let json =
        serde_json::to_value(value).map_err(|e| EncoderError::Unsupported(e.to_string()))?;
    Ok(stable_stringify(&canonicalize(&json)?))
}

//─────────────────────────────
//  Serde bindings
//─────────────────────────────

impl Serialize for CanonicalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CanonicalValue::Null => serializer.serialize_unit(),
            CanonicalValue::Bool(b) => serializer.serialize_bool(*b),
            CanonicalValue::Int(i) => {
                // Canonical integers always fit the safe range.
                serializer.serialize_i64(*i as i64)
            }
            CanonicalValue::BigInt(s) => serializer.serialize_str(s),
            CanonicalValue::Float(f) => serializer.serialize_f64(*f),
            CanonicalValue::Str(s) => serializer.serialize_str(s),
            CanonicalValue::Bytes(b) => serializer.serialize_str(&hex::encode(b)),
            CanonicalValue::Array(items) => items.serialize(serializer),
            CanonicalValue::Object(map) => map.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        canonicalize(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitives_pass_through() {
        let v = canonicalize(&json!({"a": null, "b": true, "c": 7, "d": -2, "e": "x"})).unwrap();
        assert_eq!(
            stable_stringify(&v),
            r#"{"a":null,"b":true,"c":7,"d":-2,"e":"x"}"#
        );
    }

    #[test]
    fn objects_rekeyed_lexicographically_at_every_depth() {
        let v = canonicalize(&json!({"z": {"b": 1, "a": 2}, "a": [{"y": 1, "x": 2}]})).unwrap();
        assert_eq!(
            stable_stringify(&v),
            r#"{"a":[{"x":2,"y":1}],"z":{"a":2,"b":1}}"#
        );
    }

    #[test]
    fn large_integers_become_decimal_strings() {
        let v = canonicalize(&json!({"lamports": 18446744073709551615u64})).unwrap();
        assert_eq!(
            stable_stringify(&v),
            r#"{"lamports":"18446744073709551615"}"#
        );
        // Boundary: 2^53-1 stays numeric.
        let v = canonicalize(&json!({"n": 9007199254740991u64})).unwrap();
        assert_eq!(stable_stringify(&v), r#"{"n":9007199254740991}"#);
    }

    #[test]
    fn key_like_32_byte_arrays_become_base58() {
        let bytes: Vec<u8> = (0u8..32).collect();
        let v = canonicalize(&json!({"taskPda": bytes.clone(), "resultHash": bytes})).unwrap();
        let s = stable_stringify(&v);
        let expected_b58 = bs58::encode((0u8..32).collect::<Vec<u8>>()).into_string();
        let expected_hex = hex::encode((0u8..32).collect::<Vec<u8>>());
        assert!(s.contains(&format!(r#""taskPda":"{expected_b58}""#)));
        assert!(s.contains(&format!(r#""resultHash":"{expected_hex}""#)));
    }

    #[test]
    fn short_int_arrays_stay_arrays() {
        let v = canonicalize(&json!({"votes": [1, 2, 3]})).unwrap();
        assert_eq!(stable_stringify(&v), r#"{"votes":[1,2,3]}"#);
    }

    #[test]
    fn bytes_variant_renders_lowercase_hex() {
        let v = CanonicalValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(stable_stringify(&v), r#""deadbeef""#);
    }

    #[test]
    fn non_finite_floats_render_textually() {
        assert_eq!(
            stable_stringify(&CanonicalValue::Float(f64::NAN)),
            r#""NaN""#
        );
        assert_eq!(
            stable_stringify(&CanonicalValue::Float(f64::NEG_INFINITY)),
            r#""-Infinity""#
        );
    }

    #[test]
    fn depth_bound_is_enforced() {
        let mut v = json!(1);
        for _ in 0..(MAX_DEPTH + 2) {
            v = json!([v]);
        }
        assert!(matches!(
            canonicalize(&v),
            Err(EncoderError::DepthExceeded { .. })
        ));
    }

    #[test]
    fn digest_is_stable_across_key_order() {
        let a = canonicalize(&json!({"x": 1, "y": 2})).unwrap();
        let b = canonicalize(&json!({"y": 2, "x": 1})).unwrap();
        assert_eq!(digest_hex(&a), digest_hex(&b));
        assert_eq!(digest_hex(&a).len(), 64);
    }

    #[test]
    fn stringify_parse_stringify_is_stable() {
        let v = canonicalize(&json!({
            "b": [1, 2.5, "three", null],
            "a": {"nested": {"big": 36893488147419103232f64}},
        }))
        .unwrap();
        let s1 = stable_stringify(&v);
        let reparsed: serde_json::Value = serde_json::from_str(&s1).unwrap();
        let s2 = stable_stringify(&canonicalize(&reparsed).unwrap());
        assert_eq!(s1, s2);
    }
}
