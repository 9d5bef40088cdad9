//! Stored value encoding.
//!
//! Scalars (`str`, `bool`, `int`, `float`) are stored as native text. Hash
//! fields, list elements and `any` leaves are stored as text when they are
//! strings and as a self-describing blob otherwise:
//!
//! ```text
//! 0xFF 'D' 'V' <version> <bincode(Value)>
//! ```
//!
//! 0xFF never appears in UTF-8, so decoding tries text first, then the blob
//! header, and falls back to raw bytes.

use super::Value;
use crate::constants::BLOB_MAGIC;
use crate::constants::BLOB_VERSION;
use crate::schema::TypeKind;
use crate::schema::TypeTag;
use crate::StoreError;

pub fn encode_blob(value: &Value) -> Result<Vec<u8>, StoreError> {
    let body = bincode::serialize(value)?;
    let mut out = Vec::with_capacity(BLOB_MAGIC.len() + 1 + body.len());
    out.extend_from_slice(&BLOB_MAGIC);
    out.push(BLOB_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn is_blob(bytes: &[u8]) -> bool {
    bytes.len() > BLOB_MAGIC.len() && bytes.starts_with(&BLOB_MAGIC) && bytes[BLOB_MAGIC.len()] == BLOB_VERSION
}

fn decode_blob(bytes: &[u8]) -> Option<Value> {
    if !is_blob(bytes) {
        return None;
    }
    bincode::deserialize(&bytes[BLOB_MAGIC.len() + 1..]).ok()
}

/// Native text for scalars, raw bytes for `Bytes`, blob for the rest.
pub fn encode_scalar(value: &Value) -> Result<Vec<u8>, StoreError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        other => match other.scalar_text() {
            Some(text) => Ok(text.into_bytes()),
            None => encode_blob(other),
        },
    }
}

/// Text for strings, blob for everything else.
pub fn encode_element(value: &Value) -> Result<Vec<u8>, StoreError> {
    match value {
        Value::Str(s) => Ok(s.as_bytes().to_vec()),
        other => encode_blob(other),
    }
}

/// Encoding for a whole leaf value under `tag`
pub fn encode_for(
    tag: TypeTag,
    value: &Value,
) -> Result<Vec<u8>, StoreError> {
    if tag.kind.is_container() {
        encode_element(value)
    } else {
        encode_scalar(value)
    }
}

/// Schema-free decode: text, then blob, then raw bytes.
pub fn decode(bytes: &[u8]) -> Value {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Value::Str(text.to_string());
    }
    decode_blob(bytes).unwrap_or_else(|| Value::Bytes(bytes.to_vec()))
}

/// Decode guided by the schema tag. Scalar text that does not parse as the
/// tagged type is returned as a string.
pub fn decode_typed(
    bytes: &[u8],
    tag: Option<TypeTag>,
) -> Value {
    let Some(tag) = tag else {
        return decode(bytes);
    };
    let raw = decode(bytes);
    let Value::Str(text) = &raw else {
        return raw;
    };
    parse_text(text, tag.kind).unwrap_or(raw)
}

/// Typed interpretation of a value carried in a key
pub fn parse_key_value(
    text: &str,
    tag: Option<TypeTag>,
) -> Value {
    tag.and_then(|t| parse_text(text, t.kind))
        .unwrap_or_else(|| Value::Str(text.to_string()))
}

fn parse_text(
    text: &str,
    kind: TypeKind,
) -> Option<Value> {
    match kind {
        TypeKind::Int => text.parse::<i64>().ok().map(Value::Int),
        TypeKind::Float => text.parse::<f64>().ok().map(Value::Float),
        TypeKind::Bool => match text {
            "true" | "True" | "1" => Some(Value::Bool(true)),
            "false" | "False" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}
