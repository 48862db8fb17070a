//! Value coercion, key validation, and the on-disk/on-wire record encodings.
//!
//! Local files hold pretty-printed JSON. Remote objects hold compact JSON
//! compressed with gzip (`.json.gz`); objects written before compression was
//! introduced are plain JSON (`.json`) and must stay readable.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use crate::error::{Result, StorageError};

/// Extension of local files and legacy remote objects.
pub const PLAIN_EXT: &str = ".json";
/// Extension of compressed remote objects.
pub const COMPRESSED_EXT: &str = ".json.gz";

/// Decode a value that arrived as a JSON-encoded string.
///
/// Browser clients often hand over `JSON.stringify(...)` output instead of a
/// structured value. If the string parses as JSON the parsed value is stored;
/// otherwise the raw string is kept as-is.
pub fn coerce_value(value: Value) -> Value {
    match value {
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(raw),
        },
        other => other,
    }
}

/// Check that a key can be used as a file or object name.
///
/// Hidden names are reserved (probe files live there) and are never listed,
/// so keys may not start with a dot.
pub fn validate_key(key: &str) -> Result<()> {
    let reason = if key.trim().is_empty() {
        Some("key is empty")
    } else if key.starts_with('.') {
        Some("keys may not start with '.'")
    } else if key.contains('/') || key.contains('\\') {
        Some("path separators are not allowed")
    } else if key.contains("..") {
        Some("'..' is not allowed")
    } else if key.contains('\0') {
        Some("NUL bytes are not allowed")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(StorageError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Recover the key from a stored file or object name.
///
/// Returns `None` for names that aren't records (wrong extension, probe
/// files, hidden files).
pub fn key_from_name(name: &str) -> Option<&str> {
    let key = name
        .strip_suffix(COMPRESSED_EXT)
        .or_else(|| name.strip_suffix(PLAIN_EXT))?;
    if key.is_empty() || key.starts_with('.') {
        None
    } else {
        Some(key)
    }
}

/// Pretty JSON, as written by the local backend.
pub fn encode_pretty(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

/// Compact JSON compressed with gzip.
pub fn encode_compressed(value: &Value) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StorageError::Codec(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Codec(e.to_string()))
}

pub fn decode_compressed(data: &[u8]) -> Result<Value> {
    let mut json = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut json)
        .map_err(|e| StorageError::Codec(e.to_string()))?;
    decode_plain(&json)
}

pub fn decode_plain(data: &[u8]) -> Result<Value> {
    Ok(serde_json::from_slice(data)?)
}
