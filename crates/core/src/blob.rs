//! Inline vs. out-of-line placement of token values.
//!
//! Large scalar values are moved out of the token record into backend blob
//! storage. The token keeps a small [`BlobRef`] marker under the same key and
//! lists the key in `blob_keys`, so reads can be routed transparently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a value should be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Keep the value in the token's `data` map.
    Inline,
    /// Store the given bytes through the backend's blob operations.
    Blob(Vec<u8>),
}

/// Size-based auto-blob rule.
///
/// Only scalar values (strings, numbers, booleans, null) are candidates;
/// arrays and objects stay inline regardless of size. A threshold of 0
/// disables auto-blobbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobPolicy {
    threshold: usize,
}

impl BlobPolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    pub fn disabled() -> Self {
        Self { threshold: 0 }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0
    }

    /// Decide where `value` goes.
    ///
    /// Size is the raw UTF-8 length for strings and the JSON encoding length
    /// for other scalars. Blob bytes are always the JSON encoding, so the
    /// original value (including its type) comes back on fetch.
    ///
    /// For strings the measured size and the stored size differ: the stored
    /// bytes (and the [`BlobRef`] length) include the JSON quotes and any
    /// escapes, so a 100-byte string is stored as at least 102 bytes.
    pub fn place(&self, value: &Value) -> Placement {
        if !self.is_enabled() || is_composite(value) {
            return Placement::Inline;
        }

        let size = match value {
            Value::String(s) => s.len(),
            other => other.to_string().len(),
        };

        if size > self.threshold {
            Placement::Blob(value.to_string().into_bytes())
        } else {
            Placement::Inline
        }
    }
}

fn is_composite(value: &Value) -> bool {
    matches!(value, Value::Array(_) | Value::Object(_))
}

/// How the bytes of a blob are to be interpreted on a normal (non-blob) read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobEncoding {
    /// JSON encoding of a value, written by the auto-blob path.
    Json,
    /// Opaque bytes, written by an explicit blob store.
    Raw,
}

/// Marker kept in `data` for a key whose value lives out-of-line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    #[serde(rename = "$blob")]
    pub encoding: BlobEncoding,
    pub len: usize,
}

impl BlobRef {
    pub fn json(len: usize) -> Self {
        Self {
            encoding: BlobEncoding::Json,
            len,
        }
    }

    pub fn raw(len: usize) -> Self {
        Self {
            encoding: BlobEncoding::Raw,
            len,
        }
    }

    pub fn to_value(self) -> Value {
        serde_json::json!({ "$blob": self.encoding, "len": self.len })
    }

    /// Parse a marker previously produced by [`BlobRef::to_value`].
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
