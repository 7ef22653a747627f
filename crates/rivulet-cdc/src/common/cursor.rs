//! Change cursors
//!
//! A [`Cursor`] marks how far a table has been processed. It is an opaque
//! byte string whose lexicographic order matches the source's native order
//! (for SQL Server: `__$start_lsn` followed by `__$seqval`).
//!
//! Cursors are persisted and logged as hex.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::common::{CdcError, Result};

/// Opaque, totally ordered position in a table's change stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    bytes: Vec<u8>,
}

impl Cursor {
    /// Create a cursor from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Minimum cursor for a source whose positions are `width` bytes wide
    pub fn min(width: usize) -> Self {
        Self::new(vec![0u8; width])
    }

    /// Create a cursor from a hex string (an optional `0x` prefix is accepted)
    pub fn from_hex(hex: &str) -> Result<Self> {
        let digits = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);
        let bytes = hex::decode(digits)
            .map_err(|e| CdcError::serialization(format!("Invalid cursor hex '{}': {}", hex, e)))?;
        Ok(Self::new(bytes))
    }

    /// Convert to lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Width in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Check if every byte is zero
    pub fn is_min(&self) -> bool {
        self.bytes.iter().all(|&b| b == 0)
    }
}

impl From<Vec<u8>> for Cursor {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for Cursor {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode_upper(&self.bytes))
    }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Cursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Cursor::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}
