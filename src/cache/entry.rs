//! On-disk cache record format.
//!
//! ```text
//! {"key":"<hex>","identity":"GET http://h:80/","created_at":1700000000,"expires_at":1700000300}\n
//! HTTP/1.1 200 OK\r\n
//! ...headers...\r\n
//! \r\n
//! <payload>
//! ```
//!
//! The first line is a JSON header carrying the entry's identity and
//! expiry. Everything after the first `\n` is the response exactly as it was
//! serialized for the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when a record cannot be decoded.
#[derive(Debug, Error)]
pub(crate) enum EntryError {
    #[error("record has no header line")]
    MissingHeader,

    #[error("record header is not valid JSON: {0}")]
    Header(#[from] serde_json::Error),
}

/// Metadata stored ahead of the serialized response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct EntryHeader {
    pub key: String,
    /// Canonical request identity; guards against key collisions.
    pub identity: String,
    /// Unix seconds.
    pub created_at: u64,
    /// Unix seconds; the entry is stale once `expires_at <= now`.
    pub expires_at: u64,
}

impl EntryHeader {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Builds a complete record from a header and the serialized response.
pub(crate) fn encode(header: &EntryHeader, response: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let mut record = serde_json::to_vec(header)?;
    record.push(b'\n');
    record.extend_from_slice(response);
    Ok(record)
}

/// Splits a record into its header and the serialized response bytes.
pub(crate) fn decode(record: &[u8]) -> Result<(EntryHeader, &[u8]), EntryError> {
    let newline = record
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(EntryError::MissingHeader)?;
    let header = serde_json::from_slice(&record[..newline])?;
    Ok((header, &record[newline + 1..]))
}
