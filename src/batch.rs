//! Batch file format and naming.
//!
//! A batch is a file holding a length-prefixed sequence of event blobs:
//! a `u32` little-endian payload length followed by the payload, repeated.
//! When encryption is installed, prefixes cover the ciphertext.
//!
//! File names encode the creation instant in Unix milliseconds, zero-padded
//! so lexicographic order equals creation order.

use bytes::Bytes;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const LENGTH_PREFIX_BYTES: u64 = 4;

/// Width of the zero-padded millisecond timestamp in file names.
const NAME_WIDTH: usize = 20;

/// Identifier of one batch file: its name within the consent directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(String);

impl BatchId {
    /// Build an id from a creation instant.
    pub(crate) fn at(created: SystemTime) -> Self {
        let millis = created
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis();
        Self::from_millis(millis)
    }

    pub(crate) fn from_millis(millis: u128) -> Self {
        Self(format!("{millis:0width$}", width = NAME_WIDTH))
    }

    /// Parse a directory entry name; `None` for foreign files.
    pub(crate) fn parse(name: &str) -> Option<Self> {
        if name.len() == NAME_WIDTH && name.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(name.to_string()))
        } else {
            None
        }
    }

    /// Creation instant encoded in the name.
    pub(crate) fn created(&self) -> SystemTime {
        let millis: u64 = self.0.parse().unwrap_or(0);
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
    }

    pub(crate) fn next(&self) -> Self {
        let millis: u128 = self.0.parse().unwrap_or(0);
        Self::from_millis(millis + 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded batch handed to the upload pipeline.
#[derive(Clone, Debug)]
pub(crate) struct Batch {
    pub id: BatchId,
    /// Event payloads in write order, decrypted.
    pub events: Vec<Bytes>,
}

/// Number of bytes one payload occupies on disk, prefix included.
pub(crate) fn stored_size(payload_len: usize) -> u64 {
    LENGTH_PREFIX_BYTES + payload_len as u64
}

/// Append one payload to the batch file at `path`, creating it if needed.
pub(crate) fn append_event(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&(payload.len() as u32).to_le_bytes())?;
    file.write_all(payload)?;
    Ok(())
}

#[derive(Debug, Error)]
pub(crate) enum BatchDecodeError {
    #[error("truncated length prefix at offset {offset}")]
    TruncatedPrefix { offset: usize },
    #[error("event of {expected} bytes truncated at offset {offset}")]
    TruncatedPayload { offset: usize, expected: usize },
}

/// Decode a whole batch file into its event payloads, in write order.
pub(crate) fn decode_events(data: &[u8]) -> Result<Vec<Bytes>, BatchDecodeError> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let Some(&[a, b, c, d]) = data.get(offset..offset + 4) else {
            return Err(BatchDecodeError::TruncatedPrefix { offset });
        };
        let len = u32::from_le_bytes([a, b, c, d]) as usize;
        offset += 4;
        let Some(payload) = data.get(offset..offset + len) else {
            return Err(BatchDecodeError::TruncatedPayload {
                offset,
                expected: len,
            });
        };
        events.push(Bytes::copy_from_slice(payload));
        offset += len;
    }
    Ok(events)
}
