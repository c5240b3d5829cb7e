// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;

/// Error type for storage operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend failed to read or write. Callers may retry.
    #[error("Backend I/O error: {0}")]
    Io(#[source] anyhow::Error),

    /// A stored value could not be decoded.
    #[error("Corrupted value under key {0}: {1}")]
    Corrupted(String, String),

    /// A catch-all error for other types of errors.
    #[error("Error occurred: {0}")]
    Other(#[source] anyhow::Error),
}

impl Error {
    /// Returns `true` for failures that may go away on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

/// A single mutation inside an atomic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: Bytes, value: Bytes },
    Delete { key: Bytes },
}

impl WriteOp {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        WriteOp::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Self {
        WriteOp::Delete { key: key.into() }
    }

    pub fn key(&self) -> &Bytes {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }
}

/// Trait representing a persistent key-value backend.
#[async_trait]
pub trait KvBackend: Send + Sync + Clone + 'static {
    /// Loads the value stored under `key`.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if the key is absent.
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error>;

    /// Applies all `ops` as one atomic unit.
    ///
    /// When this returns `Ok`, the whole batch is durable: either every op is visible to
    /// subsequent reads or none is. Implementations must not return before the write is synced.
    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), Error>;

    /// Returns every `(key, value)` pair whose key starts with `prefix`, in key order.
    ///
    /// The result reflects a single consistent view of the backend.
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>, Error>;
}
