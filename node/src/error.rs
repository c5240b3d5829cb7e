// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::future::Future;
use std::time::Duration;

use custody_node_storage::Error as StorageError;

/// Errors returned by the node's store and retrieval operations.
///
/// `Validation`, `Assignment` and `Commitment` are terminal for a store call: no signature is
/// issued and nothing from the batch is persisted.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The batch or one of its blobs is malformed or inconsistent.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A blob or quorum is not assigned to this node.
    #[error("Assignment error: {0}")]
    Assignment(String),

    /// A cryptographic check failed.
    #[error("Commitment error: {0}")]
    Commitment(String),

    /// Unknown or expired retrieval key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call did not finish within its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The persistent backend failed after local retries.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The chain-height oracle could not be read.
    #[error("Chain height unavailable: {0}")]
    Chain(#[source] anyhow::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Runs `fut` under `deadline`, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout(deadline))?
}
