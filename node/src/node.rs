// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use custody_node_storage::KvBackend;

use crate::assignment::AssignmentSource;
use crate::attestor::{Attestor, Signer};
use crate::chain::ChainHeight;
use crate::chunk_store::{BatchCommit, BatchRecord, ChunkStore};
use crate::config::NodeConfig;
use crate::error::{with_deadline, Error, Result};
use crate::retrieval::RetrievalServer;
use crate::types::{BatchHeader, BatchHeaderHash, Blob, BlobIndex};
use crate::validator::BatchValidator;
use crate::verifier::{CommitmentBackend, CommitmentVerifier};

/// Result of a successful store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    pub batch_header_hash: BatchHeaderHash,
    /// Signature over `batch_header_hash`.
    pub signature: Bytes,
    /// Blobs that were stored. All of them unless the per-blob rejection policy dropped some.
    pub accepted_blobs: Vec<BlobIndex>,
    /// `true` if an identical batch was already stored and nothing was written.
    pub already_stored: bool,
}

/// What the node can say about a batch key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    /// Stored and within custody.
    Stored {
        reference_block_number: u64,
        expires_at: u64,
        accepted_blobs: Vec<BlobIndex>,
    },
    /// Still on disk but past custody; the next expiry pass removes it.
    PastCustody {
        reference_block_number: u64,
        expired_at: u64,
    },
    /// Never stored, or already reclaimed.
    Unknown,
}

impl BatchStatus {
    /// Status of a stored batch at `current_block`.
    pub fn of_record(record: &BatchRecord, config: &NodeConfig, current_block: u64) -> Self {
        let reference_block_number = record.reference_block_number;
        let end = config.custody_end(reference_block_number);
        if config.is_expired(reference_block_number, current_block) {
            BatchStatus::PastCustody {
                reference_block_number,
                expired_at: end,
            }
        } else {
            BatchStatus::Stored {
                reference_block_number,
                expires_at: end,
                accepted_blobs: record.accepted_blobs.clone(),
            }
        }
    }
}

/// Per-batch async mutexes. Entries live only while someone holds or waits on them.
#[derive(Default)]
struct BatchLocks {
    locks: Mutex<HashMap<BatchHeaderHash, Arc<AsyncMutex<()>>>>,
}

struct BatchGuard<'a> {
    registry: &'a BatchLocks,
    hash: BatchHeaderHash,
    guard: Option<OwnedMutexGuard<()>>,
}

impl BatchLocks {
    async fn lock(&self, hash: BatchHeaderHash) -> BatchGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(hash).or_default())
        };
        BatchGuard {
            registry: self,
            hash,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .registry
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.hash)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.hash);
        }
    }
}

struct Inner<B: KvBackend> {
    config: NodeConfig,
    store: ChunkStore<B>,
    validator: BatchValidator,
    verifier: CommitmentVerifier,
    attestor: Attestor,
    assignments: Arc<dyn AssignmentSource>,
    chain: Arc<dyn ChainHeight>,
    locks: BatchLocks,
}

/// A custody node: validates, verifies, stores and attests dispersed batches.
#[derive(Clone)]
pub struct Node<B: KvBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: KvBackend> Node<B> {
    pub fn new(
        config: NodeConfig,
        backend: B,
        assignments: Arc<dyn AssignmentSource>,
        commitments: Arc<dyn CommitmentBackend>,
        signer: Arc<dyn Signer>,
        chain: Arc<dyn ChainHeight>,
    ) -> Self {
        let inner = Inner {
            store: ChunkStore::new(backend, config.storage_retry),
            validator: BatchValidator::new(&config),
            verifier: CommitmentVerifier::new(commitments),
            attestor: Attestor::new(signer),
            assignments,
            chain,
            locks: BatchLocks::default(),
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ChunkStore<B> {
        &self.inner.store
    }

    pub fn public_key(&self) -> Bytes {
        self.inner.attestor.public_key()
    }

    /// The read-only query surface over this node's store.
    pub fn retrieval(&self) -> RetrievalServer<B> {
        RetrievalServer::new(
            self.inner.store.clone(),
            Arc::clone(&self.inner.chain),
            self.inner.config.clone(),
        )
    }

    async fn current_block(&self) -> Result<u64> {
        self.inner
            .chain
            .current_block_number()
            .await
            .map_err(Error::Chain)
    }

    /// Validates, verifies and durably stores a batch, then signs its header hash.
    ///
    /// Calls for the same batch are serialized; a resubmission of a stored batch returns the
    /// same signature without writing anything.
    pub async fn store_chunks(
        &self,
        header: BatchHeader,
        blobs: Vec<Blob>,
    ) -> Result<StoreReceipt> {
        let hash = header.hash();
        let result = with_deadline(
            self.inner.config.request_timeout,
            self.store_chunks_locked(hash, header, blobs),
        )
        .await;
        match &result {
            Ok(receipt) if receipt.already_stored => {
                log::debug!("batch {} already stored", hash);
            }
            Ok(receipt) => {
                log::info!(
                    "stored batch {} ({} blobs accepted)",
                    hash,
                    receipt.accepted_blobs.len()
                );
            }
            Err(e) => log::warn!("rejected batch {}: {}", hash, e),
        }
        result
    }

    async fn store_chunks_locked(
        &self,
        hash: BatchHeaderHash,
        header: BatchHeader,
        blobs: Vec<Blob>,
    ) -> Result<StoreReceipt> {
        let inner = &self.inner;
        let _guard = inner.locks.lock(hash).await;

        let current = self.current_block().await?;
        let tree = inner.validator.validate_batch(&header, &blobs, current)?;
        let snapshot = inner
            .assignments
            .snapshot_at(header.reference_block_number)
            .await?;

        let structural = blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| {
                let index = i as BlobIndex;
                (index, inner.validator.validate_blob(index, blob, &snapshot))
            })
            .collect::<Vec<_>>();
        let candidates = inner.validator.apply_policy(structural)?;

        let blobs: Vec<Arc<Blob>> = blobs.into_iter().map(Arc::new).collect();
        let checks = candidates.iter().map(|&index| {
            let verifier = inner.verifier.clone();
            let blob = Arc::clone(&blobs[index as usize]);
            let snapshot = Arc::clone(&snapshot);
            async move {
                let result =
                    tokio::task::spawn_blocking(move || verifier.verify_blob(&blob, &snapshot))
                        .await
                        .unwrap_or_else(|e| {
                            Err(Error::Commitment(format!(
                                "verification of blob {} aborted: {}",
                                index, e
                            )))
                        });
                (index, result)
            }
        });
        let accepted = inner.validator.apply_policy(join_all(checks).await)?;

        let commit = BatchCommit::new(
            &header,
            tree,
            accepted
                .iter()
                .map(|&index| (index, Arc::clone(&blobs[index as usize])))
                .collect(),
        );
        let durable = inner.store.commit(commit).await?;
        let attestation = inner.attestor.attest(&durable);

        Ok(StoreReceipt {
            batch_header_hash: attestation.batch_header_hash,
            signature: attestation.signature,
            accepted_blobs: durable.accepted_blobs().to_vec(),
            already_stored: durable.already_stored(),
        })
    }

    /// Reports whether a batch is stored, and until when.
    pub async fn batch_status(&self, batch_header_hash: &BatchHeaderHash) -> Result<BatchStatus> {
        with_deadline(self.inner.config.request_timeout, async {
            match self.inner.store.batch_record(batch_header_hash).await? {
                Some(record) => {
                    let current = self.current_block().await?;
                    Ok(BatchStatus::of_record(&record, &self.inner.config, current))
                }
                None => Ok(BatchStatus::Unknown),
            }
        })
        .await
    }

    /// Runs one reclamation pass at the current chain height.
    ///
    /// Each batch is removed under its batch lock in one atomic delete.
    pub async fn expire_once(&self) -> Result<Vec<BatchHeaderHash>> {
        let current = self.current_block().await?;
        let expired = self
            .inner
            .store
            .expired_batches(current, self.inner.config.custody_period)
            .await?;

        let mut removed = Vec::with_capacity(expired.len());
        for (reference_block, hash) in expired {
            let _guard = self.inner.locks.lock(hash).await;
            if self.inner.store.remove_batch(&hash).await? {
                log::debug!(
                    "reclaimed batch {} (reference block {})",
                    hash,
                    reference_block
                );
                removed.push(hash);
            }
        }
        if !removed.is_empty() {
            log::info!("expired {} batches at block {}", removed.len(), current);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_batch_lock_serializes_and_cleans_up() -> anyhow::Result<()> {
        let locks = Arc::new(BatchLocks::default());
        let hash = BatchHeaderHash::default();

        let guard = locks.lock(hash).await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(hash).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await?;
        assert_eq!(locks.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_distinct_batches_do_not_block() -> anyhow::Result<()> {
        let locks = BatchLocks::default();
        let _a = locks.lock(BatchHeaderHash::default()).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(crate::types::Bytes32([1; 32])),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
        Ok(())
    }
}
