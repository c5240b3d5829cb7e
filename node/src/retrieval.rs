// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use std::sync::Arc;

use custody_node_storage::KvBackend;

use crate::chain::ChainHeight;
use crate::chunk_store::{BatchRecord, ChunkStore};
use crate::config::NodeConfig;
use crate::error::{with_deadline, Error, Result};
use crate::merkle::MerkleProof;
use crate::types::{BatchHeaderHash, BlobHeader, BlobIndex, QuorumId};

/// Read-only query surface over the chunk store.
///
/// Reads never wait on in-flight stores. Every artifact of a batch appears and disappears in one
/// atomic backend write, so a read either sees the committed data or gets [`Error::NotFound`].
/// Batches past their custody window are not served even before the expiry pass removes them.
#[derive(Clone)]
pub struct RetrievalServer<B: KvBackend> {
    store: ChunkStore<B>,
    chain: Arc<dyn ChainHeight>,
    config: NodeConfig,
}

fn not_found(what: String) -> Error {
    log::debug!("retrieval miss: {}", what);
    Error::NotFound(what)
}

impl<B: KvBackend> RetrievalServer<B> {
    pub fn new(store: ChunkStore<B>, chain: Arc<dyn ChainHeight>, config: NodeConfig) -> Self {
        Self {
            store,
            chain,
            config,
        }
    }

    /// Loads the record of a batch still within custody at the current chain height.
    async fn live_record(&self, batch_header_hash: &BatchHeaderHash) -> Result<BatchRecord> {
        let record = self
            .store
            .batch_record(batch_header_hash)
            .await?
            .ok_or_else(|| not_found(format!("batch {}", batch_header_hash)))?;
        let current = self
            .chain
            .current_block_number()
            .await
            .map_err(Error::Chain)?;
        if self.config.is_expired(record.reference_block_number, current) {
            return Err(not_found(format!(
                "batch {} expired at block {}",
                batch_header_hash,
                self.config.custody_end(record.reference_block_number)
            )));
        }
        Ok(record)
    }

    /// Returns the chunks this node holds for `(batch, blob, quorum)`.
    pub async fn retrieve_chunks(
        &self,
        batch_header_hash: &BatchHeaderHash,
        blob_index: BlobIndex,
        quorum_id: QuorumId,
    ) -> Result<Vec<Bytes>> {
        with_deadline(self.config.request_timeout, async {
            self.live_record(batch_header_hash).await?;
            // may have been reclaimed since the record read
            self.store
                .get_bundle(batch_header_hash, blob_index, quorum_id)
                .await?
                .ok_or_else(|| {
                    not_found(format!(
                        "chunks for batch {} blob {} quorum {}",
                        batch_header_hash, blob_index, quorum_id
                    ))
                })
        })
        .await
    }

    /// Returns a blob header together with its inclusion proof against the batch root.
    ///
    /// `quorum_id` must be one of the quorums the blob was dispersed to.
    pub async fn get_blob_header(
        &self,
        batch_header_hash: &BatchHeaderHash,
        blob_index: BlobIndex,
        quorum_id: QuorumId,
    ) -> Result<(BlobHeader, MerkleProof)> {
        with_deadline(self.config.request_timeout, async {
            self.live_record(batch_header_hash).await?;
            let header = self
                .store
                .get_blob_header(batch_header_hash, blob_index)
                .await?
                .ok_or_else(|| {
                    not_found(format!(
                        "blob {} of batch {}",
                        blob_index, batch_header_hash
                    ))
                })?;
            if header.quorum_position(quorum_id).is_none() {
                return Err(not_found(format!(
                    "quorum {} in blob {} of batch {}",
                    quorum_id, blob_index, batch_header_hash
                )));
            }

            let tree = self
                .store
                .merkle_tree(batch_header_hash)
                .await?
                .ok_or_else(|| not_found(format!("batch {}", batch_header_hash)))?;
            let proof = tree
                .proof(blob_index as usize)
                .map_err(|e| not_found(format!("batch {}: {}", batch_header_hash, e)))?;
            Ok((header, proof))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{AssignmentSnapshot, QuorumAssignment};
    use crate::chain::ManualChainHeight;
    use crate::chunk_store::BatchCommit;
    use crate::config::RetryPolicy;
    use crate::merkle::MerkleTree;
    use crate::testutils::{batch_header, quorum_info, BlobSpec};
    use crate::types::{Blob, Bytes32};
    use anyhow::Result;
    use custody_node_storage::memory::MemoryBackend;

    const REFERENCE_BLOCK: u64 = 7;
    const CUSTODY: u64 = 50;

    struct Fixture {
        server: RetrievalServer<MemoryBackend>,
        chain: Arc<ManualChainHeight>,
        hash: BatchHeaderHash,
        blobs: Vec<Blob>,
    }

    async fn server_with_batch() -> Result<Fixture> {
        let snapshot = AssignmentSnapshot::new(1, 0).with_quorum(
            0,
            QuorumAssignment {
                start_slot: 0,
                num_slots: 2,
                total_slots: 4,
            },
        );
        let blobs: Vec<Blob> = (1..=3)
            .map(|seed| {
                BlobSpec::new(seed, 16)
                    .quorum(quorum_info(0))
                    .quorum(quorum_info(2))
                    .build(&snapshot)
            })
            .collect();
        let header = batch_header(&blobs, REFERENCE_BLOCK);
        let leaves: Vec<_> = blobs.iter().map(|b| b.header.hash()).collect();
        let commit = BatchCommit::new(
            &header,
            MerkleTree::build(&leaves)?,
            blobs
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, b)| (i as BlobIndex, Arc::new(b)))
                .collect(),
        );
        let store = ChunkStore::new(MemoryBackend::new(), RetryPolicy::default());
        store.commit(commit).await?;
        let chain = Arc::new(ManualChainHeight::new(REFERENCE_BLOCK));
        let server = RetrievalServer::new(store, chain.clone(), NodeConfig::new(CUSTODY));
        Ok(Fixture {
            server,
            chain,
            hash: header.hash(),
            blobs,
        })
    }

    #[tokio::test]
    async fn test_retrieve_chunks() -> Result<()> {
        let Fixture {
            server, hash, blobs, ..
        } = server_with_batch().await?;
        let chunks = server.retrieve_chunks(&hash, 2, 0).await?;
        assert_eq!(chunks, blobs[2].bundles[0]);

        // quorum 2 is in the header but this node holds nothing for it
        assert!(server.retrieve_chunks(&hash, 2, 2).await.unwrap_err().is_not_found());
        assert!(server.retrieve_chunks(&hash, 3, 0).await.unwrap_err().is_not_found());
        assert!(server
            .retrieve_chunks(&Bytes32([9; 32]), 0, 0)
            .await
            .unwrap_err()
            .is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_blob_header_with_proof() -> Result<()> {
        let Fixture {
            server, hash, blobs, ..
        } = server_with_batch().await?;
        let root = batch_header(&blobs, REFERENCE_BLOCK).batch_root;
        for index in 0..3u32 {
            let (header, proof) = server.get_blob_header(&hash, index, 2).await?;
            assert_eq!(header, blobs[index as usize].header);
            assert_eq!(proof.index, index);
            assert!(proof.verify(header.hash(), &root));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_blob_header_not_found() -> Result<()> {
        let Fixture { server, hash, .. } = server_with_batch().await?;
        assert!(server.get_blob_header(&hash, 0, 1).await.unwrap_err().is_not_found());
        assert!(server.get_blob_header(&hash, 3, 0).await.unwrap_err().is_not_found());
        assert!(server
            .get_blob_header(&Bytes32::default(), 0, 0)
            .await
            .unwrap_err()
            .is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_served_past_custody() -> Result<()> {
        let Fixture {
            server,
            chain,
            hash,
            ..
        } = server_with_batch().await?;

        chain.set(REFERENCE_BLOCK + CUSTODY - 1);
        assert!(server.retrieve_chunks(&hash, 0, 0).await.is_ok());
        assert!(server.get_blob_header(&hash, 0, 0).await.is_ok());

        // still on disk, but the window has closed
        chain.set(REFERENCE_BLOCK + CUSTODY);
        assert!(server.store.batch_record(&hash).await?.is_some());
        assert!(server.retrieve_chunks(&hash, 0, 0).await.unwrap_err().is_not_found());
        assert!(server.get_blob_header(&hash, 0, 0).await.unwrap_err().is_not_found());
        Ok(())
    }
}
