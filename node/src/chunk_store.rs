// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Custody-bounded persistence of validated batches.
//!
//! Key layout (all integers big-endian):
//!
//! | key | value |
//! |---|---|
//! | `b/` hash | [`BatchRecord`] as JSON |
//! | `h/` hash blob_index(u32) | [`BlobHeader`] as JSON |
//! | `c/` hash blob_index(u32) quorum(u8) | encoded bundle |
//! | `m/` hash | Merkle arena |
//! | `x/` reference_block(u64) hash | empty; expiry index |
//!
//! Everything belonging to a batch is written in one atomic backend write and removed in one
//! atomic backend write, so readers see a batch either whole or not at all.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::future::Future;
use std::sync::Arc;

use custody_node_storage::{Error as StorageError, KvBackend, WriteOp};

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::merkle::MerkleTree;
use crate::types::{
    BatchHeader, BatchHeaderHash, Blob, BlobHeader, BlobIndex, Bundle, Bytes32, QuorumId,
};

const BATCH_PREFIX: &[u8] = b"b/";
const HEADER_PREFIX: &[u8] = b"h/";
const BUNDLE_PREFIX: &[u8] = b"c/";
const MERKLE_PREFIX: &[u8] = b"m/";
const EXPIRY_PREFIX: &[u8] = b"x/";

fn key(prefix: &[u8], hash: &BatchHeaderHash, suffix: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(prefix.len() + Bytes32::LEN + suffix.len());
    buf.put_slice(prefix);
    buf.put_slice(hash.as_bytes());
    buf.put_slice(suffix);
    buf.freeze()
}

fn batch_key(hash: &BatchHeaderHash) -> Bytes {
    key(BATCH_PREFIX, hash, &[])
}

fn header_key(hash: &BatchHeaderHash, blob_index: BlobIndex) -> Bytes {
    key(HEADER_PREFIX, hash, &blob_index.to_be_bytes())
}

fn bundle_key(hash: &BatchHeaderHash, blob_index: BlobIndex, quorum_id: QuorumId) -> Bytes {
    let mut suffix = [0u8; 5];
    suffix[..4].copy_from_slice(&blob_index.to_be_bytes());
    suffix[4] = quorum_id;
    key(BUNDLE_PREFIX, hash, &suffix)
}

fn merkle_key(hash: &BatchHeaderHash) -> Bytes {
    key(MERKLE_PREFIX, hash, &[])
}

fn expiry_key(reference_block_number: u64, hash: &BatchHeaderHash) -> Bytes {
    let mut buf = BytesMut::with_capacity(EXPIRY_PREFIX.len() + 8 + Bytes32::LEN);
    buf.put_slice(EXPIRY_PREFIX);
    buf.put_u64(reference_block_number);
    buf.put_slice(hash.as_bytes());
    buf.freeze()
}

fn parse_expiry_key(key: &[u8]) -> Option<(u64, BatchHeaderHash)> {
    let rest = key.strip_prefix(EXPIRY_PREFIX)?;
    if rest.len() != 8 + Bytes32::LEN {
        return None;
    }
    let block = u64::from_be_bytes(rest[..8].try_into().ok()?);
    Some((block, Bytes32::from_slice(&rest[8..])?))
}

fn corrupted(key: &[u8], reason: impl ToString) -> Error {
    Error::Storage(StorageError::Corrupted(hex::encode(key), reason.to_string()))
}

/// Encodes a bundle as `count(u32) chunk_len(u32) chunk*`.
pub fn encode_bundle(bundle: &[Bytes]) -> Bytes {
    let chunk_len = bundle.first().map_or(0, Bytes::len);
    let mut buf = BytesMut::with_capacity(8 + bundle.len() * chunk_len);
    buf.put_u32(bundle.len() as u32);
    buf.put_u32(chunk_len as u32);
    for chunk in bundle {
        buf.put_slice(chunk);
    }
    buf.freeze()
}

pub fn decode_bundle(mut bytes: Bytes) -> Result<Bundle, String> {
    if bytes.len() < 8 {
        return Err("bundle header truncated".to_string());
    }
    let count = bytes.get_u32() as usize;
    let chunk_len = bytes.get_u32() as usize;
    if count.checked_mul(chunk_len) != Some(bytes.len()) {
        return Err(format!(
            "bundle of {} chunks of {} bytes has {} data bytes",
            count,
            chunk_len,
            bytes.len()
        ));
    }
    Ok((0..count).map(|_| bytes.split_to(chunk_len)).collect())
}

/// What the node remembers about a stored batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_root: Bytes32,
    pub reference_block_number: u64,
    pub blob_count: u32,
    /// Blobs whose bundles were stored. Every blob unless blobs were dropped under the
    /// per-blob rejection policy.
    pub accepted_blobs: Vec<BlobIndex>,
    /// Digest over all stored headers and chunks, used to detect identical resubmissions.
    pub content_digest: Bytes32,
}

/// Everything a successful store call persists for one batch.
pub struct BatchCommit {
    header: BatchHeader,
    batch_header_hash: BatchHeaderHash,
    tree: MerkleTree,
    blobs: Vec<(BlobIndex, Arc<Blob>)>,
    content_digest: Bytes32,
}

impl BatchCommit {
    /// `blobs` holds the accepted blobs with their batch positions, in ascending order.
    pub fn new(header: &BatchHeader, tree: MerkleTree, blobs: Vec<(BlobIndex, Arc<Blob>)>) -> Self {
        let batch_header_hash = header.hash();
        let mut hasher = Keccak256::new();
        hasher.update(batch_header_hash.as_bytes());
        for (index, blob) in &blobs {
            hasher.update(index.to_be_bytes());
            hasher.update(blob.header.hash().as_bytes());
            for (quorum, bundle) in blob.header.quorum_headers.iter().zip(&blob.bundles) {
                hasher.update([quorum.quorum_id]);
                hasher.update((bundle.len() as u32).to_be_bytes());
                for chunk in bundle {
                    hasher.update((chunk.len() as u32).to_be_bytes());
                    hasher.update(chunk);
                }
            }
        }
        Self {
            header: header.clone(),
            batch_header_hash,
            tree,
            blobs,
            content_digest: Bytes32(hasher.finalize().into()),
        }
    }

    pub fn batch_header_hash(&self) -> BatchHeaderHash {
        self.batch_header_hash
    }

    pub fn content_digest(&self) -> Bytes32 {
        self.content_digest
    }

    pub fn accepted_blobs(&self) -> Vec<BlobIndex> {
        self.blobs.iter().map(|(index, _)| *index).collect()
    }

    fn record(&self) -> BatchRecord {
        BatchRecord {
            batch_root: self.header.batch_root,
            reference_block_number: self.header.reference_block_number,
            blob_count: self.tree.leaf_count() as u32,
            accepted_blobs: self.accepted_blobs(),
            content_digest: self.content_digest,
        }
    }

    fn write_ops(&self) -> Result<Vec<WriteOp>> {
        let hash = &self.batch_header_hash;
        let record = serde_json::to_vec(&self.record())
            .map_err(|e| Error::Storage(StorageError::Other(e.into())))?;

        let mut ops = vec![
            WriteOp::put(batch_key(hash), record),
            WriteOp::put(merkle_key(hash), self.tree.to_bytes()),
            WriteOp::put(
                expiry_key(self.header.reference_block_number, hash),
                Bytes::new(),
            ),
        ];
        for (index, blob) in &self.blobs {
            let header = serde_json::to_vec(&blob.header)
                .map_err(|e| Error::Storage(StorageError::Other(e.into())))?;
            ops.push(WriteOp::put(header_key(hash, *index), header));
            for (quorum, bundle) in blob.header.quorum_headers.iter().zip(&blob.bundles) {
                if bundle.is_empty() {
                    continue;
                }
                ops.push(WriteOp::put(
                    bundle_key(hash, *index, quorum.quorum_id),
                    encode_bundle(bundle),
                ));
            }
        }
        Ok(ops)
    }
}

/// Acknowledgement that a batch is durably stored. Only [`ChunkStore::commit`] creates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableCommit {
    batch_header_hash: BatchHeaderHash,
    accepted_blobs: Vec<BlobIndex>,
    already_stored: bool,
}

impl DurableCommit {
    pub fn batch_header_hash(&self) -> BatchHeaderHash {
        self.batch_header_hash
    }

    pub fn accepted_blobs(&self) -> &[BlobIndex] {
        &self.accepted_blobs
    }

    /// `true` if the batch was already stored with identical content and nothing was written.
    pub fn already_stored(&self) -> bool {
        self.already_stored
    }
}

/// Custody store over a key-value backend.
#[derive(Clone)]
pub struct ChunkStore<B: KvBackend> {
    backend: B,
    retry: RetryPolicy,
}

impl<B: KvBackend> ChunkStore<B> {
    pub fn new(backend: B, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt,
                        self.retry.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn load(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let backend = &self.backend;
        Ok(self.with_retry("read", || backend.get(key)).await?)
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.load(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupted(key, e)),
            None => Ok(None),
        }
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<()> {
        let backend = &self.backend;
        Ok(self
            .with_retry("write", || backend.write(ops.clone()))
            .await?)
    }

    pub async fn batch_record(&self, hash: &BatchHeaderHash) -> Result<Option<BatchRecord>> {
        self.load_json(&batch_key(hash)).await
    }

    /// Durably writes every artifact of a batch in one atomic write.
    ///
    /// Resubmitting identical content is a no-op success. Different content under an existing
    /// batch key is rejected.
    pub async fn commit(&self, commit: BatchCommit) -> Result<DurableCommit> {
        let hash = commit.batch_header_hash();
        if let Some(existing) = self.batch_record(&hash).await? {
            if existing.content_digest != commit.content_digest() {
                return Err(Error::Validation(format!(
                    "batch {} already stored with different content",
                    hash
                )));
            }
            log::debug!("batch {} already stored, skipping write", hash);
            return Ok(DurableCommit {
                batch_header_hash: hash,
                accepted_blobs: existing.accepted_blobs,
                already_stored: true,
            });
        }

        let ops = commit.write_ops()?;
        let num_ops = ops.len();
        self.write(ops).await?;
        log::debug!("batch {} committed ({} keys)", hash, num_ops);
        Ok(DurableCommit {
            batch_header_hash: hash,
            accepted_blobs: commit.accepted_blobs(),
            already_stored: false,
        })
    }

    pub async fn get_bundle(
        &self,
        hash: &BatchHeaderHash,
        blob_index: BlobIndex,
        quorum_id: QuorumId,
    ) -> Result<Option<Bundle>> {
        let key = bundle_key(hash, blob_index, quorum_id);
        match self.load(&key).await? {
            Some(bytes) => decode_bundle(bytes)
                .map(Some)
                .map_err(|e| corrupted(&key, e)),
            None => Ok(None),
        }
    }

    pub async fn get_blob_header(
        &self,
        hash: &BatchHeaderHash,
        blob_index: BlobIndex,
    ) -> Result<Option<BlobHeader>> {
        self.load_json(&header_key(hash, blob_index)).await
    }

    pub async fn merkle_tree(&self, hash: &BatchHeaderHash) -> Result<Option<MerkleTree>> {
        let key = merkle_key(hash);
        match self.load(&key).await? {
            Some(bytes) => MerkleTree::from_bytes(bytes)
                .map(Some)
                .map_err(|e| corrupted(&key, e)),
            None => Ok(None),
        }
    }

    /// Batches whose custody window has elapsed at `current_block`, oldest first.
    pub async fn expired_batches(
        &self,
        current_block: u64,
        custody_period: u64,
    ) -> Result<Vec<(u64, BatchHeaderHash)>> {
        let backend = &self.backend;
        let entries = self
            .with_retry("scan", || backend.scan_prefix(EXPIRY_PREFIX))
            .await?;
        let mut expired = Vec::new();
        for (key, _) in entries {
            let Some((reference_block, hash)) = parse_expiry_key(&key) else {
                log::warn!("skipping malformed expiry key {}", hex::encode(&key));
                continue;
            };
            if reference_block.saturating_add(custody_period) > current_block {
                // keys are ordered by reference block
                break;
            }
            expired.push((reference_block, hash));
        }
        Ok(expired)
    }

    /// Atomically deletes everything stored for a batch. Returns `false` if it was not stored.
    pub async fn remove_batch(&self, hash: &BatchHeaderHash) -> Result<bool> {
        let Some(record) = self.batch_record(hash).await? else {
            return Ok(false);
        };
        let backend = &self.backend;
        let header_prefix = key(HEADER_PREFIX, hash, &[]);
        let bundle_prefix = key(BUNDLE_PREFIX, hash, &[]);
        let headers = self
            .with_retry("scan", || backend.scan_prefix(&header_prefix))
            .await?;
        let bundles = self
            .with_retry("scan", || backend.scan_prefix(&bundle_prefix))
            .await?;

        let mut ops: Vec<WriteOp> = headers
            .into_iter()
            .chain(bundles)
            .map(|(key, _)| WriteOp::delete(key))
            .collect();
        ops.push(WriteOp::delete(merkle_key(hash)));
        ops.push(WriteOp::delete(expiry_key(record.reference_block_number, hash)));
        ops.push(WriteOp::delete(batch_key(hash)));
        self.write(ops).await?;
        Ok(true)
    }

    /// Removes every batch past its custody window. Returns the removed batch hashes.
    pub async fn expire(
        &self,
        current_block: u64,
        custody_period: u64,
    ) -> Result<Vec<BatchHeaderHash>> {
        let mut removed = Vec::new();
        for (_, hash) in self.expired_batches(current_block, custody_period).await? {
            if self.remove_batch(&hash).await? {
                removed.push(hash);
            }
        }
        if !removed.is_empty() {
            log::info!(
                "expired {} batches at block {}",
                removed.len(),
                current_block
            );
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::{AssignmentSnapshot, QuorumAssignment};
    use crate::testutils::{batch_header, quorum_info, BlobSpec};
    use anyhow::Result;
    use custody_node_storage::mock::FakeBackend;
    use std::time::Duration;

    fn snapshot() -> AssignmentSnapshot {
        AssignmentSnapshot::new(1, 0).with_quorum(
            0,
            QuorumAssignment {
                start_slot: 0,
                num_slots: 1,
                total_slots: 4,
            },
        )
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
        }
    }

    fn commit_for(seeds: &[u8], reference_block: u64) -> BatchCommit {
        let snapshot = snapshot();
        let blobs: Vec<Blob> = seeds
            .iter()
            .map(|&seed| BlobSpec::new(seed, 16).quorum(quorum_info(0)).build(&snapshot))
            .collect();
        let header = batch_header(&blobs, reference_block);
        let leaves: Vec<_> = blobs.iter().map(|b| b.header.hash()).collect();
        let tree = MerkleTree::build(&leaves).unwrap();
        let blobs = blobs
            .into_iter()
            .enumerate()
            .map(|(i, blob)| (i as BlobIndex, Arc::new(blob)))
            .collect();
        BatchCommit::new(&header, tree, blobs)
    }

    #[test]
    fn test_bundle_codec() {
        let bundle = vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")];
        assert_eq!(decode_bundle(encode_bundle(&bundle)).unwrap(), bundle);
        assert!(decode_bundle(Bytes::from_static(&[0, 0, 0, 2, 0, 0, 0, 4, 1])).is_err());
        assert!(decode_bundle(encode_bundle(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_expiry_key_orders_by_block() {
        let hash = Bytes32([0xFF; 32]);
        let early = expiry_key(9, &hash);
        let late = expiry_key(256, &Bytes32([0; 32]));
        assert!(early < late);
        assert_eq!(parse_expiry_key(&early), Some((9, hash)));
    }

    #[tokio::test]
    async fn test_commit_and_read_back() -> Result<()> {
        let store = ChunkStore::new(FakeBackend::new(), fast_retry());
        let commit = commit_for(&[1, 2], 10);
        let hash = commit.batch_header_hash();
        let expected = commit.blobs[1].1.bundles[0].clone();

        let durable = store.commit(commit).await?;
        assert!(!durable.already_stored());
        assert_eq!(durable.accepted_blobs(), &[0, 1]);

        assert_eq!(store.get_bundle(&hash, 1, 0).await?, Some(expected));
        assert_eq!(store.get_bundle(&hash, 1, 5).await?, None);
        assert_eq!(store.get_bundle(&hash, 2, 0).await?, None);
        let record = store.batch_record(&hash).await?.unwrap();
        assert_eq!(record.blob_count, 2);
        assert_eq!(record.reference_block_number, 10);
        let tree = store.merkle_tree(&hash).await?.unwrap();
        assert_eq!(tree.root(), record.batch_root);
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_commit_is_noop() -> Result<()> {
        let backend = FakeBackend::new();
        let store = ChunkStore::new(backend.clone(), fast_retry());
        store.commit(commit_for(&[1], 10)).await?;
        let keys = backend.len();

        let again = store.commit(commit_for(&[1], 10)).await?;
        assert!(again.already_stored());
        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.len(), keys);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflicting_commit_is_rejected() -> Result<()> {
        let store = ChunkStore::new(FakeBackend::new(), fast_retry());
        let first = commit_for(&[1], 10);
        let hash = first.batch_header_hash();
        store.commit(first).await?;

        // same batch key, different chunk bytes
        let mut other = commit_for(&[1], 10);
        let mut blob = (*other.blobs[0].1).clone();
        blob.bundles[0][0] = Bytes::from(vec![0u8; blob.bundles[0][0].len()]);
        other.blobs[0].1 = Arc::new(blob);
        let other = BatchCommit::new(&other.header, other.tree, other.blobs);
        assert_eq!(other.batch_header_hash(), hash);

        let err = store.commit(other).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() -> Result<()> {
        let backend = FakeBackend::new();
        let store = ChunkStore::new(backend.clone(), fast_retry());
        backend.fake_failed_writes(2);

        let commit = commit_for(&[1], 10);
        let hash = commit.batch_header_hash();
        store.commit(commit).await?;
        assert!(store.batch_record(&hash).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_write_failure_surfaces_and_stores_nothing() -> Result<()> {
        let backend = FakeBackend::new();
        let store = ChunkStore::new(backend.clone(), fast_retry());
        backend.fake_failed_writes(3);

        let err = store.commit(commit_for(&[1], 10)).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(backend.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_expire_removes_only_elapsed_batches() -> Result<()> {
        let backend = FakeBackend::new();
        let store = ChunkStore::new(backend.clone(), fast_retry());
        let old = commit_for(&[1, 2], 10);
        let old_hash = old.batch_header_hash();
        let fresh = commit_for(&[3], 50);
        let fresh_hash = fresh.batch_header_hash();
        store.commit(old).await?;
        store.commit(fresh).await?;

        assert!(store.expire(59, 50).await?.is_empty());
        assert_eq!(store.expire(60, 50).await?, vec![old_hash]);

        assert_eq!(store.batch_record(&old_hash).await?, None);
        assert_eq!(store.get_bundle(&old_hash, 0, 0).await?, None);
        assert_eq!(store.get_blob_header(&old_hash, 1).await?, None);
        assert!(store.merkle_tree(&old_hash).await?.is_none());
        assert!(store.get_bundle(&fresh_hash, 0, 0).await?.is_some());

        store.expire(100, 50).await?;
        assert!(backend.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_unknown_batch() -> Result<()> {
        let store = ChunkStore::new(FakeBackend::new(), fast_retry());
        assert!(!store.remove_batch(&Bytes32([1; 32])).await?);
        Ok(())
    }
}
