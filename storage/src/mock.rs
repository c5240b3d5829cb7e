// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::memory::MemoryBackend;
use crate::storage::{Error as StorageError, KvBackend, WriteOp};

/// Backend for tests: stores in memory and can be told to fail the next N reads or writes.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: MemoryBackend,
    fail_reads: Arc<AtomicUsize>,
    fail_writes: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls to [`KvBackend::write`] fail with an I/O error.
    pub fn fake_failed_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` calls to [`KvBackend::get`] or [`KvBackend::scan_prefix`] fail.
    pub fn fake_failed_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Number of write batches that reached the underlying store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvBackend for FakeBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        if Self::take_failure(&self.fail_reads) {
            return Err(StorageError::Io(anyhow::anyhow!("Simulated read failure")));
        }
        self.inner.get(key).await
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        if Self::take_failure(&self.fail_writes) {
            return Err(StorageError::Io(anyhow::anyhow!("Simulated write failure")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(ops).await
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StorageError> {
        if Self::take_failure(&self.fail_reads) {
            return Err(StorageError::Io(anyhow::anyhow!("Simulated read failure")));
        }
        self.inner.scan_prefix(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn test_write_and_read_through() -> Result<()> {
        let backend = FakeBackend::new();
        backend.write(vec![WriteOp::put("k", "v")]).await?;
        assert_eq!(backend.get(b"k").await?, Some(Bytes::from("v")));
        assert_eq!(backend.write_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_failed_writes() -> Result<()> {
        let backend = FakeBackend::new();
        backend.fake_failed_writes(2);

        for _ in 0..2 {
            let result = backend.write(vec![WriteOp::put("k", "v")]).await;
            assert!(matches!(result, Err(StorageError::Io(_))));
        }
        backend.write(vec![WriteOp::put("k", "v")]).await?;

        assert_eq!(backend.write_count(), 1);
        assert_eq!(backend.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_failed_reads() -> Result<()> {
        let backend = FakeBackend::new();
        backend.write(vec![WriteOp::put("k", "v")]).await?;
        backend.fake_failed_reads(1);

        let result = backend.get(b"k").await;
        assert!(matches!(&result, Err(e) if e.is_transient()));
        assert_eq!(backend.get(b"k").await?, Some(Bytes::from("v")));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() -> Result<()> {
        let backend = FakeBackend::new();
        backend.fake_failed_writes(1);
        let result = backend
            .write(vec![WriteOp::put("a", "1"), WriteOp::put("b", "2")])
            .await;
        assert!(result.is_err());
        assert!(backend.is_empty());
        Ok(())
    }
}
