// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use bytes::Bytes;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use std::sync::Arc;

use crate::storage::{Error as StorageError, KvBackend, WriteOp};

/// RocksDB-backed persistent store.
///
/// Every write batch is applied with `sync` enabled, so a successful [`KvBackend::write`] means
/// the batch reached stable storage. Prefix scans read from a snapshot.
#[derive(Clone)]
pub struct RocksBackend {
    db: Arc<DB>,
}

impl std::fmt::Debug for RocksBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksBackend")
            .field("path", &self.db.path())
            .finish()
    }
}

fn io_error(e: rocksdb::Error) -> StorageError {
    StorageError::Io(e.into())
}

impl RocksBackend {
    /// Opens (creating if needed) a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(io_error)?;
        log::info!("opened store at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    /// Opens an existing database without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(false);
        let db = DB::open_for_read_only(&opts, path.as_ref(), false).map_err(io_error)?;
        log::debug!("opened store at {} read-only", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl KvBackend for RocksBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError> {
        self.db
            .get(key)
            .map(|value| value.map(Bytes::from))
            .map_err(io_error)
    }

    async fn write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { key, value } => batch.put(key, value),
                WriteOp::Delete { key } => batch.delete(key),
            }
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).map_err(io_error)
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>, StorageError> {
        let snapshot = self.db.snapshot();
        let mut found = Vec::new();
        for item in snapshot.iterator(IteratorMode::From(prefix, Direction::Forward)) {
            let (key, value) = item.map_err(io_error)?;
            if !key.starts_with(prefix) {
                break;
            }
            found.push((Bytes::from(key.into_vec()), Bytes::from(value.into_vec())));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn test_write_and_get() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = RocksBackend::open(dir.path())?;
        backend
            .write(vec![WriteOp::put("a", "1"), WriteOp::put("b", "2")])
            .await?;

        assert_eq!(backend.get(b"a").await?, Some(Bytes::from("1")));
        assert_eq!(backend.get(b"missing").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_in_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = RocksBackend::open(dir.path())?;
        backend.write(vec![WriteOp::put("a", "1")]).await?;
        backend
            .write(vec![WriteOp::delete("a"), WriteOp::put("b", "2")])
            .await?;

        assert_eq!(backend.get(b"a").await?, None);
        assert_eq!(backend.get(b"b").await?, Some(Bytes::from("2")));
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_prefix() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = RocksBackend::open(dir.path())?;
        backend
            .write(vec![
                WriteOp::put("x/1", "a"),
                WriteOp::put("x/2", "b"),
                WriteOp::put("y/1", "c"),
            ])
            .await?;

        let found = backend.scan_prefix(b"x/").await?;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0, Bytes::from("x/1"));
        assert_eq!(found[1].1, Bytes::from("b"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let backend = RocksBackend::open(dir.path())?;
            backend.write(vec![WriteOp::put("k", "v")]).await?;
        }
        let backend = RocksBackend::open_read_only(dir.path())?;
        assert_eq!(backend.get(b"k").await?, Some(Bytes::from("v")));
        Ok(())
    }
}
