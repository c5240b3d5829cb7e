// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! # Custody Node Storage Library
//!
//! Key-value persistence for the custody node. The node never talks to a database directly; it
//! goes through the [`KvBackend`](storage::KvBackend) trait, which offers point reads, atomic and
//! durable write batches, and snapshot-consistent prefix scans.
//!
//! ## Modules
//!
//! - [`storage`](storage): Defines the backend trait, write operations and the error type.
//! - [`memory`](memory): An in-memory backend.
//! - [`rocks`](rocks): A RocksDB backend (feature `rocksdb-backend`).
//! - [`mock`](mock): A failure-injecting backend for tests (feature `mock`).
//!
//! ### Example
//!
//! ```rust
//! use custody_node_storage::{memory::MemoryBackend, KvBackend, WriteOp};
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let backend = MemoryBackend::new();
//!     backend
//!         .write(vec![WriteOp::put("batch/1", "record"), WriteOp::put("batch/2", "record")])
//!         .await
//!         .unwrap();
//!     let batches = backend.scan_prefix(b"batch/").await.unwrap();
//!     assert_eq!(batches.len(), 2);
//! });
//! ```

pub mod memory;
pub mod storage;
pub use storage::*;

#[cfg(feature = "rocksdb-backend")]
pub mod rocks;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
