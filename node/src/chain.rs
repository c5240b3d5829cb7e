// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// The node's view of the current chain height.
#[async_trait]
pub trait ChainHeight: Send + Sync {
    async fn current_block_number(&self) -> anyhow::Result<u64>;
}

/// A chain height that only moves when told to. Used by the CLI and in tests.
#[derive(Debug, Default)]
pub struct ManualChainHeight {
    height: AtomicU64,
}

impl ManualChainHeight {
    pub fn new(height: u64) -> Self {
        Self {
            height: AtomicU64::new(height),
        }
    }

    pub fn set(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn advance(&self, blocks: u64) -> u64 {
        self.height.fetch_add(blocks, Ordering::SeqCst) + blocks
    }
}

#[async_trait]
impl ChainHeight for ManualChainHeight {
    async fn current_block_number(&self) -> anyhow::Result<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}
