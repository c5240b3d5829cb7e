// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a batch when some of its blobs fail validation or verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Any failing blob rejects the whole batch. Nothing is stored or signed.
    #[default]
    WholeBatch,
    /// Failing blobs are dropped; the remaining blobs are stored and the batch is attested.
    /// If every blob fails, the batch is rejected with the first failure.
    PerBlob,
}

/// Bounded retry with exponential backoff for backend I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubled for every further attempt.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Configuration for the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of blocks a batch must be retained after its reference block.
    pub custody_period: u64,
    /// How far behind the node's current height a batch's reference block may be.
    pub max_reference_block_lag: u64,
    /// How far ahead of the node's current height a batch's reference block may be.
    pub max_reference_block_lead: u64,
    /// Deadline for every store and retrieval call.
    pub request_timeout: Duration,
    pub rejection_policy: RejectionPolicy,
    pub storage_retry: RetryPolicy,
    /// Period of the background expiry pass.
    pub expiry_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            custody_period: 100_800,
            max_reference_block_lag: 150,
            max_reference_block_lead: 5,
            request_timeout: Duration::from_secs(30),
            rejection_policy: RejectionPolicy::WholeBatch,
            storage_retry: RetryPolicy::default(),
            expiry_interval: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Creates a new `NodeConfig` with the given custody period. The rest of the parameters are
    /// set to their default values.
    pub fn new(custody_period: u64) -> Self {
        Self {
            custody_period,
            ..Self::default()
        }
    }

    /// First block at which a batch referencing `reference_block_number` is no longer served.
    pub fn custody_end(&self, reference_block_number: u64) -> u64 {
        reference_block_number.saturating_add(self.custody_period)
    }

    /// Whether a batch referencing `reference_block_number` is past custody at `current_block`.
    pub fn is_expired(&self, reference_block_number: u64, current_block: u64) -> bool {
        current_block >= self.custody_end(reference_block_number)
    }
}
