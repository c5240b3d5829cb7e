// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::types::QuorumId;

/// This node's share of one quorum's chunk space.
///
/// A quorum's chunk space is divided into `total_slots` slots; each slot expands to
/// `quantization_factor` chunks of the blob being dispersed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumAssignment {
    pub start_slot: u32,
    pub num_slots: u32,
    pub total_slots: u32,
}

impl QuorumAssignment {
    /// Total number of chunks the blob is split into for this quorum.
    pub fn total_chunks(&self, quantization_factor: u32) -> u64 {
        u64::from(self.total_slots) * u64::from(quantization_factor)
    }

    /// Number of chunks this node must receive.
    pub fn num_chunks(&self, quantization_factor: u32) -> u64 {
        u64::from(self.num_slots) * u64::from(quantization_factor)
    }

    /// Chunk indices this node must receive, in bundle order.
    pub fn chunk_indices(&self, quantization_factor: u32) -> Range<u64> {
        let start = u64::from(self.start_slot) * u64::from(quantization_factor);
        start..start + self.num_chunks(quantization_factor)
    }
}

/// This node's assignments as of one chain height. Immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentSnapshot {
    /// Monotonic version, bumped on every refresh.
    pub version: u64,
    /// First block the snapshot applies to.
    pub effective_from: u64,
    pub quorums: BTreeMap<QuorumId, QuorumAssignment>,
}

impl AssignmentSnapshot {
    pub fn new(version: u64, effective_from: u64) -> Self {
        Self {
            version,
            effective_from,
            quorums: BTreeMap::new(),
        }
    }

    pub fn with_quorum(mut self, quorum_id: QuorumId, assignment: QuorumAssignment) -> Self {
        self.quorums.insert(quorum_id, assignment);
        self
    }

    /// Resolves this node's assignment for `quorum_id`, if it belongs to the quorum.
    pub fn assignment(&self, quorum_id: QuorumId) -> Option<&QuorumAssignment> {
        self.quorums.get(&quorum_id)
    }

    pub fn is_assigned(&self, quorum_id: QuorumId) -> bool {
        self.quorums.contains_key(&quorum_id)
    }
}

/// Source of assignment snapshots keyed by chain height.
///
/// Implemented by whatever tracks the on-chain operator registry. A store call resolves one
/// snapshot for its reference block and uses that same snapshot throughout.
#[async_trait]
pub trait AssignmentSource: Send + Sync {
    async fn snapshot_at(&self, block_number: u64) -> Result<Arc<AssignmentSnapshot>>;
}

/// Holds published snapshots in memory, ordered by the block they take effect at.
#[derive(Default)]
pub struct SnapshotRegistry {
    snapshots: RwLock<BTreeMap<u64, Arc<AssignmentSnapshot>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a snapshot. A snapshot for the same starting block only replaces the current
    /// one if its version is newer.
    pub fn publish(&self, snapshot: AssignmentSnapshot) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match snapshots.get(&snapshot.effective_from) {
            Some(current) if current.version >= snapshot.version => {
                log::warn!(
                    "ignoring assignment snapshot v{} for block {}: v{} already published",
                    snapshot.version,
                    snapshot.effective_from,
                    current.version
                );
            }
            _ => {
                log::info!(
                    "published assignment snapshot v{} effective from block {}",
                    snapshot.version,
                    snapshot.effective_from
                );
                snapshots.insert(snapshot.effective_from, Arc::new(snapshot));
            }
        }
    }

    /// Drops snapshots fully superseded before `block_number`, keeping the one in effect.
    pub fn prune_before(&self, block_number: u64) {
        let mut snapshots = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some((&in_effect, _)) = snapshots.range(..=block_number).next_back() {
            snapshots.retain(|&from, _| from >= in_effect);
        }
    }

    pub fn resolve(&self, block_number: u64) -> Option<Arc<AssignmentSnapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .range(..=block_number)
            .next_back()
            .map(|(_, snapshot)| Arc::clone(snapshot))
    }
}

#[async_trait]
impl AssignmentSource for SnapshotRegistry {
    async fn snapshot_at(&self, block_number: u64) -> Result<Arc<AssignmentSnapshot>> {
        self.resolve(block_number).ok_or_else(|| {
            Error::Assignment(format!(
                "no assignment snapshot covers block {}",
                block_number
            ))
        })
    }
}
