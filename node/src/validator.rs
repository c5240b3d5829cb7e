// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::HashSet;

use crate::assignment::AssignmentSnapshot;
use crate::config::{NodeConfig, RejectionPolicy};
use crate::error::{Error, Result};
use crate::merkle::MerkleTree;
use crate::types::{BatchHeader, Blob, BlobIndex};

/// Structural and assignment checks run before any cryptography.
#[derive(Debug, Clone, Copy)]
pub struct BatchValidator {
    max_lag: u64,
    max_lead: u64,
    policy: RejectionPolicy,
}

impl BatchValidator {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            max_lag: config.max_reference_block_lag,
            max_lead: config.max_reference_block_lead,
            policy: config.rejection_policy,
        }
    }

    pub fn policy(&self) -> RejectionPolicy {
        self.policy
    }

    /// Batch-wide checks. Their failures always reject the whole batch.
    ///
    /// Returns the Merkle tree rebuilt from the blob headers.
    pub fn validate_batch(
        &self,
        header: &BatchHeader,
        blobs: &[Blob],
        current_block: u64,
    ) -> Result<MerkleTree> {
        if blobs.is_empty() {
            return Err(Error::Validation("batch has no blobs".to_string()));
        }
        if blobs.len() > BlobIndex::MAX as usize {
            return Err(Error::Validation(format!(
                "batch has {} blobs",
                blobs.len()
            )));
        }

        let reference = header.reference_block_number;
        let earliest = current_block.saturating_sub(self.max_lag);
        let latest = current_block.saturating_add(self.max_lead);
        if reference < earliest || reference > latest {
            return Err(Error::Validation(format!(
                "reference block {} outside [{}, {}] at height {}",
                reference, earliest, latest, current_block
            )));
        }

        let leaves: Vec<_> = blobs.iter().map(|blob| blob.header.hash()).collect();
        let tree = MerkleTree::build(&leaves).map_err(|e| Error::Validation(e.to_string()))?;
        if tree.root() != header.batch_root {
            return Err(Error::Validation(format!(
                "batch root {} does not match blob headers (computed {})",
                header.batch_root,
                tree.root()
            )));
        }
        Ok(tree)
    }

    /// Checks one blob's shape and that its bundles match this node's assignment.
    pub fn validate_blob(
        &self,
        index: BlobIndex,
        blob: &Blob,
        snapshot: &AssignmentSnapshot,
    ) -> Result<()> {
        let quorums = &blob.header.quorum_headers;
        if blob.bundles.len() != quorums.len() {
            return Err(Error::Validation(format!(
                "blob {} has {} bundles for {} quorums",
                index,
                blob.bundles.len(),
                quorums.len()
            )));
        }

        let mut seen = HashSet::with_capacity(quorums.len());
        for quorum in quorums {
            if !seen.insert(quorum.quorum_id) {
                return Err(Error::Validation(format!(
                    "blob {} lists quorum {} twice",
                    index, quorum.quorum_id
                )));
            }
        }

        let mut assigned = 0;
        for (quorum, bundle) in quorums.iter().zip(&blob.bundles) {
            if let Some(first) = bundle.first() {
                if first.is_empty() || bundle.iter().any(|chunk| chunk.len() != first.len()) {
                    return Err(Error::Validation(format!(
                        "blob {} quorum {}: chunks must share one non-zero length",
                        index, quorum.quorum_id
                    )));
                }
            }

            match snapshot.assignment(quorum.quorum_id) {
                Some(assignment) => {
                    assigned += 1;
                    let expected = assignment.num_chunks(quorum.quantization_factor);
                    if bundle.len() as u64 != expected {
                        return Err(Error::Assignment(format!(
                            "blob {} quorum {}: received {} chunks, assigned {}",
                            index,
                            quorum.quorum_id,
                            bundle.len(),
                            expected
                        )));
                    }
                }
                None if !bundle.is_empty() => {
                    return Err(Error::Assignment(format!(
                        "blob {}: node is not assigned to quorum {} but received {} chunks",
                        index,
                        quorum.quorum_id,
                        bundle.len()
                    )));
                }
                None => {}
            }
        }

        if assigned == 0 {
            return Err(Error::Assignment(format!(
                "blob {} has no quorum assigned to this node",
                index
            )));
        }
        Ok(())
    }

    /// Folds per-blob outcomes into the accepted blob indices under the configured policy.
    pub fn apply_policy(
        &self,
        results: impl IntoIterator<Item = (BlobIndex, Result<()>)>,
    ) -> Result<Vec<BlobIndex>> {
        let mut accepted = Vec::new();
        let mut first_error = None;
        for (index, result) in results {
            match result {
                Ok(()) => accepted.push(index),
                Err(e) if self.policy == RejectionPolicy::WholeBatch => return Err(e),
                Err(e) => {
                    log::warn!("dropping blob {}: {}", index, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if accepted.is_empty() => Err(e),
            _ => Ok(accepted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::QuorumAssignment;
    use crate::testutils::{batch_header, quorum_info, BlobSpec};
    use crate::types::Bytes32;
    use bytes::Bytes;

    fn snapshot() -> AssignmentSnapshot {
        AssignmentSnapshot::new(1, 0).with_quorum(
            1,
            QuorumAssignment {
                start_slot: 2,
                num_slots: 1,
                total_slots: 4,
            },
        )
    }

    fn validator(policy: RejectionPolicy) -> BatchValidator {
        let mut config = NodeConfig::new(100);
        config.max_reference_block_lag = 10;
        config.max_reference_block_lead = 2;
        config.rejection_policy = policy;
        BatchValidator::new(&config)
    }

    fn blob(seed: u8, quorums: &[u8]) -> Blob {
        quorums
            .iter()
            .fold(BlobSpec::new(seed, 16), |spec, &q| spec.quorum(quorum_info(q)))
            .build(&snapshot())
    }

    #[test]
    fn test_valid_batch() {
        let blobs = vec![blob(1, &[1]), blob(2, &[0, 1])];
        let header = batch_header(&blobs, 100);
        let tree = validator(RejectionPolicy::WholeBatch)
            .validate_batch(&header, &blobs, 105)
            .unwrap();
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn test_empty_batch() {
        let header = BatchHeader {
            batch_root: Bytes32::default(),
            reference_block_number: 100,
        };
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_batch(&header, &[], 100)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reference_block_drift() {
        let v = validator(RejectionPolicy::WholeBatch);
        let blobs = vec![blob(1, &[1])];
        for (reference, ok) in [(89, false), (90, true), (102, true), (103, false)] {
            let header = batch_header(&blobs, reference);
            assert_eq!(
                v.validate_batch(&header, &blobs, 100).is_ok(),
                ok,
                "reference {}",
                reference
            );
        }
    }

    #[test]
    fn test_root_mismatch() {
        let blobs = vec![blob(1, &[1]), blob(2, &[1])];
        let mut header = batch_header(&blobs, 100);
        header.batch_root = Bytes32([1; 32]);
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_batch(&header, &blobs, 100)
            .unwrap_err();
        assert!(err.to_string().contains("batch root"));
    }

    #[test]
    fn test_bundle_count_mismatch() {
        let mut b = blob(1, &[1]);
        b.bundles.push(Vec::new());
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_duplicate_quorum() {
        let b = blob(1, &[1, 1]);
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_unequal_chunk_lengths() {
        let mut b = blob(1, &[1]);
        b.bundles[0][1] = Bytes::from_static(b"short");
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_wrong_chunk_count_for_assignment() {
        let mut b = blob(1, &[1]);
        b.bundles[0].pop();
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(matches!(err, Error::Assignment(_)));
    }

    #[test]
    fn test_chunks_for_unassigned_quorum() {
        let mut b = blob(1, &[0, 1]);
        b.bundles[0] = b.bundles[1].clone();
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(matches!(err, Error::Assignment(_)));
    }

    #[test]
    fn test_blob_without_assigned_quorum() {
        let b = blob(1, &[0]);
        let err = validator(RejectionPolicy::WholeBatch)
            .validate_blob(0, &b, &snapshot())
            .unwrap_err();
        assert!(matches!(err, Error::Assignment(_)));
    }

    #[test]
    fn test_whole_batch_policy() {
        let v = validator(RejectionPolicy::WholeBatch);
        assert_eq!(v.apply_policy(vec![(0, Ok(())), (1, Ok(()))]).unwrap(), vec![0, 1]);
        let err = v
            .apply_policy(vec![
                (0, Ok(())),
                (1, Err(Error::Assignment("a".into()))),
                (2, Err(Error::Commitment("c".into()))),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::Assignment(_)));
    }

    #[test]
    fn test_per_blob_policy() {
        let v = validator(RejectionPolicy::PerBlob);
        let accepted = v
            .apply_policy(vec![
                (0, Err(Error::Assignment("a".into()))),
                (1, Ok(())),
                (3, Ok(())),
            ])
            .unwrap();
        assert_eq!(accepted, vec![1, 3]);

        let err = v
            .apply_policy(vec![
                (0, Err(Error::Commitment("c".into()))),
                (1, Err(Error::Assignment("a".into()))),
            ])
            .unwrap_err();
        assert!(matches!(err, Error::Commitment(_)));
    }
}
