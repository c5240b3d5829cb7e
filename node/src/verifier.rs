// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use std::sync::Arc;

use crate::assignment::{AssignmentSnapshot, QuorumAssignment};
use crate::error::{Error, Result};
use crate::types::{Blob, BlobQuorumInfo, G1Point, G2Point};

/// Size of one polynomial evaluation (a field element) inside a chunk.
pub const SYMBOL_LEN: usize = 32;
/// Size of the opening proof that prefixes every chunk.
pub const PROOF_LEN: usize = G1Point::LEN;

/// A chunk split into its opening proof and evaluations, tagged with its global chunk index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u64,
    pub proof: Bytes,
    pub symbols: Bytes,
}

/// Shape of the chunks of one blob in one quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    /// Evaluations per chunk. Always a power of two.
    pub chunk_length: u32,
    /// Number of chunks the encoded blob is split into.
    pub total_chunks: u64,
}

impl FrameParams {
    /// Derives the chunk shape from a quorum header and this node's assignment.
    ///
    /// The encoded blob must split evenly into `quantization_factor * total_slots` chunks of a
    /// power-of-two length, and must be long enough to carry `length` symbols at the coding rate
    /// the quorum's thresholds require.
    pub fn derive(
        quorum: &BlobQuorumInfo,
        assignment: &QuorumAssignment,
        length: u32,
    ) -> Result<Self> {
        let total_chunks = assignment.total_chunks(quorum.quantization_factor);
        if total_chunks == 0 {
            return Err(Error::Commitment(format!(
                "quorum {} has no chunks to assign",
                quorum.quorum_id
            )));
        }
        let encoded = u64::from(quorum.encoded_blob_length);
        if encoded % total_chunks != 0 {
            return Err(Error::Commitment(format!(
                "encoded length {} does not split into {} chunks for quorum {}",
                encoded, total_chunks, quorum.quorum_id
            )));
        }
        let chunk_length = encoded / total_chunks;
        if chunk_length == 0
            || !chunk_length.is_power_of_two()
            || chunk_length > u64::from(u32::MAX)
        {
            return Err(Error::Commitment(format!(
                "chunk length {} for quorum {} is not a power of two",
                chunk_length, quorum.quorum_id
            )));
        }

        let margin = u64::from(quorum.quorum_threshold.saturating_sub(quorum.adversary_threshold));
        if encoded * margin < u64::from(length) * 100 {
            return Err(Error::Commitment(format!(
                "encoded length {} too short for {} symbols at thresholds {}/{} in quorum {}",
                encoded,
                length,
                quorum.adversary_threshold,
                quorum.quorum_threshold,
                quorum.quorum_id
            )));
        }

        Ok(Self {
            chunk_length: chunk_length as u32,
            total_chunks,
        })
    }

    /// Byte length every chunk must have.
    pub fn chunk_bytes(&self) -> usize {
        PROOF_LEN + self.chunk_length as usize * SYMBOL_LEN
    }
}

/// The pairing primitive the node verifies against.
///
/// Implementations wrap the curve library; the node only decides what to check.
pub trait CommitmentBackend: Send + Sync {
    /// Checks that every frame is an evaluation of the polynomial bound by `commitment`.
    fn verify_frames(&self, commitment: &G1Point, params: &FrameParams, frames: &[Frame]) -> bool;

    /// Checks that `length_commitment` commits to the same polynomial as `commitment`.
    fn verify_commitment_equivalence(
        &self,
        commitment: &G1Point,
        length_commitment: &G2Point,
    ) -> bool;

    /// Checks that `length_proof` bounds the degree of the committed polynomial below `length`.
    fn verify_length(&self, length_commitment: &G2Point, length_proof: &G2Point, length: u32)
        -> bool;
}

/// Requires `adversary_threshold < quorum_threshold <= 100`.
pub fn check_security_params(quorum: &BlobQuorumInfo) -> Result<()> {
    if quorum.adversary_threshold >= quorum.quorum_threshold || quorum.quorum_threshold > 100 {
        return Err(Error::Commitment(format!(
            "invalid thresholds {}/{} for quorum {}",
            quorum.adversary_threshold, quorum.quorum_threshold, quorum.quorum_id
        )));
    }
    Ok(())
}

/// Splits raw chunks into frames carrying the indices this node was assigned.
pub fn decode_frames(
    bundle: &[Bytes],
    params: &FrameParams,
    first_index: u64,
) -> Result<Vec<Frame>> {
    let expected = params.chunk_bytes();
    bundle
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            if chunk.len() != expected {
                return Err(Error::Commitment(format!(
                    "chunk {} is {} bytes, expected {}",
                    i,
                    chunk.len(),
                    expected
                )));
            }
            Ok(Frame {
                index: first_index + i as u64,
                proof: chunk.slice(..PROOF_LEN),
                symbols: chunk.slice(PROOF_LEN..),
            })
        })
        .collect()
}

/// Verifies blobs against their commitments.
#[derive(Clone)]
pub struct CommitmentVerifier {
    backend: Arc<dyn CommitmentBackend>,
}

impl CommitmentVerifier {
    pub fn new(backend: Arc<dyn CommitmentBackend>) -> Self {
        Self { backend }
    }

    /// Verifies every bundle of `blob` that this node is assigned, plus the blob's degree bound.
    ///
    /// Bundles for quorums outside `snapshot` are skipped; the batch validator has already
    /// required them to be empty.
    pub fn verify_blob(&self, blob: &Blob, snapshot: &AssignmentSnapshot) -> Result<()> {
        let header = &blob.header;

        if !self
            .backend
            .verify_commitment_equivalence(&header.commitment, &header.length_commitment)
        {
            return Err(Error::Commitment(
                "length commitment does not match commitment".to_string(),
            ));
        }
        if !self
            .backend
            .verify_length(&header.length_commitment, &header.length_proof, header.length)
        {
            return Err(Error::Commitment(format!(
                "length proof does not bound degree to {}",
                header.length
            )));
        }

        for quorum in &header.quorum_headers {
            check_security_params(quorum)?;
        }

        for (quorum, bundle) in header.quorum_headers.iter().zip(&blob.bundles) {
            let Some(assignment) = snapshot.assignment(quorum.quorum_id) else {
                continue;
            };
            let params = FrameParams::derive(quorum, assignment, header.length)?;
            let first_index = assignment.chunk_indices(quorum.quantization_factor).start;
            let frames = decode_frames(bundle, &params, first_index)?;
            if !self
                .backend
                .verify_frames(&header.commitment, &params, &frames)
            {
                return Err(Error::Commitment(format!(
                    "chunks for quorum {} do not open the commitment",
                    quorum.quorum_id
                )));
            }
        }
        Ok(())
    }
}
