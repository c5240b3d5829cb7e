// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Helpers for tests: a hash-based stand-in for the pairing primitive and builders for blobs
//! and batches that satisfy it.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::assignment::AssignmentSnapshot;
use crate::attestor::Ed25519Signer;
use crate::merkle::MerkleTree;
use crate::types::{BatchHeader, Blob, BlobHeader, BlobQuorumInfo, G1Point, G2Point};
use crate::verifier::{CommitmentBackend, Frame, FrameParams, PROOF_LEN, SYMBOL_LEN};

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn frame_tag(commitment: &G1Point, params: &FrameParams, index: u64, symbols: &[u8]) -> [u8; 32] {
    sha256(&[
        b"frame",
        commitment.as_bytes(),
        &index.to_be_bytes(),
        &params.chunk_length.to_be_bytes(),
        symbols,
    ])
}

fn equivalence_tag(commitment: &G1Point) -> [u8; 32] {
    sha256(&[b"equivalence", commitment.as_bytes()])
}

fn length_tag(length_commitment: &G2Point, length: u32) -> [u8; 32] {
    sha256(&[b"length", length_commitment.as_bytes(), &length.to_be_bytes()])
}

fn padded<const N: usize>(tag: [u8; 32]) -> [u8; N] {
    let mut out = [0u8; N];
    out[..32].copy_from_slice(&tag);
    out
}

/// Commitment backend where every "proof" is a hash binding the values it vouches for.
///
/// It has none of the properties of a real polynomial commitment, but it accepts exactly the
/// data [`BlobSpec`] produces and rejects any tampering with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeCommitmentBackend;

impl CommitmentBackend for FakeCommitmentBackend {
    fn verify_frames(&self, commitment: &G1Point, params: &FrameParams, frames: &[Frame]) -> bool {
        frames.iter().all(|frame| {
            frame.index < params.total_chunks
                && frame.proof.len() == PROOF_LEN
                && frame.proof[..] == padded::<PROOF_LEN>(frame_tag(
                    commitment,
                    params,
                    frame.index,
                    &frame.symbols,
                ))[..]
        })
    }

    fn verify_commitment_equivalence(
        &self,
        commitment: &G1Point,
        length_commitment: &G2Point,
    ) -> bool {
        length_commitment.0 == padded::<{ G2Point::LEN }>(equivalence_tag(commitment))
    }

    fn verify_length(
        &self,
        length_commitment: &G2Point,
        length_proof: &G2Point,
        length: u32,
    ) -> bool {
        length_proof.0 == padded::<{ G2Point::LEN }>(length_tag(length_commitment, length))
    }
}

/// Builds a blob whose bundles match an assignment snapshot.
#[derive(Debug, Clone)]
pub struct BlobSpec {
    seed: u8,
    length: u32,
    quorums: Vec<BlobQuorumInfo>,
    account_id: String,
}

impl BlobSpec {
    pub fn new(seed: u8, length: u32) -> Self {
        Self {
            seed,
            length,
            quorums: Vec::new(),
            account_id: format!("account-{}", seed),
        }
    }

    pub fn quorum(mut self, quorum: BlobQuorumInfo) -> Self {
        self.quorums.push(quorum);
        self
    }

    pub fn header(&self) -> BlobHeader {
        let commitment = G1Point(padded(sha256(&[b"commitment", &[self.seed]])));
        let length_commitment = G2Point(padded(equivalence_tag(&commitment)));
        let length_proof = G2Point(padded(length_tag(&length_commitment, self.length)));
        BlobHeader {
            commitment,
            length_commitment,
            length_proof,
            length: self.length,
            quorum_headers: self.quorums.clone(),
            account_id: self.account_id.clone(),
        }
    }

    /// Produces valid chunks for every quorum `snapshot` assigns, and empty bundles elsewhere.
    pub fn build(&self, snapshot: &AssignmentSnapshot) -> Blob {
        let header = self.header();
        let bundles = header
            .quorum_headers
            .iter()
            .map(|quorum| {
                let Some(assignment) = snapshot.assignment(quorum.quorum_id) else {
                    return Vec::new();
                };
                let params = match FrameParams::derive(quorum, assignment, header.length) {
                    Ok(params) => params,
                    Err(_) => return Vec::new(),
                };
                assignment
                    .chunk_indices(quorum.quantization_factor)
                    .map(|index| self.chunk(&header.commitment, &params, index))
                    .collect()
            })
            .collect();
        Blob { header, bundles }
    }

    fn chunk(&self, commitment: &G1Point, params: &FrameParams, index: u64) -> Bytes {
        let symbols: Vec<u8> = (0..params.chunk_length as usize * SYMBOL_LEN)
            .map(|i| self.seed.wrapping_mul(31).wrapping_add(index as u8).wrapping_add(i as u8))
            .collect();
        let proof = padded::<PROOF_LEN>(frame_tag(commitment, params, index, &symbols));
        let mut chunk = BytesMut::with_capacity(params.chunk_bytes());
        chunk.put_slice(&proof);
        chunk.put_slice(&symbols);
        chunk.freeze()
    }
}

/// Quorum parameters that [`BlobSpec`] can satisfy for small test assignments.
pub fn quorum_info(quorum_id: u8) -> BlobQuorumInfo {
    BlobQuorumInfo {
        quorum_id,
        adversary_threshold: 33,
        quorum_threshold: 67,
        quantization_factor: 2,
        encoded_blob_length: 64,
        ratelimit: 0,
    }
}

/// Header of a batch containing `blobs`, with the correct Merkle root.
pub fn batch_header(blobs: &[Blob], reference_block_number: u64) -> BatchHeader {
    let leaves: Vec<_> = blobs.iter().map(|blob| blob.header.hash()).collect();
    let batch_root = MerkleTree::build(&leaves)
        .map(|tree| tree.root())
        .unwrap_or_default();
    BatchHeader {
        batch_root,
        reference_block_number,
    }
}

/// A signer with a fixed key.
pub fn test_signer() -> Ed25519Signer {
    Ed25519Signer::from_bytes(&[7u8; 32])
}
