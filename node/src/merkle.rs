// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

//! Merkle index over the blob headers of a batch.
//!
//! The tree is kept as one flat arena of hashes, level by level from the (padded) leaves up to
//! the root, so a node is addressed by `level_offset(level) + position`. Leaves are padded with
//! zero hashes up to the next power of two and parents are `keccak256(left || right)`. Proofs
//! are checked positionally: an even running index means the running hash is the left input.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{keccak256, Bytes32};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Blob index {index} out of range for batch of {count} blobs")]
    BlobIndexOutOfRange { index: usize, count: usize },
    #[error("Cannot build a Merkle tree without leaves")]
    Empty,
    #[error("Malformed Merkle artifact: {0}")]
    Malformed(String),
}

/// Inclusion evidence for one leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Leaf index; equals the blob index.
    pub index: u32,
    /// Sibling hashes from the leaf level upwards.
    pub siblings: Vec<Bytes32>,
}

impl MerkleProof {
    /// Folds `leaf` up the sibling path and returns the implied root.
    pub fn compute_root(&self, leaf: Bytes32) -> Bytes32 {
        let mut index = self.index;
        let mut node = leaf;
        for sibling in &self.siblings {
            node = if index % 2 == 0 {
                hash_pair(&node, sibling)
            } else {
                hash_pair(sibling, &node)
            };
            index /= 2;
        }
        node
    }

    pub fn verify(&self, leaf: Bytes32, root: &Bytes32) -> bool {
        self.compute_root(leaf) == *root
    }
}

fn hash_pair(left: &Bytes32, right: &Bytes32) -> Bytes32 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(left.as_bytes());
    buf[32..].copy_from_slice(right.as_bytes());
    keccak256(&buf)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    leaf_count: usize,
    /// Padded leaf level width, a power of two.
    width: usize,
    nodes: Vec<Bytes32>,
}

impl MerkleTree {
    pub fn build(leaves: &[Bytes32]) -> Result<Self, Error> {
        if leaves.is_empty() {
            return Err(Error::Empty);
        }
        let width = leaves.len().next_power_of_two();
        let mut nodes = Vec::with_capacity(2 * width - 1);
        nodes.extend_from_slice(leaves);
        nodes.resize(width, Bytes32::default());

        let mut level_start = 0;
        let mut level_width = width;
        while level_width > 1 {
            for i in (0..level_width).step_by(2) {
                let parent = hash_pair(&nodes[level_start + i], &nodes[level_start + i + 1]);
                nodes.push(parent);
            }
            level_start += level_width;
            level_width /= 2;
        }

        Ok(Self {
            leaf_count: leaves.len(),
            width,
            nodes,
        })
    }

    pub fn root(&self) -> Bytes32 {
        // build() never produces an empty arena
        self.nodes[self.nodes.len() - 1]
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn leaf(&self, index: usize) -> Option<Bytes32> {
        (index < self.leaf_count).then(|| self.nodes[index])
    }

    pub fn proof(&self, index: usize) -> Result<MerkleProof, Error> {
        if index >= self.leaf_count {
            return Err(Error::BlobIndexOutOfRange {
                index,
                count: self.leaf_count,
            });
        }
        let mut siblings = Vec::with_capacity(self.width.trailing_zeros() as usize);
        let mut level_start = 0;
        let mut level_width = self.width;
        let mut pos = index;
        while level_width > 1 {
            siblings.push(self.nodes[level_start + (pos ^ 1)]);
            level_start += level_width;
            level_width /= 2;
            pos /= 2;
        }
        Ok(MerkleProof {
            index: index as u32,
            siblings,
        })
    }

    /// Serializes the arena: leaf count (u32, big-endian) followed by every node.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.nodes.len() * Bytes32::LEN);
        buf.put_u32(self.leaf_count as u32);
        for node in &self.nodes {
            buf.put_slice(node.as_bytes());
        }
        buf.freeze()
    }

    pub fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::Malformed("missing leaf count".to_string()));
        }
        let leaf_count = bytes.get_u32() as usize;
        if leaf_count == 0 {
            return Err(Error::Empty);
        }
        let width = leaf_count.next_power_of_two();
        let expected = (2 * width - 1) * Bytes32::LEN;
        if bytes.len() != expected {
            return Err(Error::Malformed(format!(
                "expected {} bytes of nodes, got {}",
                expected,
                bytes.len()
            )));
        }
        let nodes = bytes
            .chunks_exact(Bytes32::LEN)
            .filter_map(Bytes32::from_slice)
            .collect();
        Ok(Self {
            leaf_count,
            width,
            nodes,
        })
    }
}
