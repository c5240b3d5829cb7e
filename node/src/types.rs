// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Identifier of a quorum. The protocol caps quorum ids at 255.
pub type QuorumId = u8;

/// 0-based position of a blob inside its batch. Equals the blob's Merkle leaf index.
pub type BlobIndex = u32;

/// The chunks one node holds for one blob in one quorum. All chunks share one length.
pub type Bundle = Vec<Bytes>;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Builds a value from a slice, failing if the length is not exact.
            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                <[u8; $len]>::try_from(slice).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let mut out = [0u8; $len];
                hex::decode_to_slice(s, &mut out)?;
                Ok(Self(out))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// A 32-byte keccak-256 digest.
    Bytes32,
    32
);
fixed_bytes!(
    /// A serialized G1 group element (uncompressed affine coordinates).
    G1Point,
    64
);
fixed_bytes!(
    /// A serialized G2 group element (uncompressed affine coordinates).
    G2Point,
    128
);

/// The key under which everything stored for a batch is addressed.
pub type BatchHeaderHash = Bytes32;

/// Computes keccak-256 over `data`.
pub fn keccak256(data: &[u8]) -> Bytes32 {
    Bytes32(Keccak256::digest(data).into())
}

/// Header of one dispersal round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    /// Merkle root over the hashes of the batch's blob headers.
    pub batch_root: Bytes32,
    /// Chain height defining the assignment and custody basis of the batch.
    pub reference_block_number: u64,
}

impl BatchHeader {
    /// ABI-style encoding of the reduced header: the root followed by the reference block as a
    /// big-endian 256-bit word.
    pub fn encode_reduced(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(self.batch_root.as_bytes());
        buf.put_bytes(0, 24);
        buf.put_u64(self.reference_block_number);
        buf.freeze()
    }

    /// Hash of the reduced header.
    pub fn hash(&self) -> BatchHeaderHash {
        keccak256(&self.encode_reduced())
    }
}

/// Parameters of one quorum a blob is dispersed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobQuorumInfo {
    pub quorum_id: QuorumId,
    /// Max percentage of quorum stake assumed adversarial.
    pub adversary_threshold: u8,
    /// Min percentage of quorum stake that must attest.
    pub quorum_threshold: u8,
    /// Number of chunks per assignment slot.
    pub quantization_factor: u32,
    /// Length of the erasure-coded blob in symbols.
    pub encoded_blob_length: u32,
    pub ratelimit: u32,
}

/// Header of one user blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeader {
    pub commitment: G1Point,
    pub length_commitment: G2Point,
    pub length_proof: G2Point,
    /// Length of the original blob in symbols.
    pub length: u32,
    pub quorum_headers: Vec<BlobQuorumInfo>,
    pub account_id: String,
}

impl BlobHeader {
    /// Canonical byte encoding hashed into the Merkle leaf.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            G1Point::LEN
                + 2 * G2Point::LEN
                + 12
                + self.quorum_headers.len() * 15
                + self.account_id.len(),
        );
        buf.put_slice(self.commitment.as_bytes());
        buf.put_slice(self.length_commitment.as_bytes());
        buf.put_slice(self.length_proof.as_bytes());
        buf.put_u32(self.length);
        buf.put_u32(self.quorum_headers.len() as u32);
        for q in &self.quorum_headers {
            buf.put_u8(q.quorum_id);
            buf.put_u8(q.adversary_threshold);
            buf.put_u8(q.quorum_threshold);
            buf.put_u32(q.quantization_factor);
            buf.put_u32(q.encoded_blob_length);
            buf.put_u32(q.ratelimit);
        }
        buf.put_u32(self.account_id.len() as u32);
        buf.put_slice(self.account_id.as_bytes());
        buf.freeze()
    }

    /// Merkle leaf of this header.
    pub fn hash(&self) -> Bytes32 {
        keccak256(&self.encode())
    }

    /// Position of `quorum_id` in `quorum_headers`, if the blob is dispersed to it.
    pub fn quorum_position(&self, quorum_id: QuorumId) -> Option<usize> {
        self.quorum_headers
            .iter()
            .position(|q| q.quorum_id == quorum_id)
    }
}

/// A blob as received by this node: its header and this node's bundles, one per quorum header
/// and in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub header: BlobHeader,
    pub bundles: Vec<Bundle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlobHeader {
        BlobHeader {
            commitment: G1Point([1u8; 64]),
            length_commitment: G2Point([2u8; 128]),
            length_proof: G2Point([3u8; 128]),
            length: 16,
            quorum_headers: vec![BlobQuorumInfo {
                quorum_id: 0,
                adversary_threshold: 33,
                quorum_threshold: 67,
                quantization_factor: 1,
                encoded_blob_length: 64,
                ratelimit: 0,
            }],
            account_id: "acct".to_string(),
        }
    }

    #[test]
    fn test_reduced_header_encoding() {
        let header = BatchHeader {
            batch_root: Bytes32([0xAB; 32]),
            reference_block_number: 0x0102,
        };
        let encoded = header.encode_reduced();
        assert_eq!(encoded.len(), 64);
        assert_eq!(&encoded[..32], &[0xAB; 32]);
        assert_eq!(&encoded[32..62], &[0u8; 30]);
        assert_eq!(&encoded[62..], &[0x01, 0x02]);
    }

    #[test]
    fn test_batch_header_hash_depends_on_reference_block() {
        let a = BatchHeader {
            batch_root: Bytes32([7; 32]),
            reference_block_number: 10,
        };
        let mut b = a.clone();
        b.reference_block_number = 11;
        assert_eq!(a.hash(), a.clone().hash());
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_keccak_of_empty_input() {
        assert_eq!(
            keccak256(&[]).to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_blob_header_hash_covers_quorums() {
        let a = header();
        let mut b = header();
        b.quorum_headers[0].quorum_threshold = 68;
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.quorum_position(0), Some(0));
        assert_eq!(a.quorum_position(1), None);
    }

    #[test]
    fn test_fixed_bytes_hex_roundtrip_and_length_check() {
        let value = Bytes32([0x5A; 32]);
        let parsed: Bytes32 = value.to_string().parse().unwrap();
        assert_eq!(parsed, value);
        assert!("0x1234".parse::<Bytes32>().is_err());
        assert!(G1Point::from_slice(&[0u8; 63]).is_none());
    }

    #[test]
    fn test_header_json() {
        let h = header();
        let json = serde_json::to_string(&h).unwrap();
        let back: BlobHeader = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
