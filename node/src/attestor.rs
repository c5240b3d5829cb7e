// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

use bytes::Bytes;
use ed25519_dalek::{Signer as _, SigningKey};
use std::sync::Arc;

use crate::chunk_store::DurableCommit;
use crate::types::BatchHeaderHash;

/// The node's signing key.
///
/// Signing must be deterministic: a retried store of the same batch has to return the same
/// attestation.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Bytes;
    fn public_key(&self) -> Bytes;
}

/// Signer backed by an Ed25519 key.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// Parses a hex-encoded 32-byte secret key.
    pub fn from_hex(secret: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(secret.strip_prefix("0x").unwrap_or(secret), &mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Bytes {
        Bytes::copy_from_slice(&self.key.sign(message).to_bytes())
    }

    fn public_key(&self) -> Bytes {
        Bytes::copy_from_slice(self.key.verifying_key().as_bytes())
    }
}

/// A custody attestation over a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub batch_header_hash: BatchHeaderHash,
    pub signature: Bytes,
}

/// Signs batch header hashes, and only for batches the chunk store has durably committed.
#[derive(Clone)]
pub struct Attestor {
    signer: Arc<dyn Signer>,
}

impl Attestor {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    /// The only way to obtain a signature is to present the commit acknowledgement.
    pub fn attest(&self, commit: &DurableCommit) -> Attestation {
        let batch_header_hash = commit.batch_header_hash();
        Attestation {
            batch_header_hash,
            signature: self.signer.sign(batch_header_hash.as_bytes()),
        }
    }

    pub fn public_key(&self) -> Bytes {
        self.signer.public_key()
    }
}
