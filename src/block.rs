//! Block blobs and their canonical binary codec.
//!
//! The store persists full blocks zstd-compressed and block-record
//! summaries uncompressed, both bincode-encoded. Upper layers own the
//! content of the opaque payload fields; only the structural fields below
//! are ever read back out individually.

use serde::{Deserialize, Serialize};

use crate::error::ChainStorageError;
use crate::types::{Bytes32, Coin};

/// A consensus checkpoint attached to certain block records. Opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEpochSummary(pub Vec<u8>);

/// A finished sub-slot bundle carried by a block. Only the challenge hash
/// is interpreted (by `get_sp_and_ip_sub_slots`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSlot {
    pub challenge_hash: Bytes32,
    pub data: Vec<u8>,
}

/// A full block as handed to the store by upper-layer validation. The
/// fields here are the cheaply-extractable subset; everything else lives in
/// `proof_payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullBlock {
    pub height: u32,
    pub prev_hash: Bytes32,
    pub is_fully_compactified: bool,
    /// Present iff this is a transaction block.
    pub timestamp: Option<u64>,
    pub transactions_generator: Option<Vec<u8>>,
    pub transactions_generator_ref_list: Vec<u32>,
    pub reward_coins: Vec<Coin>,
    pub finished_sub_slots: Vec<SubSlot>,
    pub proof_payload: Vec<u8>,
}

impl FullBlock {
    pub fn is_transaction_block(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainStorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainStorageError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Serialize and compress for the `full_blocks.block` column.
    pub fn compress(&self) -> Result<Vec<u8>, ChainStorageError> {
        compress_blob(&self.to_bytes()?)
    }

    /// Decompress and decode a `full_blocks.block` column value. A
    /// decompression failure is corruption, not a recoverable error.
    pub fn decompress(blob: &[u8]) -> Result<Self, ChainStorageError> {
        Self::from_bytes(&decompress_blob(blob)?)
    }
}

/// The validated summary of a block used for consensus lookups. Stored as a
/// single blob next to the full block, keyed by the same hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub header_hash: Bytes32,
    pub prev_hash: Bytes32,
    pub height: u32,
    pub weight: u128,
    pub total_iters: u128,
    pub required_iters: u64,
    pub signage_point_index: u8,
    pub first_in_sub_slot: bool,
    pub is_transaction_block: bool,
    pub timestamp: Option<u64>,
    pub sub_epoch_summary_included: Option<SubEpochSummary>,
}

impl BlockRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainStorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainStorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// One challenge segment persisted for weight proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSegment {
    pub height: u32,
    pub payload: Vec<u8>,
}

/// The blob stored in `sub_epoch_segments_v3.challenge_segments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEpochSegments {
    pub ses_block_hash: Bytes32,
    pub segments: Vec<ChallengeSegment>,
}

impl SubEpochSegments {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ChainStorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainStorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub fn compress_blob(bytes: &[u8]) -> Result<Vec<u8>, ChainStorageError> {
    Ok(zstd::encode_all(bytes, 0)?)
}

pub fn decompress_blob(blob: &[u8]) -> Result<Vec<u8>, ChainStorageError> {
    zstd::decode_all(blob)
        .map_err(|e| ChainStorageError::Corruption(format!("zstd decompression failed: {}", e)))
}
