//! The seam between the state store and transaction execution.
//!
//! Executing a transactions generator (to learn which coins a block adds
//! and removes) belongs to upper-layer validation. The store only resolves
//! generator blobs and their back-references by height; the embedder
//! supplies a `GeneratorRunner` so replayed blocks can be re-executed
//! during a reorg.

use serde::{Deserialize, Serialize};

use crate::error::ChainStorageError;
use crate::types::{Bytes32, Coin};

/// A generator program together with the generator blobs it references
/// (resolved in ref-list order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockGenerator {
    pub program: Vec<u8>,
    pub generator_refs: Vec<Vec<u8>>,
}

/// The coin deltas and hints produced by executing one block's generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionsInfo {
    pub additions: Vec<Coin>,
    pub removals: Vec<Bytes32>,
    pub hints: Vec<(Bytes32, Vec<u8>)>,
}

/// What upper-layer pre-validation hands the coordinator along with a
/// block. `transactions` is the cached execution result for the block
/// itself; replayed ancestors are re-run through the `GeneratorRunner`.
#[derive(Debug, Clone, Default)]
pub struct PreValidationResult {
    pub error: Option<String>,
    pub required_iters: u64,
    pub transactions: Option<TransactionsInfo>,
    pub validated_signature: bool,
}

pub trait GeneratorRunner: Send + Sync {
    fn run_generator(
        &self,
        generator: &BlockGenerator,
        height: u32,
    ) -> Result<TransactionsInfo, ChainStorageError>;
}
