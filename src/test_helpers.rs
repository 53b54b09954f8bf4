//! Deterministic chain, block and database builders shared by the test
//! modules. Everything here derives from explicit seeds so tests are
//! reproducible byte for byte.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::block::{BlockRecord, FullBlock, SubEpochSummary, SubSlot};
use crate::block_store::BlockStore;
use crate::blockchain::{AddBlockResult, Blockchain};
use crate::coin_store::CoinStore;
use crate::config::GENESIS_CHALLENGE;
use crate::error::ChainStorageError;
use crate::generator::{BlockGenerator, GeneratorRunner, PreValidationResult, TransactionsInfo};
use crate::hint_store::HintStore;
use crate::transactional::{StoreOptions, TransactionalStore};
use crate::types::{Bytes32, Coin, CoinRecord};

pub async fn temp_pool() -> (Arc<TransactionalStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let pool =
        TransactionalStore::open(&dir.path().join("test.sqlite"), &StoreOptions::default())
            .unwrap();
    (Arc::new(pool), dir)
}

fn digest(parts: &[&[u8]]) -> Bytes32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let out = hasher.finalize();
    Bytes32::from_slice(&out).unwrap()
}

pub fn make_hash(seed: u64) -> Bytes32 {
    digest(&[b"hash", &seed.to_be_bytes()])
}

/// A coin with a seed-derived parent.
pub fn make_coin(seed: u64, puzzle_hash: Bytes32, amount: u64) -> Coin {
    Coin::new(
        digest(&[b"parent", &seed.to_be_bytes()]),
        puzzle_hash,
        amount,
    )
}

/// Farmer and pool reward coins for a block, unique per (salt, height).
pub fn reward_coins(salt: u64, height: u32) -> Vec<Coin> {
    vec![
        Coin::new(
            digest(&[b"reward", &salt.to_be_bytes(), &height.to_be_bytes(), &[0]]),
            digest(&[b"farmer-ph", &salt.to_be_bytes(), &height.to_be_bytes()]),
            1_750_000_000_000,
        ),
        Coin::new(
            digest(&[b"reward", &salt.to_be_bytes(), &height.to_be_bytes(), &[1]]),
            digest(&[b"pool-ph", &salt.to_be_bytes(), &height.to_be_bytes()]),
            250_000_000_000,
        ),
    ]
}

/// Runs generators built by `ChainBuilder`: the program bytes simply encode
/// the coin deltas.
pub struct TestGeneratorRunner;

impl GeneratorRunner for TestGeneratorRunner {
    fn run_generator(
        &self,
        generator: &BlockGenerator,
        _height: u32,
    ) -> Result<TransactionsInfo, ChainStorageError> {
        Ok(bincode::deserialize(&generator.program)?)
    }
}

#[derive(Clone)]
pub struct TestBlock {
    pub header_hash: Bytes32,
    pub block: FullBlock,
    pub record: BlockRecord,
    pub transactions: Option<TransactionsInfo>,
}

impl TestBlock {
    pub fn pre_validation(&self) -> PreValidationResult {
        PreValidationResult {
            error: None,
            required_iters: 7,
            transactions: self.transactions.clone(),
            validated_signature: true,
        }
    }
}

/// Extra content for a built block.
#[derive(Default, Clone)]
pub struct BlockSpec {
    pub transactions: Option<TransactionsInfo>,
    pub sub_slots: Vec<SubSlot>,
    pub generator_refs: Vec<u32>,
}

fn make_block(
    salt: u64,
    height: u32,
    prev_hash: Bytes32,
    parent_weight: u128,
    weight_step: u128,
    spec: BlockSpec,
) -> TestBlock {
    let weight = parent_weight + weight_step;
    let header_hash = digest(&[
        b"block",
        &salt.to_be_bytes(),
        &height.to_be_bytes(),
        prev_hash.as_bytes(),
        &weight.to_be_bytes(),
    ]);
    let timestamp = Some(1_600_000_000 + height as u64 * 10);
    let reward_coins = if height == 0 {
        vec![]
    } else {
        reward_coins(salt, height)
    };
    let ses = if height > 0 && height % 7 == 0 {
        Some(SubEpochSummary(
            digest(&[b"ses", &salt.to_be_bytes(), &height.to_be_bytes()])
                .as_bytes()
                .to_vec(),
        ))
    } else {
        None
    };
    let transactions_generator = spec
        .transactions
        .as_ref()
        .map(|info| bincode::serialize(info).unwrap());

    let block = FullBlock {
        height,
        prev_hash,
        is_fully_compactified: false,
        timestamp,
        transactions_generator,
        transactions_generator_ref_list: spec.generator_refs.clone(),
        reward_coins,
        finished_sub_slots: spec.sub_slots.clone(),
        proof_payload: salt.to_be_bytes().to_vec(),
    };
    let record = BlockRecord {
        header_hash,
        prev_hash,
        height,
        weight,
        total_iters: weight * 100,
        required_iters: 7,
        signage_point_index: (height % 8) as u8,
        first_in_sub_slot: !spec.sub_slots.is_empty(),
        is_transaction_block: true,
        timestamp,
        sub_epoch_summary_included: ses,
    };
    TestBlock {
        header_hash,
        block,
        record,
        transactions: spec.transactions,
    }
}

/// Grows a deterministic chain. Every third block carries a generator with
/// one coin addition; every seventh block carries a sub-epoch summary.
pub struct ChainBuilder {
    salt: u64,
    weight_step: u128,
    blocks: Vec<TestBlock>,
}

impl ChainBuilder {
    pub fn new(salt: u64) -> Self {
        Self::with_weight_step(salt, 2)
    }

    pub fn with_weight_step(salt: u64, weight_step: u128) -> Self {
        ChainBuilder {
            salt,
            weight_step,
            blocks: Vec::new(),
        }
    }

    pub fn blocks(&self) -> &[TestBlock] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut Vec<TestBlock> {
        &mut self.blocks
    }

    pub fn tip(&self) -> &TestBlock {
        self.blocks.last().expect("chain is not empty")
    }

    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Default content for the next block at `height`.
    fn default_spec(&self, height: u32) -> BlockSpec {
        let transactions = if height > 0 && height % 3 == 0 {
            Some(TransactionsInfo {
                additions: vec![make_coin(
                    self.salt * 1_000_000 + height as u64,
                    digest(&[b"tx-ph", &self.salt.to_be_bytes(), &height.to_be_bytes()]),
                    100 + height as u64,
                )],
                removals: vec![],
                hints: vec![],
            })
        } else {
            None
        };
        BlockSpec {
            transactions,
            ..BlockSpec::default()
        }
    }

    pub fn push_block(&mut self) -> &TestBlock {
        let spec = self.default_spec(self.blocks.len() as u32);
        self.push_block_with(spec)
    }

    /// Build the block that would come next without recording it.
    pub fn clone_next_block(&self) -> TestBlock {
        let height = self.blocks.len() as u32;
        let (prev_hash, parent_weight) = match self.blocks.last() {
            Some(parent) => (parent.header_hash, parent.record.weight),
            None => (GENESIS_CHALLENGE, 0),
        };
        make_block(
            self.salt,
            height,
            prev_hash,
            parent_weight,
            self.weight_step,
            self.default_spec(height),
        )
    }

    pub fn push_block_with(&mut self, spec: BlockSpec) -> &TestBlock {
        let height = self.blocks.len() as u32;
        let (prev_hash, parent_weight) = match self.blocks.last() {
            Some(parent) => (parent.header_hash, parent.record.weight),
            None => (GENESIS_CHALLENGE, 0),
        };
        let block = make_block(
            self.salt,
            height,
            prev_hash,
            parent_weight,
            self.weight_step,
            spec,
        );
        self.blocks.push(block);
        self.tip()
    }

    pub fn extend_to(&mut self, length: u32) {
        while (self.blocks.len() as u32) < length {
            self.push_block();
        }
    }

    /// A competing branch sharing this chain up to and including
    /// `fork_height`.
    pub fn fork_at(&self, fork_height: u32, salt: u64, weight_step: u128) -> ChainBuilder {
        ChainBuilder {
            salt,
            weight_step,
            blocks: self.blocks[..=(fork_height as usize)].to_vec(),
        }
    }
}

/// A lower-weight competitor at `height` (attached to the same parent as
/// the chain's block at that height).
pub fn orphan_at(chain: &ChainBuilder, height: u32, salt: u64) -> TestBlock {
    let parent = &chain.blocks()[height as usize - 1];
    make_block(
        salt,
        height,
        parent.header_hash,
        parent.record.weight,
        1,
        BlockSpec::default(),
    )
}

/// A fully wired coordinator over a fresh temp database.
pub async fn temp_blockchain() -> (Blockchain, TempDir) {
    let (pool, dir) = temp_pool().await;
    let block_store = Arc::new(BlockStore::create(pool.clone()).await.unwrap());
    let coin_store = Arc::new(CoinStore::create(pool.clone()).await.unwrap());
    let hint_store = Arc::new(HintStore::create(pool.clone()).await.unwrap());
    let blockchain = Blockchain::create(
        pool,
        block_store,
        coin_store,
        hint_store,
        dir.path(),
        Arc::new(TestGeneratorRunner),
    )
    .await
    .unwrap();
    (blockchain, dir)
}

pub async fn add(
    blockchain: &Blockchain,
    block: &TestBlock,
) -> Result<AddBlockResult, ChainStorageError> {
    blockchain
        .add_block(
            block.block.clone(),
            block.record.clone(),
            block.pre_validation(),
            None,
        )
        .await
}

/// Write a schema-v1 database file: hex-text hashes, uncompressed block
/// blobs, `is_peak` on `block_records`, a redundant `spent` flag and
/// duplicate-friendly hints.
pub fn build_v1_db(
    path: &Path,
    chain: &ChainBuilder,
    orphans: &[TestBlock],
    coin_rows: &[CoinRecord],
    hints: &[(Bytes32, Vec<u8>)],
    ses_segments: &[(Bytes32, Vec<u8>)],
) -> Result<(), ChainStorageError> {
    let db = rusqlite::Connection::open(path)?;
    db.execute_batch(
        "CREATE TABLE full_blocks(header_hash text PRIMARY KEY, height bigint,
             is_block tinyint, is_fully_compactified tinyint, block blob);
         CREATE TABLE block_records(header_hash text PRIMARY KEY, prev_hash text,
             height bigint, block blob, sub_epoch_summary blob, is_peak tinyint,
             is_block tinyint);
         CREATE TABLE coin_record(coin_name text PRIMARY KEY, confirmed_index bigint,
             spent_index bigint, spent int, coinbase int, puzzle_hash text,
             coin_parent text, amount blob, timestamp bigint);
         CREATE TABLE hints(id INTEGER PRIMARY KEY AUTOINCREMENT, coin_id blob, hint blob);
         CREATE TABLE sub_epoch_segments_v3(ses_block_hash text PRIMARY KEY,
             challenge_segments blob);",
    )?;

    let tip_hash = chain.tip().header_hash;
    for block in chain.blocks().iter().chain(orphans) {
        db.execute(
            "INSERT INTO full_blocks VALUES(?, ?, 1, ?, ?)",
            rusqlite::params![
                block.header_hash.to_hex(),
                block.block.height,
                block.block.is_fully_compactified as i64,
                block.block.to_bytes()?,
            ],
        )?;
        db.execute(
            "INSERT INTO block_records VALUES(?, ?, ?, ?, ?, ?, 1)",
            rusqlite::params![
                block.header_hash.to_hex(),
                block.record.prev_hash.to_hex(),
                block.record.height,
                block.record.to_bytes()?,
                block
                    .record
                    .sub_epoch_summary_included
                    .as_ref()
                    .map(|ses| ses.0.clone()),
                (block.header_hash == tip_hash) as i64,
            ],
        )?;
    }

    for record in coin_rows {
        db.execute(
            "INSERT INTO coin_record VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                record.name().to_hex(),
                record.confirmed_block_index,
                record.spent_block_index,
                (record.spent_block_index > 0) as i64,
                record.coinbase as i64,
                record.coin.puzzle_hash.to_hex(),
                record.coin.parent_coin_id.to_hex(),
                &record.coin.amount_blob()[..],
                record.timestamp as i64,
            ],
        )?;
    }

    for (coin_id, hint) in hints {
        db.execute(
            "INSERT INTO hints(coin_id, hint) VALUES(?, ?)",
            rusqlite::params![coin_id, hint],
        )?;
    }

    for (ses_hash, segments) in ses_segments {
        db.execute(
            "INSERT INTO sub_epoch_segments_v3 VALUES(?, ?)",
            rusqlite::params![ses_hash.to_hex(), segments],
        )?;
    }

    Ok(())
}
