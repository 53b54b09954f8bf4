//! The coordinator: the single authoritative entry point for mutating
//! consensus state.
//!
//! `add_block` classifies an incoming validated block, and for a new peak
//! performs the fork-and-replay under one write transaction: rewind the
//! coin set to the fork, replay coin additions and removals along the new
//! branch, rewrite the main-chain flags and the height map, and advance
//! the peak last. Readers observe either the pre-reorg or the post-reorg
//! peak, never a mid-replay state.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::block::{BlockRecord, FullBlock, SubSlot};
use crate::block_store::BlockStore;
use crate::coin_store::CoinStore;
use crate::error::ChainStorageError;
use crate::filters::build_filter;
use crate::generator::{BlockGenerator, GeneratorRunner, PreValidationResult, TransactionsInfo};
use crate::height_map::HeightMap;
use crate::hint_store::HintStore;
use crate::transactional::{TransactionalStore, WriteTx};
use crate::types::{Bytes32, CoinRecord};

/// How many recent block records stay in memory around the peak.
const BLOCK_RECORD_CACHE_BLOCKS: u32 = 1000;

/// Hint bytes mapped to the coin records they were attached to in a peak
/// change.
pub type HintChanges = HashMap<Vec<u8>, HashMap<Bytes32, CoinRecord>>;

/// Outcome of `add_block`. The first three are benign statuses, not errors.
#[derive(Debug)]
pub enum AddBlockResult {
    /// Block extends the heaviest chain; coin state was updated.
    NewPeak {
        fork_height: u32,
        coin_changes: Vec<CoinRecord>,
        hint_changes: HintChanges,
    },
    /// Valid, stored, but not heavier than the current peak.
    AddedAsOrphan,
    AlreadyHaveBlock,
    /// Previous block unknown; the caller should request ancestors.
    DisconnectedBlock,
    /// Validation failed; the block was not stored.
    InvalidBlock(String),
}

/// A full block projected down to its header plus the compact coin filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderBlock {
    pub header_hash: Bytes32,
    pub prev_hash: Bytes32,
    pub height: u32,
    pub timestamp: Option<u64>,
    pub transactions_filter: Option<Vec<u8>>,
}

struct Applied {
    fork_height: u32,
    rolled_back: bool,
    records: Vec<BlockRecord>,
    coin_changes: Vec<CoinRecord>,
    hint_changes: HintChanges,
}

pub struct Blockchain {
    db: Arc<TransactionalStore>,
    pub block_store: Arc<BlockStore>,
    pub coin_store: Arc<CoinStore>,
    pub hint_store: Arc<HintStore>,
    height_map: StdRwLock<HeightMap>,
    block_records: StdRwLock<HashMap<Bytes32, BlockRecord>>,
    peak: StdRwLock<Option<BlockRecord>>,
    runner: Arc<dyn GeneratorRunner>,
    /// Serializes whole add_block calls: classification, the committed
    /// write and the cache updates must act on one consistent snapshot,
    /// which the writer mutex alone does not cover once the transaction
    /// guard is released by commit.
    add_block_lock: AsyncMutex<()>,
}

impl Blockchain {
    /// Wire the stores together, build the height map and warm the
    /// block-record cache around the peak.
    pub async fn create(
        db: Arc<TransactionalStore>,
        block_store: Arc<BlockStore>,
        coin_store: Arc<CoinStore>,
        hint_store: Arc<HintStore>,
        persistence_dir: &Path,
        runner: Arc<dyn GeneratorRunner>,
    ) -> Result<Self, ChainStorageError> {
        let height_map = HeightMap::create(persistence_dir, &db).await?;
        let (records, peak_hash) = block_store
            .get_block_records_close_to_peak(BLOCK_RECORD_CACHE_BLOCKS)
            .await?;
        let peak = peak_hash.and_then(|hash| records.get(&hash).cloned());
        if let Some(peak) = &peak {
            info!(height = peak.height, hash = %peak.header_hash, "loaded chain peak");
        } else {
            info!("no peak found, starting from an empty chain");
        }
        Ok(Blockchain {
            db,
            block_store,
            coin_store,
            hint_store,
            height_map: StdRwLock::new(height_map),
            block_records: StdRwLock::new(records),
            peak: StdRwLock::new(peak),
            runner,
            add_block_lock: AsyncMutex::new(()),
        })
    }

    // ========== Mutation ==========

    /// Apply a validated block. See `AddBlockResult` for the outcomes; any
    /// `Err` means the enclosing transaction was rolled back and nothing
    /// was stored.
    pub async fn add_block(
        &self,
        block: FullBlock,
        block_record: BlockRecord,
        pre_validation_result: PreValidationResult,
        fork_hint: Option<u32>,
    ) -> Result<AddBlockResult, ChainStorageError> {
        // one block at a time end to end, so no caller can classify against
        // a peak another call is still publishing
        let _add_guard = self.add_block_lock.lock().await;

        let header_hash = block_record.header_hash;
        let genesis = block.height == 0;

        if self.contains_block(header_hash).await? {
            return Ok(AddBlockResult::AlreadyHaveBlock);
        }
        let prev = self.block_record(block_record.prev_hash).await?;
        if prev.is_none() && !genesis {
            return Ok(AddBlockResult::DisconnectedBlock);
        }
        if let Some(error) = &pre_validation_result.error {
            return Ok(AddBlockResult::InvalidBlock(error.clone()));
        }
        if let Some(prev) = &prev {
            if prev.height + 1 != block.height {
                return Ok(AddBlockResult::InvalidBlock(format!(
                    "block height {} does not follow its parent at {}",
                    block.height, prev.height
                )));
            }
        }
        if block.height != block_record.height || block.prev_hash != block_record.prev_hash {
            return Ok(AddBlockResult::InvalidBlock(
                "block and block record disagree".into(),
            ));
        }

        // the peak only changes under the add_block lock we hold
        let peak = self.peak.read().expect("peak lock poisoned").clone();

        let tx = self.db.writer().await?;
        let applied =
            match self.apply_block(&tx, &block, &block_record, &pre_validation_result, fork_hint, peak) {
                Ok(applied) => applied,
                Err(e) => {
                    drop(tx);
                    self.block_store.rollback_cache_block(header_hash);
                    error!(
                        block = %header_hash,
                        height = block.height,
                        error = %e,
                        "error while adding block, rolling back"
                    );
                    return Err(e);
                }
            };
        if let Err(e) = tx.commit() {
            self.block_store.rollback_cache_block(header_hash);
            return Err(e);
        }

        match applied {
            None => {
                self.block_records
                    .write()
                    .expect("record cache poisoned")
                    .insert(header_hash, block_record);
                Ok(AddBlockResult::AddedAsOrphan)
            }
            Some(applied) => {
                {
                    let mut height_map = self.height_map.write().expect("height map poisoned");
                    if applied.rolled_back {
                        height_map.rollback(applied.fork_height);
                    }
                    let mut records =
                        self.block_records.write().expect("record cache poisoned");
                    records.insert(header_hash, block_record.clone());
                    for record in &applied.records {
                        records.insert(record.header_hash, record.clone());
                        height_map.update_height(
                            record.height,
                            record.header_hash,
                            record.sub_epoch_summary_included.as_ref(),
                        )?;
                    }
                    height_map.maybe_flush()?;
                }
                *self.peak.write().expect("peak lock poisoned") = Some(block_record);
                self.prune_block_records();
                Ok(AddBlockResult::NewPeak {
                    fork_height: applied.fork_height,
                    coin_changes: applied.coin_changes,
                    hint_changes: applied.hint_changes,
                })
            }
        }
    }

    /// The in-transaction body of `add_block`: store the block, decide
    /// orphan/extend/reorg, rewind and replay. `None` means orphan.
    fn apply_block(
        &self,
        tx: &WriteTx<'_>,
        block: &FullBlock,
        block_record: &BlockRecord,
        pre_validation_result: &PreValidationResult,
        fork_hint: Option<u32>,
        peak: Option<BlockRecord>,
    ) -> Result<Option<Applied>, ChainStorageError> {
        let header_hash = block_record.header_hash;
        self.block_store
            .add_full_block(tx, header_hash, block, block_record)?;

        let (fork_height, rolled_back, mut coin_changes) = match &peak {
            None => {
                if block.height != 0 {
                    return Err(ChainStorageError::InvalidOperation(
                        "first block in an empty store must be genesis".into(),
                    ));
                }
                (0, false, HashMap::new())
            }
            Some(peak) => {
                if block_record.weight <= peak.weight {
                    return Ok(None);
                }
                if block_record.prev_hash == peak.header_hash {
                    // plain extension, nothing to rewind
                    (peak.height, false, HashMap::new())
                } else {
                    let fork_height = match fork_hint {
                        Some(hint) => hint,
                        None => self.find_fork_point(tx, peak, block_record)?,
                    };
                    info!(
                        fork_height,
                        old_peak = peak.height,
                        new_peak = block_record.height,
                        "chain reorganization"
                    );
                    let mut changes: HashMap<Bytes32, CoinRecord> = HashMap::new();
                    for record in self.coin_store.rollback_to_block(tx, fork_height)? {
                        changes.insert(record.name(), record);
                    }
                    self.block_store.rollback(tx, fork_height)?;
                    (fork_height, true, changes)
                }
            }
        };

        // collect the branch from the new tip down to the fork, then ascend
        let mut branch: Vec<(Arc<FullBlock>, BlockRecord)> = Vec::new();
        let mut current = header_hash;
        loop {
            let record = self
                .block_store
                .get_block_record_tx(tx, current)?
                .ok_or(ChainStorageError::MissingBlockInChain(current))?;
            let full = self
                .block_store
                .get_full_block_tx(tx, current)?
                .ok_or(ChainStorageError::MissingBlockInChain(current))?;
            let bottom = record.height == 0 || record.height == fork_height + 1;
            let prev_hash = record.prev_hash;
            branch.push((full, record));
            if bottom {
                break;
            }
            current = prev_hash;
        }
        branch.reverse();

        let new_branch_blocks: HashMap<u32, Arc<FullBlock>> = branch
            .iter()
            .map(|(full, record)| (record.height, full.clone()))
            .collect();

        let mut records = Vec::with_capacity(branch.len());
        let mut hint_changes: HintChanges = HashMap::new();
        for (full, record) in &branch {
            records.push(record.clone());
            if !full.is_transaction_block() {
                continue;
            }
            let timestamp = full.timestamp.ok_or_else(|| {
                ChainStorageError::InvalidOperation(format!(
                    "transaction block at height {} has no timestamp",
                    record.height
                ))
            })?;
            let cached = if record.header_hash == header_hash {
                pre_validation_result.transactions.as_ref()
            } else {
                None
            };
            let info =
                self.transactions_for_replay(tx, full, record.height, cached, &new_branch_blocks)?;

            // additions before removals, so a coin created and spent in the
            // same block keeps confirmed_index == spent_index
            let added = self.coin_store.new_block(
                tx,
                record.height,
                timestamp,
                &full.reward_coins,
                &info.additions,
                &info.removals,
            )?;
            for added_record in added {
                coin_changes.insert(added_record.name(), added_record);
            }
            for removal in &info.removals {
                let spent = self
                    .coin_store
                    .get_coin_record_tx(tx, *removal)?
                    .ok_or_else(|| {
                        ChainStorageError::Corruption(format!(
                            "coin {} vanished while being spent",
                            removal
                        ))
                    })?;
                coin_changes.insert(spent.name(), spent);
            }

            if !info.hints.is_empty() {
                self.hint_store.add_hints(tx, &info.hints)?;
                for (coin_id, hint) in &info.hints {
                    match coin_changes.get(coin_id) {
                        Some(record) => {
                            hint_changes
                                .entry(hint.clone())
                                .or_default()
                                .insert(*coin_id, *record);
                        }
                        None => {
                            // hints are advisory; an unknown target is
                            // dropped from the delta but kept in the index
                            warn!(coin = %coin_id, "hint attached to a coin not in this block");
                        }
                    }
                }
            }
        }

        let branch_hashes: Vec<Bytes32> = records.iter().map(|r| r.header_hash).collect();
        self.block_store.set_in_chain(tx, &branch_hashes)?;
        self.block_store.set_peak(tx, header_hash)?;

        Ok(Some(Applied {
            fork_height,
            rolled_back,
            records,
            coin_changes: coin_changes.into_values().collect(),
            hint_changes,
        }))
    }

    /// Deepest common ancestor of the current peak and a competing block.
    /// Two blocks that do not share genesis indicate corruption.
    fn find_fork_point(
        &self,
        tx: &WriteTx<'_>,
        peak: &BlockRecord,
        new_block: &BlockRecord,
    ) -> Result<u32, ChainStorageError> {
        let mut left = peak.clone();
        let mut right = new_block.clone();
        while left.height > right.height {
            left = self.record_for_walk(tx, left.prev_hash)?;
        }
        while right.height > left.height {
            right = self.record_for_walk(tx, right.prev_hash)?;
        }
        while left.header_hash != right.header_hash {
            if left.height == 0 {
                return Err(ChainStorageError::Corruption(
                    "peak and new block share no ancestor".into(),
                ));
            }
            left = self.record_for_walk(tx, left.prev_hash)?;
            right = self.record_for_walk(tx, right.prev_hash)?;
        }
        Ok(left.height)
    }

    fn record_for_walk(
        &self,
        tx: &WriteTx<'_>,
        header_hash: Bytes32,
    ) -> Result<BlockRecord, ChainStorageError> {
        if let Some(record) = self
            .block_records
            .read()
            .expect("record cache poisoned")
            .get(&header_hash)
        {
            return Ok(record.clone());
        }
        self.block_store
            .get_block_record_tx(tx, header_hash)?
            .ok_or(ChainStorageError::MissingBlockInChain(header_hash))
    }

    /// Resolve a replayed block's coin deltas: the cached pre-validation
    /// result for the tip, a fresh generator run for everything else.
    fn transactions_for_replay(
        &self,
        tx: &WriteTx<'_>,
        block: &FullBlock,
        height: u32,
        cached: Option<&TransactionsInfo>,
        new_branch: &HashMap<u32, Arc<FullBlock>>,
    ) -> Result<TransactionsInfo, ChainStorageError> {
        if let Some(info) = cached {
            return Ok(info.clone());
        }
        let program = match &block.transactions_generator {
            Some(program) => program.clone(),
            None => return Ok(TransactionsInfo::default()),
        };
        let mut generator_refs = Vec::with_capacity(block.transactions_generator_ref_list.len());
        for ref_height in &block.transactions_generator_ref_list {
            if *ref_height >= height {
                return Err(ChainStorageError::InvalidOperation(format!(
                    "generator ref at height {} from block at height {}",
                    ref_height, height
                )));
            }
            // the branch being replayed shadows the (rolled back) main chain
            let generator = match new_branch.get(ref_height) {
                Some(branch_block) if *ref_height < height => {
                    branch_block.transactions_generator.clone()
                }
                _ => self.main_chain_generator_tx(tx, *ref_height)?,
            };
            match generator {
                Some(generator) => generator_refs.push(generator),
                None => return Err(ChainStorageError::GeneratorRefHasNoGenerator(*ref_height)),
            }
        }
        self.runner.run_generator(
            &BlockGenerator {
                program,
                generator_refs,
            },
            height,
        )
    }

    fn main_chain_generator_tx(
        &self,
        tx: &WriteTx<'_>,
        height: u32,
    ) -> Result<Option<Vec<u8>>, ChainStorageError> {
        let blob: Option<Vec<u8>> = tx
            .query_row(
                "SELECT block FROM full_blocks WHERE in_main_chain=1 AND height=?",
                [height],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(FullBlock::decompress(&blob)?.transactions_generator),
            None => Err(ChainStorageError::InvalidOperation(format!(
                "generator ref to height {} which is not on the chain",
                height
            ))),
        }
    }

    fn prune_block_records(&self) {
        let peak_height = match self.peak.read().expect("peak lock poisoned").as_ref() {
            Some(peak) => peak.height,
            None => return,
        };
        let cutoff = peak_height.saturating_sub(BLOCK_RECORD_CACHE_BLOCKS);
        self.block_records
            .write()
            .expect("record cache poisoned")
            .retain(|_, record| record.height >= cutoff);
    }

    // ========== Read path ==========

    pub fn get_peak(&self) -> Option<BlockRecord> {
        self.peak.read().expect("peak lock poisoned").clone()
    }

    pub fn get_peak_height(&self) -> Option<u32> {
        self.get_peak().map(|record| record.height)
    }

    pub async fn get_full_peak(&self) -> Result<Option<Arc<FullBlock>>, ChainStorageError> {
        match self.get_peak() {
            Some(peak) => self.block_store.get_full_block(peak.header_hash).await,
            None => Ok(None),
        }
    }

    pub fn height_to_hash(&self, height: u32) -> Option<Bytes32> {
        self.height_map
            .read()
            .expect("height map poisoned")
            .get_hash(height)
    }

    pub fn contains_height(&self, height: u32) -> bool {
        self.height_map
            .read()
            .expect("height map poisoned")
            .contains_height(height)
    }

    pub fn get_ses_heights(&self) -> Vec<u32> {
        self.height_map
            .read()
            .expect("height map poisoned")
            .get_ses_heights()
    }

    pub fn get_ses(&self, height: u32) -> Option<crate::block::SubEpochSummary> {
        self.height_map
            .read()
            .expect("height map poisoned")
            .get_ses(height)
            .cloned()
    }

    pub async fn contains_block(&self, header_hash: Bytes32) -> Result<bool, ChainStorageError> {
        Ok(self.block_record(header_hash).await?.is_some())
    }

    /// A block record by hash, from the memory cache or the database.
    pub async fn block_record(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<BlockRecord>, ChainStorageError> {
        if let Some(record) = self
            .block_records
            .read()
            .expect("record cache poisoned")
            .get(&header_hash)
        {
            return Ok(Some(record.clone()));
        }
        self.block_store.get_block_record(header_hash).await
    }

    /// Resolve a block's generator and every generator it references. Refs
    /// into a not-yet-canonical branch are served by walking that branch in
    /// memory back to the main chain.
    pub async fn get_block_generator(
        &self,
        block: &FullBlock,
    ) -> Result<Option<BlockGenerator>, ChainStorageError> {
        let program = match &block.transactions_generator {
            Some(program) => program.clone(),
            None => return Ok(None),
        };
        if block.transactions_generator_ref_list.is_empty() {
            return Ok(Some(BlockGenerator {
                program,
                generator_refs: vec![],
            }));
        }

        let mut wanted: HashSet<u32> = HashSet::new();
        for ref_height in &block.transactions_generator_ref_list {
            if *ref_height >= block.height {
                return Err(ChainStorageError::InvalidOperation(format!(
                    "generator ref at height {} from block at height {}",
                    ref_height, block.height
                )));
            }
            wanted.insert(*ref_height);
        }

        // if the block hangs off a side branch, serve refs from that branch
        let mut from_branch: HashMap<u32, Vec<u8>> = HashMap::new();
        let mut current = block.prev_hash;
        loop {
            let record = match self.block_record(current).await? {
                Some(record) => record,
                None => break,
            };
            let on_main_chain = self.height_to_hash(record.height) == Some(record.header_hash);
            if on_main_chain {
                break;
            }
            if wanted.contains(&record.height) {
                let full = self
                    .block_store
                    .get_full_block(record.header_hash)
                    .await?
                    .ok_or(ChainStorageError::MissingBlockInChain(record.header_hash))?;
                match &full.transactions_generator {
                    Some(generator) => {
                        from_branch.insert(record.height, generator.clone());
                    }
                    None => {
                        return Err(ChainStorageError::GeneratorRefHasNoGenerator(record.height))
                    }
                }
            }
            if record.height == 0 {
                break;
            }
            current = record.prev_hash;
        }

        let remaining: HashSet<u32> = wanted
            .iter()
            .copied()
            .filter(|height| !from_branch.contains_key(height))
            .collect();
        let from_chain = if remaining.is_empty() {
            HashMap::new()
        } else {
            self.block_store.get_generators_at(&remaining).await?
        };

        let mut generator_refs = Vec::with_capacity(block.transactions_generator_ref_list.len());
        for ref_height in &block.transactions_generator_ref_list {
            if let Some(generator) = from_branch.get(ref_height) {
                generator_refs.push(generator.clone());
            } else if let Some(generator) = from_chain.get(ref_height) {
                generator_refs.push(generator.clone());
            } else {
                // get_generators_at accounts for every remaining height, so
                // a miss here means the chain itself is inconsistent
                return Err(ChainStorageError::Corruption(format!(
                    "generator ref to height {} resolved to no block",
                    ref_height
                )));
            }
        }
        Ok(Some(BlockGenerator {
            program,
            generator_refs,
        }))
    }

    /// Project main-chain blocks in `[start, stop]` into header blocks.
    /// With `tx_filter` each transaction block carries a membership filter
    /// over its addition puzzle hashes and removal coin ids.
    pub async fn get_header_blocks_in_range(
        &self,
        start: u32,
        stop: u32,
        tx_filter: bool,
    ) -> Result<Vec<HeaderBlock>, ChainStorageError> {
        let hashes: Vec<Bytes32> = {
            let height_map = self.height_map.read().expect("height map poisoned");
            (start..=stop)
                .map_while(|height| height_map.get_hash(height))
                .collect()
        };
        let blocks = self.block_store.get_blocks_by_hash(&hashes).await?;

        let mut headers = Vec::with_capacity(blocks.len());
        for (hash, block) in hashes.iter().zip(blocks) {
            let transactions_filter = if !tx_filter {
                None
            } else if block.is_transaction_block() {
                let mut elements: Vec<Vec<u8>> = Vec::new();
                for record in self
                    .coin_store
                    .get_coins_added_at_height(block.height)
                    .await?
                {
                    elements.push(record.coin.puzzle_hash.as_bytes().to_vec());
                }
                for record in self
                    .coin_store
                    .get_coins_removed_at_height(block.height)
                    .await?
                {
                    elements.push(record.name().as_bytes().to_vec());
                }
                Some(build_filter(*hash, &elements))
            } else {
                Some(build_filter(*hash, &[]))
            };
            headers.push(HeaderBlock {
                header_hash: *hash,
                prev_hash: block.prev_hash,
                height: block.height,
                timestamp: block.timestamp,
                transactions_filter,
            });
        }
        Ok(headers)
    }

    /// The finished sub-slots bracketing a block: the one its signage point
    /// fell in (if any) and the one it was infused into. Walks backward
    /// through `prev_hash` links until it finds blocks carrying finished
    /// sub-slots.
    pub async fn get_sp_and_ip_sub_slots(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<(Option<SubSlot>, Option<SubSlot>)>, ChainStorageError> {
        let block = match self.block_store.get_full_block(header_hash).await? {
            Some(block) => block,
            None => return Ok(None),
        };

        let mut current = block;
        loop {
            if !current.finished_sub_slots.is_empty() {
                let slots = &current.finished_sub_slots;
                let ip = slots.last().cloned();
                if slots.len() >= 2 {
                    return Ok(Some((Some(slots[slots.len() - 2].clone()), ip)));
                }
                // the sp sub-slot is the last one finished further back
                let mut walk = current.prev_hash;
                loop {
                    if current.height == 0 {
                        return Ok(Some((None, ip)));
                    }
                    let ancestor = match self.block_store.get_full_block(walk).await? {
                        Some(block) => block,
                        None => return Ok(Some((None, ip))),
                    };
                    if let Some(slot) = ancestor.finished_sub_slots.last() {
                        return Ok(Some((Some(slot.clone()), ip)));
                    }
                    if ancestor.height == 0 {
                        return Ok(Some((None, ip)));
                    }
                    walk = ancestor.prev_hash;
                }
            }
            if current.height == 0 {
                return Ok(Some((None, None)));
            }
            let prev = current.prev_hash;
            current = match self.block_store.get_full_block(prev).await? {
                Some(block) => block,
                None => return Ok(Some((None, None))),
            };
        }
    }
}
