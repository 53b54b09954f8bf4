//! Persistence for full blocks, block-record summaries and the peak pointer.
//!
//! All full blocks ever accepted live in `full_blocks`, orphans included;
//! the `in_main_chain` flag marks the unique gap-free chain from height 0
//! to the peak. Blobs are stored zstd-compressed next to the uncompressed
//! block-record blob so consensus lookups avoid decompression.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::block::{BlockRecord, FullBlock, SubEpochSegments};
use crate::db_version::ensure_version_2;
use crate::error::ChainStorageError;
use crate::transactional::{TransactionalStore, WriteTx};
use crate::types::Bytes32;

const BLOCK_CACHE_SIZE: usize = 1000;
const SES_CACHE_SIZE: usize = 50;

pub struct BlockStore {
    db: Arc<TransactionalStore>,
    block_cache: StdMutex<LruCache<Bytes32, Arc<FullBlock>>>,
    ses_cache: StdMutex<LruCache<Bytes32, Arc<SubEpochSegments>>>,
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore").finish_non_exhaustive()
    }
}

impl BlockStore {
    /// Create tables and indices. Refuses to open a schema-v1 file; v1 is
    /// migration input only.
    pub async fn create(db: Arc<TransactionalStore>) -> Result<Self, ChainStorageError> {
        {
            let tx = db.writer().await?;
            ensure_version_2(&tx)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS full_blocks(
                     header_hash blob PRIMARY KEY,
                     prev_hash blob,
                     height bigint,
                     sub_epoch_summary blob,
                     is_fully_compactified tinyint,
                     in_main_chain tinyint,
                     block blob,
                     block_record blob);
                 CREATE TABLE IF NOT EXISTS sub_epoch_segments_v3(
                     ses_block_hash blob PRIMARY KEY,
                     challenge_segments blob);
                 CREATE TABLE IF NOT EXISTS current_peak(key int PRIMARY KEY, hash blob);
                 CREATE INDEX IF NOT EXISTS height ON full_blocks(height);
                 CREATE INDEX IF NOT EXISTS is_fully_compactified
                     ON full_blocks(is_fully_compactified);",
            )?;
            tx.commit()?;
        }
        Ok(BlockStore {
            db,
            block_cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("nonzero cache size"),
            )),
            ses_cache: StdMutex::new(LruCache::new(
                NonZeroUsize::new(SES_CACHE_SIZE).expect("nonzero cache size"),
            )),
        })
    }

    pub fn pool(&self) -> &Arc<TransactionalStore> {
        &self.db
    }

    // ========== Mutations (caller holds the write transaction) ==========

    /// Upsert both blobs for a block. Re-adding the same hash is a no-op in
    /// effect. Does not touch `in_main_chain`; that is the coordinator's
    /// decision.
    pub fn add_full_block(
        &self,
        tx: &WriteTx<'_>,
        header_hash: Bytes32,
        block: &FullBlock,
        block_record: &BlockRecord,
    ) -> Result<(), ChainStorageError> {
        let compressed = block.compress()?;
        let record_bytes = block_record.to_bytes()?;
        let ses_bytes = block_record
            .sub_epoch_summary_included
            .as_ref()
            .map(|ses| ses.0.clone());
        tx.execute(
            "INSERT OR REPLACE INTO full_blocks
             VALUES(?, ?, ?, ?, ?, COALESCE(
                 (SELECT in_main_chain FROM full_blocks WHERE header_hash=?), 0), ?, ?)",
            params![
                header_hash,
                block.prev_hash,
                block.height,
                ses_bytes,
                block.is_fully_compactified as i64,
                header_hash,
                compressed,
                record_bytes,
            ],
        )?;
        self.block_cache
            .lock()
            .expect("block cache poisoned")
            .put(header_hash, Arc::new(block.clone()));
        Ok(())
    }

    /// Batch-set `in_main_chain=1` for the given hashes.
    pub fn set_in_chain(
        &self,
        tx: &WriteTx<'_>,
        header_hashes: &[Bytes32],
    ) -> Result<(), ChainStorageError> {
        let mut stmt =
            tx.prepare_cached("UPDATE full_blocks SET in_main_chain=1 WHERE header_hash=?")?;
        for hash in header_hashes {
            let updated = stmt.execute(params![hash])?;
            if updated == 0 {
                return Err(ChainStorageError::MissingBlockInChain(*hash));
            }
        }
        Ok(())
    }

    /// Clear the main-chain flag above `height`; afterwards the flagged set
    /// equals the chain prefix `[0..height]`.
    pub fn rollback(&self, tx: &WriteTx<'_>, height: u32) -> Result<(), ChainStorageError> {
        tx.execute(
            "UPDATE full_blocks SET in_main_chain=0 WHERE height>? AND in_main_chain=1",
            params![height],
        )?;
        Ok(())
    }

    /// Overwrite the single peak row. Left uncommitted with the rest of the
    /// enclosing transaction so coin state and peak move together.
    pub fn set_peak(&self, tx: &WriteTx<'_>, header_hash: Bytes32) -> Result<(), ChainStorageError> {
        tx.execute(
            "INSERT OR REPLACE INTO current_peak VALUES(0, ?)",
            params![header_hash],
        )?;
        Ok(())
    }

    /// Drop a block from the LRU after an aborted write transaction. Best
    /// effort; the block may never have been cached.
    pub fn rollback_cache_block(&self, header_hash: Bytes32) {
        self.block_cache
            .lock()
            .expect("block cache poisoned")
            .pop(&header_hash);
    }

    /// Overwrite the block blob for an existing hash (background
    /// compactification pass).
    pub async fn replace_proof(
        &self,
        header_hash: Bytes32,
        block: &FullBlock,
    ) -> Result<(), ChainStorageError> {
        let compressed = block.compress()?;
        let tx = self.db.writer().await?;
        let updated = tx.execute(
            "UPDATE full_blocks SET block=?, is_fully_compactified=? WHERE header_hash=?",
            params![compressed, block.is_fully_compactified as i64, header_hash],
        )?;
        if updated == 0 {
            return Err(ChainStorageError::MissingBlockInChain(header_hash));
        }
        tx.commit()?;
        self.block_cache
            .lock()
            .expect("block cache poisoned")
            .pop(&header_hash);
        Ok(())
    }

    pub async fn persist_sub_epoch_challenge_segments(
        &self,
        ses_block_hash: Bytes32,
        segments: &SubEpochSegments,
    ) -> Result<(), ChainStorageError> {
        let bytes = segments.to_bytes()?;
        let tx = self.db.writer().await?;
        tx.execute(
            "INSERT OR REPLACE INTO sub_epoch_segments_v3 VALUES(?, ?)",
            params![ses_block_hash, bytes],
        )?;
        tx.commit()?;
        self.ses_cache
            .lock()
            .expect("ses cache poisoned")
            .put(ses_block_hash, Arc::new(segments.clone()));
        Ok(())
    }

    // ========== Reads ==========

    fn cache_get(&self, header_hash: &Bytes32) -> Option<Arc<FullBlock>> {
        self.block_cache
            .lock()
            .expect("block cache poisoned")
            .get(header_hash)
            .cloned()
    }

    fn cache_put(&self, header_hash: Bytes32, block: Arc<FullBlock>) {
        self.block_cache
            .lock()
            .expect("block cache poisoned")
            .put(header_hash, block);
    }

    fn get_full_block_on(
        &self,
        conn: &Connection,
        header_hash: Bytes32,
    ) -> Result<Option<Arc<FullBlock>>, ChainStorageError> {
        if let Some(cached) = self.cache_get(&header_hash) {
            debug!(block = %header_hash, "cache hit");
            return Ok(Some(cached));
        }
        debug!(block = %header_hash, "cache miss");
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT block FROM full_blocks WHERE header_hash=?",
                params![header_hash],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => {
                let block = Arc::new(FullBlock::decompress(&blob)?);
                self.cache_put(header_hash, block.clone());
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    pub async fn get_full_block(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<Arc<FullBlock>>, ChainStorageError> {
        if let Some(cached) = self.cache_get(&header_hash) {
            return Ok(Some(cached));
        }
        let reader = self.db.reader().await?;
        self.get_full_block_on(&reader, header_hash)
    }

    /// Same lookup from inside an open write transaction (sees uncommitted
    /// additions).
    pub fn get_full_block_tx(
        &self,
        tx: &WriteTx<'_>,
        header_hash: Bytes32,
    ) -> Result<Option<Arc<FullBlock>>, ChainStorageError> {
        self.get_full_block_on(tx, header_hash)
    }

    /// Decompressed serialized bytes of the block, or `None` if absent.
    pub async fn get_full_block_bytes(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<Vec<u8>>, ChainStorageError> {
        if let Some(cached) = self.cache_get(&header_hash) {
            return Ok(Some(cached.to_bytes()?));
        }
        let reader = self.db.reader().await?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT block FROM full_blocks WHERE header_hash=?",
                params![header_hash],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(crate::block::decompress_blob(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn get_full_blocks_at(
        &self,
        heights: &[u32],
    ) -> Result<Vec<FullBlock>, ChainStorageError> {
        if heights.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut blocks = Vec::new();
        for batch in heights.chunks(self.db.host_parameter_limit()) {
            let sql = format!(
                "SELECT block FROM full_blocks WHERE height IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |row| {
                row.get::<_, Vec<u8>>(0)
            })?;
            for row in rows {
                blocks.push(FullBlock::decompress(&row?)?);
            }
        }
        Ok(blocks)
    }

    fn get_block_record_on(
        &self,
        conn: &Connection,
        header_hash: Bytes32,
    ) -> Result<Option<BlockRecord>, ChainStorageError> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT block_record FROM full_blocks WHERE header_hash=?",
                params![header_hash],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => Ok(Some(BlockRecord::from_bytes(&blob)?)),
            None => Ok(None),
        }
    }

    pub async fn get_block_record(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<BlockRecord>, ChainStorageError> {
        let reader = self.db.reader().await?;
        self.get_block_record_on(&reader, header_hash)
    }

    pub fn get_block_record_tx(
        &self,
        tx: &WriteTx<'_>,
        header_hash: Bytes32,
    ) -> Result<Option<BlockRecord>, ChainStorageError> {
        self.get_block_record_on(tx, header_hash)
    }

    /// Block records for heights `[peak - blocks_n, peak]` (orphans at
    /// those heights included) plus the peak hash. Used at startup to warm
    /// the coordinator's record cache.
    pub async fn get_block_records_close_to_peak(
        &self,
        blocks_n: u32,
    ) -> Result<(HashMap<Bytes32, BlockRecord>, Option<Bytes32>), ChainStorageError> {
        let peak = match self.get_peak().await? {
            Some(peak) => peak,
            None => return Ok((HashMap::new(), None)),
        };
        let cutoff = peak.1.saturating_sub(blocks_n);
        let reader = self.db.reader().await?;
        let mut stmt =
            reader.prepare("SELECT header_hash, block_record FROM full_blocks WHERE height >= ?")?;
        let rows = stmt.query_map(params![cutoff], |row| {
            Ok((row.get::<_, Bytes32>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut records = HashMap::new();
        for row in rows {
            let (hash, blob) = row?;
            records.insert(hash, BlockRecord::from_bytes(&blob)?);
        }
        Ok((records, Some(peak.0)))
    }

    pub async fn get_block_records_in_range(
        &self,
        start: u32,
        stop: u32,
    ) -> Result<HashMap<Bytes32, BlockRecord>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare(
            "SELECT header_hash, block_record FROM full_blocks WHERE height >= ? AND height <= ?",
        )?;
        let rows = stmt.query_map(params![start, stop], |row| {
            Ok((row.get::<_, Bytes32>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut records = HashMap::new();
        for row in rows {
            let (hash, blob) = row?;
            records.insert(hash, BlockRecord::from_bytes(&blob)?);
        }
        Ok(records)
    }

    /// Block records in input order. Fails if any hash is absent.
    pub async fn get_block_records_by_hash(
        &self,
        header_hashes: &[Bytes32],
    ) -> Result<Vec<BlockRecord>, ChainStorageError> {
        if header_hashes.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut found: HashMap<Bytes32, BlockRecord> = HashMap::new();
        for batch in header_hashes.chunks(self.db.host_parameter_limit()) {
            let sql = format!(
                "SELECT header_hash, block_record FROM full_blocks WHERE header_hash IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, Bytes32>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (hash, blob) = row?;
                found.insert(hash, BlockRecord::from_bytes(&blob)?);
            }
        }
        let mut ordered = Vec::with_capacity(header_hashes.len());
        for hash in header_hashes {
            match found.get(hash) {
                Some(record) => ordered.push(record.clone()),
                None => return Err(ChainStorageError::MissingBlockInChain(*hash)),
            }
        }
        Ok(ordered)
    }

    /// Full blocks in input order. Fails if any hash is absent.
    pub async fn get_blocks_by_hash(
        &self,
        header_hashes: &[Bytes32],
    ) -> Result<Vec<Arc<FullBlock>>, ChainStorageError> {
        let raw = self.get_block_bytes_by_hash(header_hashes).await?;
        let mut blocks = Vec::with_capacity(raw.len());
        for (hash, bytes) in header_hashes.iter().zip(raw) {
            let block = Arc::new(FullBlock::from_bytes(&bytes)?);
            self.cache_put(*hash, block.clone());
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Decompressed block bytes in input order. Fails if any hash is absent.
    pub async fn get_block_bytes_by_hash(
        &self,
        header_hashes: &[Bytes32],
    ) -> Result<Vec<Vec<u8>>, ChainStorageError> {
        if header_hashes.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut found: HashMap<Bytes32, Vec<u8>> = HashMap::new();
        for batch in header_hashes.chunks(self.db.host_parameter_limit()) {
            let sql = format!(
                "SELECT header_hash, block FROM full_blocks WHERE header_hash IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, Bytes32>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (hash, blob) = row?;
                found.insert(hash, crate::block::decompress_blob(&blob)?);
            }
        }
        let mut ordered = Vec::with_capacity(header_hashes.len());
        for hash in header_hashes {
            match found.remove(hash) {
                Some(bytes) => ordered.push(bytes),
                None => return Err(ChainStorageError::MissingBlockInChain(*hash)),
            }
        }
        Ok(ordered)
    }

    /// Transaction generators for main-chain blocks at the given heights.
    /// Fails with `GeneratorRefHasNoGenerator` when a requested block
    /// exists but carries no generator payload; a height with no chain
    /// block at all is an invariant violation, not a recoverable miss.
    pub async fn get_generators_at(
        &self,
        heights: &HashSet<u32>,
    ) -> Result<HashMap<u32, Vec<u8>>, ChainStorageError> {
        if heights.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.db.reader().await?;
        let mut generators = HashMap::new();
        let sorted: Vec<u32> = {
            let mut v: Vec<u32> = heights.iter().copied().collect();
            v.sort_unstable();
            v
        };
        for batch in sorted.chunks(self.db.host_parameter_limit()) {
            let sql = format!(
                "SELECT height, block FROM full_blocks
                 WHERE in_main_chain=1 AND height IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |row| {
                Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            for row in rows {
                let (height, blob) = row?;
                let block = FullBlock::decompress(&blob)?;
                match block.transactions_generator {
                    Some(generator) => {
                        generators.insert(height, generator);
                    }
                    None => return Err(ChainStorageError::GeneratorRefHasNoGenerator(height)),
                }
            }
        }
        for height in heights {
            if !generators.contains_key(height) {
                return Err(ChainStorageError::Corruption(format!(
                    "generator ref to height {} which has no block on the main chain",
                    height
                )));
            }
        }
        Ok(generators)
    }

    fn get_peak_on(
        &self,
        conn: &Connection,
    ) -> Result<Option<(Bytes32, u32)>, ChainStorageError> {
        let hash: Option<Bytes32> = conn
            .query_row("SELECT hash FROM current_peak WHERE key = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        let hash = match hash {
            Some(hash) => hash,
            None => return Ok(None),
        };
        let height: Option<u32> = conn
            .query_row(
                "SELECT height FROM full_blocks WHERE header_hash=?",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        match height {
            Some(height) => Ok(Some((hash, height))),
            None => Ok(None),
        }
    }

    pub async fn get_peak(&self) -> Result<Option<(Bytes32, u32)>, ChainStorageError> {
        let reader = self.db.reader().await?;
        self.get_peak_on(&reader)
    }

    pub fn get_peak_tx(
        &self,
        tx: &WriteTx<'_>,
    ) -> Result<Option<(Bytes32, u32)>, ChainStorageError> {
        self.get_peak_on(tx)
    }

    pub async fn is_fully_compactified(
        &self,
        header_hash: Bytes32,
    ) -> Result<Option<bool>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let row: Option<i64> = reader
            .query_row(
                "SELECT is_fully_compactified FROM full_blocks WHERE header_hash=?",
                params![header_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.map(|v| v != 0))
    }

    /// Up to `number` distinct heights where every block at that height is
    /// uncompactified. Orphans do not get compactified, so a height with a
    /// compact orphan but an uncompact chain block is skipped; the
    /// occasional chain block staying uncompact is harmless.
    pub async fn get_random_not_compactified(
        &self,
        number: usize,
    ) -> Result<Vec<u32>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare(
            "SELECT height FROM full_blocks GROUP BY height
             HAVING sum(is_fully_compactified)=0 ORDER BY RANDOM() LIMIT ?",
        )?;
        let rows = stmt.query_map(params![number as i64], |row| row.get::<_, u32>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn count_compactified_blocks(&self) -> Result<u64, ChainStorageError> {
        let reader = self.db.reader().await?;
        let count: i64 = reader.query_row(
            "SELECT count(*) FROM full_blocks WHERE is_fully_compactified=1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn count_uncompactified_blocks(&self) -> Result<u64, ChainStorageError> {
        let reader = self.db.reader().await?;
        let count: i64 = reader.query_row(
            "SELECT count(*) FROM full_blocks WHERE is_fully_compactified=0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub async fn get_sub_epoch_challenge_segments(
        &self,
        ses_block_hash: Bytes32,
    ) -> Result<Option<Arc<SubEpochSegments>>, ChainStorageError> {
        if let Some(cached) = self
            .ses_cache
            .lock()
            .expect("ses cache poisoned")
            .get(&ses_block_hash)
            .cloned()
        {
            return Ok(Some(cached));
        }
        let reader = self.db.reader().await?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT challenge_segments FROM sub_epoch_segments_v3 WHERE ses_block_hash=?",
                params![ses_block_hash],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(blob) => {
                let segments = Arc::new(SubEpochSegments::from_bytes(&blob)?);
                self.ses_cache
                    .lock()
                    .expect("ses cache poisoned")
                    .put(ses_block_hash, segments.clone());
                Ok(Some(segments))
            }
            None => Ok(None),
        }
    }

    fn get_prev_hash_on(
        &self,
        conn: &Connection,
        header_hash: Bytes32,
    ) -> Result<Bytes32, ChainStorageError> {
        conn.query_row(
            "SELECT prev_hash FROM full_blocks WHERE header_hash=?",
            params![header_hash],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(ChainStorageError::MissingBlockInChain(header_hash))
    }

    pub async fn get_prev_hash(&self, header_hash: Bytes32) -> Result<Bytes32, ChainStorageError> {
        let reader = self.db.reader().await?;
        self.get_prev_hash_on(&reader, header_hash)
    }

    pub fn get_prev_hash_tx(
        &self,
        tx: &WriteTx<'_>,
        header_hash: Bytes32,
    ) -> Result<Bytes32, ChainStorageError> {
        self.get_prev_hash_on(tx, header_hash)
    }
}

pub(crate) fn placeholders(count: usize) -> String {
    let mut s = "?,".repeat(count);
    s.pop();
    s
}
