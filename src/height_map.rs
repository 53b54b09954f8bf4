//! In-memory main-chain height index, rebuilt from the block store at
//! startup and periodically snapshotted to disk.
//!
//! `height_to_hash` is dense over `[0..=peak]`; the sub-epoch summary map
//! is sparse. Both are derived data: the block rows (and their
//! `in_main_chain` flags) stay authoritative, and the packed snapshot file
//! only short-circuits the rebuild scan when it agrees with the persisted
//! peak.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::OptionalExtension;
use tracing::{debug, info, warn};

use crate::block::SubEpochSummary;
use crate::error::ChainStorageError;
use crate::transactional::TransactionalStore;
use crate::types::Bytes32;

pub const HEIGHT_FILE_NAME: &str = "height-to-hash.dat";

/// Snapshot cadence: at least this many new heights between flushes.
const FLUSH_INTERVAL: u32 = 1000;

pub struct HeightMap {
    height_to_hash: Vec<Bytes32>,
    sub_epoch_summaries: BTreeMap<u32, SubEpochSummary>,
    snapshot_path: PathBuf,
    heights_since_flush: u32,
}

impl HeightMap {
    /// Load the peak and populate both maps, preferring the snapshot file
    /// when it is consistent with the persisted peak.
    pub async fn create(
        persistence_dir: &Path,
        db: &Arc<TransactionalStore>,
    ) -> Result<Self, ChainStorageError> {
        let snapshot_path = persistence_dir.join(HEIGHT_FILE_NAME);
        let mut map = HeightMap {
            height_to_hash: Vec::new(),
            sub_epoch_summaries: BTreeMap::new(),
            snapshot_path,
            heights_since_flush: 0,
        };

        let reader = db.reader().await?;
        let peak_hash: Option<Bytes32> = reader
            .query_row("SELECT hash FROM current_peak WHERE key = 0", [], |row| {
                row.get(0)
            })
            .optional()?;
        let peak_hash = match peak_hash {
            Some(hash) => hash,
            None => return Ok(map),
        };
        let peak_height: u32 = reader
            .query_row(
                "SELECT height FROM full_blocks WHERE header_hash=?",
                [peak_hash],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                ChainStorageError::Corruption(format!(
                    "current_peak points at missing block {}",
                    peak_hash
                ))
            })?;

        if let Some(cached) = load_snapshot(&map.snapshot_path, peak_height, peak_hash).await {
            info!(peak_height, "loaded height map snapshot");
            map.height_to_hash = cached;
        } else {
            debug!(peak_height, "rebuilding height map from block records");
            map.height_to_hash = rebuild_from_store(&reader, peak_height, peak_hash)?;
        }

        // the summary map is sparse; a single indexed scan covers it
        let mut stmt = reader.prepare(
            "SELECT height, sub_epoch_summary FROM full_blocks
             WHERE in_main_chain=1 AND sub_epoch_summary IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (height, blob) = row?;
            if height <= peak_height {
                map.sub_epoch_summaries.insert(height, SubEpochSummary(blob));
            }
        }

        Ok(map)
    }

    pub fn get_hash(&self, height: u32) -> Option<Bytes32> {
        self.height_to_hash.get(height as usize).copied()
    }

    pub fn contains_height(&self, height: u32) -> bool {
        (height as usize) < self.height_to_hash.len()
    }

    pub fn peak_height(&self) -> Option<u32> {
        if self.height_to_hash.is_empty() {
            None
        } else {
            Some(self.height_to_hash.len() as u32 - 1)
        }
    }

    pub fn get_ses(&self, height: u32) -> Option<&SubEpochSummary> {
        self.sub_epoch_summaries.get(&height)
    }

    pub fn get_ses_heights(&self) -> Vec<u32> {
        self.sub_epoch_summaries.keys().copied().collect()
    }

    /// Record one block added to the main chain. Entries above `height` are
    /// dropped: a replay ascends strictly, so anything above the entry
    /// being written belongs to the abandoned branch.
    pub fn update_height(
        &mut self,
        height: u32,
        header_hash: Bytes32,
        ses: Option<&SubEpochSummary>,
    ) -> Result<(), ChainStorageError> {
        let index = height as usize;
        if index > self.height_to_hash.len() {
            return Err(ChainStorageError::InvalidOperation(format!(
                "height map update at {} would leave a gap (peak {:?})",
                height,
                self.peak_height()
            )));
        }
        if index == self.height_to_hash.len() {
            self.height_to_hash.push(header_hash);
        } else {
            self.height_to_hash[index] = header_hash;
            self.height_to_hash.truncate(index + 1);
        }
        if let Some(ses) = ses {
            self.sub_epoch_summaries.insert(height, ses.clone());
        }
        self.heights_since_flush += 1;
        Ok(())
    }

    /// Drop sub-epoch summaries above the fork. The hash entries above it
    /// are left for the replay to overwrite.
    pub fn rollback(&mut self, fork_height: u32) {
        let dropped = self.sub_epoch_summaries.split_off(&(fork_height + 1));
        for height in dropped.keys() {
            info!(height, "dropped sub-epoch summary in rollback");
        }
    }

    /// Persist the snapshot if enough heights accumulated since the last
    /// flush.
    pub fn maybe_flush(&mut self) -> Result<(), ChainStorageError> {
        if self.heights_since_flush < FLUSH_INTERVAL {
            return Ok(());
        }
        self.flush()
    }

    /// Write the packed `height * 32` byte snapshot (atomically, via a
    /// sibling temp file).
    pub fn flush(&mut self) -> Result<(), ChainStorageError> {
        let mut packed = Vec::with_capacity(self.height_to_hash.len() * 32);
        for hash in &self.height_to_hash {
            packed.extend_from_slice(hash.as_bytes());
        }
        let tmp_path = self.snapshot_path.with_extension("tmp");
        std::fs::write(&tmp_path, &packed)?;
        std::fs::rename(&tmp_path, &self.snapshot_path)?;
        self.heights_since_flush = 0;
        debug!(
            heights = self.height_to_hash.len(),
            path = %self.snapshot_path.display(),
            "flushed height map snapshot"
        );
        Ok(())
    }
}

/// Accept the snapshot only if it covers exactly `[0..=peak_height]` and
/// its last entry is the peak hash.
async fn load_snapshot(
    path: &Path,
    peak_height: u32,
    peak_hash: Bytes32,
) -> Option<Vec<Bytes32>> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let expected_len = (peak_height as usize + 1) * 32;
    if bytes.len() != expected_len {
        warn!(
            path = %path.display(),
            "height map snapshot has wrong size, rebuilding"
        );
        return None;
    }
    let mut entries = Vec::with_capacity(peak_height as usize + 1);
    for chunk in bytes.chunks_exact(32) {
        entries.push(Bytes32::from_slice(chunk)?);
    }
    if entries.last() != Some(&peak_hash) {
        warn!(
            path = %path.display(),
            "height map snapshot disagrees with peak, rebuilding"
        );
        return None;
    }
    Some(entries)
}

/// One ordered scan over the main-chain rows, verifying the result is a
/// gap-free linked chain ending at the peak.
fn rebuild_from_store(
    conn: &rusqlite::Connection,
    peak_height: u32,
    peak_hash: Bytes32,
) -> Result<Vec<Bytes32>, ChainStorageError> {
    let mut stmt = conn.prepare(
        "SELECT header_hash, prev_hash, height FROM full_blocks
         WHERE in_main_chain=1 AND height <= ? ORDER BY height",
    )?;
    let rows = stmt.query_map([peak_height], |row| {
        Ok((
            row.get::<_, Bytes32>(0)?,
            row.get::<_, Bytes32>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })?;

    let mut entries: Vec<Bytes32> = Vec::with_capacity(peak_height as usize + 1);
    for row in rows {
        let (header_hash, prev_hash, height) = row?;
        if height as usize != entries.len() {
            return Err(ChainStorageError::Corruption(format!(
                "main chain has a gap or duplicate at height {}",
                height
            )));
        }
        if height > 0 && entries[height as usize - 1] != prev_hash {
            return Err(ChainStorageError::Corruption(format!(
                "main chain link broken at height {}",
                height
            )));
        }
        entries.push(header_hash);
    }
    if entries.len() != peak_height as usize + 1 {
        return Err(ChainStorageError::Corruption(format!(
            "main chain covers {} heights, expected {}",
            entries.len(),
            peak_height + 1
        )));
    }
    if entries[peak_height as usize] != peak_hash {
        return Err(ChainStorageError::Corruption(
            "main chain tip does not match the persisted peak".into(),
        ));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStore;
    use crate::test_helpers::{temp_pool, ChainBuilder};

    async fn seeded_store(
        length: u32,
    ) -> (
        Arc<TransactionalStore>,
        BlockStore,
        ChainBuilder,
        tempfile::TempDir,
    ) {
        let (pool, dir) = temp_pool().await;
        let store = BlockStore::create(pool.clone()).await.unwrap();
        let mut chain = ChainBuilder::new(3);
        chain.extend_to(length);
        let tx = pool.writer().await.unwrap();
        for block in chain.blocks() {
            store
                .add_full_block(&tx, block.header_hash, &block.block, &block.record)
                .unwrap();
        }
        let hashes: Vec<Bytes32> = chain.blocks().iter().map(|b| b.header_hash).collect();
        store.set_in_chain(&tx, &hashes).unwrap();
        store.set_peak(&tx, chain.tip().header_hash).unwrap();
        tx.commit().unwrap();
        (pool, store, chain, dir)
    }

    #[tokio::test]
    async fn test_rebuild_matches_chain() {
        let (pool, _store, chain, dir) = seeded_store(20).await;
        let map = HeightMap::create(dir.path(), &pool).await.unwrap();
        assert_eq!(map.peak_height(), Some(19));
        for block in chain.blocks() {
            assert_eq!(map.get_hash(block.block.height), Some(block.header_hash));
        }
        assert!(!map.contains_height(20));
        // ses markers collected from the records
        let expected: Vec<u32> = chain
            .blocks()
            .iter()
            .filter(|b| b.record.sub_epoch_summary_included.is_some())
            .map(|b| b.block.height)
            .collect();
        assert_eq!(map.get_ses_heights(), expected);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let (pool, _store, chain, dir) = seeded_store(15).await;
        {
            let mut map = HeightMap::create(dir.path(), &pool).await.unwrap();
            map.flush().unwrap();
        }
        let map = HeightMap::create(dir.path(), &pool).await.unwrap();
        assert_eq!(map.peak_height(), Some(14));
        assert_eq!(map.get_hash(7), Some(chain.blocks()[7].header_hash));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_rejected() {
        let (pool, _store, _chain, dir) = seeded_store(10).await;
        // a snapshot of the wrong length
        tokio::fs::write(dir.path().join(HEIGHT_FILE_NAME), vec![0u8; 32 * 4])
            .await
            .unwrap();
        let map = HeightMap::create(dir.path(), &pool).await.unwrap();
        assert_eq!(map.peak_height(), Some(9));

        // right length, wrong tip
        tokio::fs::write(dir.path().join(HEIGHT_FILE_NAME), vec![0u8; 32 * 10])
            .await
            .unwrap();
        let map = HeightMap::create(dir.path(), &pool).await.unwrap();
        assert_eq!(map.peak_height(), Some(9));
        assert_ne!(map.get_hash(9), Some(Bytes32::new([0; 32])));
    }

    #[tokio::test]
    async fn test_update_and_rollback() {
        let (pool, _store, chain, dir) = seeded_store(10).await;
        let mut map = HeightMap::create(dir.path(), &pool).await.unwrap();

        let ses = SubEpochSummary(vec![1, 2, 3]);
        map.update_height(10, Bytes32::new([0x10; 32]), Some(&ses))
            .unwrap();
        assert_eq!(map.peak_height(), Some(10));
        assert!(map.get_ses(10).is_some());

        // a gap is a caller bug
        assert!(map
            .update_height(15, Bytes32::new([0x15; 32]), None)
            .is_err());

        map.rollback(5);
        assert!(map.get_ses(10).is_none());
        // hash entries above the fork remain until overwritten
        assert_eq!(map.get_hash(9), Some(chain.blocks()[9].header_hash));

        // overwriting mid-chain truncates the tail
        map.update_height(6, Bytes32::new([0x66; 32]), None).unwrap();
        assert_eq!(map.peak_height(), Some(6));
        assert_eq!(map.get_hash(6), Some(Bytes32::new([0x66; 32])));
        assert!(!map.contains_height(7));
    }

    #[tokio::test]
    async fn test_empty_store() {
        let (pool, dir) = temp_pool().await;
        let store = BlockStore::create(pool.clone()).await.unwrap();
        drop(store);
        let map = HeightMap::create(dir.path(), &pool).await.unwrap();
        assert_eq!(map.peak_height(), None);
        assert!(!map.contains_height(0));
    }
}
