//! Offline population and verification of the weight-proof segment table.
//!
//! Proof assembly belongs to upper layers; what lives here is the
//! persistence side: every sub-epoch summary on the main chain gets a
//! `sub_epoch_segments_v3` row, keyed by the block that carried the
//! summary and holding the packed block-record segments of its sub-epoch.
//! Embedders that assemble richer segments overwrite these rows through
//! `persist_sub_epoch_challenge_segments`.

use std::sync::Arc;

use tracing::info;

use crate::block::{ChallengeSegment, SubEpochSegments};
use crate::block_store::BlockStore;
use crate::error::ChainStorageError;
use crate::transactional::TransactionalStore;
use crate::types::Bytes32;

/// The blocks that carry a sub-epoch summary, in height order.
async fn ses_blocks(
    pool: &Arc<TransactionalStore>,
) -> Result<Vec<(u32, Bytes32)>, ChainStorageError> {
    let reader = pool.reader().await?;
    let mut stmt = reader.prepare(
        "SELECT height, header_hash FROM full_blocks
         WHERE in_main_chain=1 AND sub_epoch_summary IS NOT NULL ORDER BY height",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Bytes32>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

async fn segment_rows(
    pool: &Arc<TransactionalStore>,
    start: u32,
    end: u32,
) -> Result<Vec<ChallengeSegment>, ChainStorageError> {
    let reader = pool.reader().await?;
    let mut stmt = reader.prepare(
        "SELECT height, block_record FROM full_blocks
         WHERE in_main_chain=1 AND height >= ? AND height <= ? ORDER BY height",
    )?;
    let rows = stmt.query_map([start, end], |row| {
        Ok(ChallengeSegment {
            height: row.get(0)?,
            payload: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Populate missing segment rows. Returns how many were built.
pub async fn build_segments(
    pool: &Arc<TransactionalStore>,
    block_store: &BlockStore,
) -> Result<usize, ChainStorageError> {
    let ses = ses_blocks(pool).await?;
    let mut built = 0usize;
    let mut sub_epoch_start = 0u32;
    for (height, header_hash) in ses {
        if block_store
            .get_sub_epoch_challenge_segments(header_hash)
            .await?
            .is_none()
        {
            let segments = SubEpochSegments {
                ses_block_hash: header_hash,
                segments: segment_rows(pool, sub_epoch_start, height).await?,
            };
            block_store
                .persist_sub_epoch_challenge_segments(header_hash, &segments)
                .await?;
            built += 1;
            info!(height, ses_block = %header_hash, "built sub-epoch segments");
        }
        sub_epoch_start = height + 1;
    }
    Ok(built)
}

/// Verify every sub-epoch summary block has a decodable segment row that
/// round-trips its key. Returns `(checked, problems)`.
pub async fn check_segments(
    pool: &Arc<TransactionalStore>,
    block_store: &BlockStore,
) -> Result<(usize, Vec<Bytes32>), ChainStorageError> {
    let ses = ses_blocks(pool).await?;
    let mut checked = 0usize;
    let mut problems = Vec::new();
    for (_height, header_hash) in ses {
        checked += 1;
        match block_store
            .get_sub_epoch_challenge_segments(header_hash)
            .await
        {
            Ok(Some(segments)) if segments.ses_block_hash == header_hash => {}
            Ok(_) => problems.push(header_hash),
            Err(ChainStorageError::Codec(_)) => problems.push(header_hash),
            Err(e) => return Err(e),
        }
    }
    Ok((checked, problems))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{temp_pool, ChainBuilder};

    async fn seeded(
    ) -> (Arc<TransactionalStore>, BlockStore, ChainBuilder, tempfile::TempDir) {
        let (pool, dir) = temp_pool().await;
        let store = BlockStore::create(pool.clone()).await.unwrap();
        let mut chain = ChainBuilder::new(11);
        chain.extend_to(30);
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
    async fn test_build_and_check_segments() {
        let (pool, store, chain, _dir) = seeded().await;
        let ses_count = chain
            .blocks()
            .iter()
            .filter(|b| b.record.sub_epoch_summary_included.is_some())
            .count();
        assert!(ses_count > 0);

        let built = build_segments(&pool, &store).await.unwrap();
        assert_eq!(built, ses_count);
        // idempotent: existing rows are not rebuilt
        assert_eq!(build_segments(&pool, &store).await.unwrap(), 0);

        let (checked, problems) = check_segments(&pool, &store).await.unwrap();
        assert_eq!(checked, ses_count);
        assert!(problems.is_empty());
    }

    #[tokio::test]
    async fn test_check_flags_missing_rows() {
        let (pool, store, _chain, _dir) = seeded().await;
        build_segments(&pool, &store).await.unwrap();
        // drop one row behind the store's back
        {
            let tx = pool.writer().await.unwrap();
            tx.execute(
                "DELETE FROM sub_epoch_segments_v3 WHERE ses_block_hash IN
                 (SELECT ses_block_hash FROM sub_epoch_segments_v3 LIMIT 1)",
                [],
            )
            .unwrap();
            tx.commit().unwrap();
        }
        // a fresh store, so the segment cache is cold
        let store = BlockStore::create(pool.clone()).await.unwrap();
        let (_checked, problems) = check_segments(&pool, &store).await.unwrap();
        assert_eq!(problems.len(), 1);
    }

    #[tokio::test]
    async fn test_segments_cover_their_sub_epoch() {
        let (pool, store, chain, _dir) = seeded().await;
        build_segments(&pool, &store).await.unwrap();

        let ses_heights: Vec<u32> = chain
            .blocks()
            .iter()
            .filter(|b| b.record.sub_epoch_summary_included.is_some())
            .map(|b| b.block.height)
            .collect();
        let first = ses_heights[0];
        let hash = chain.blocks()[first as usize].header_hash;
        let segments = store
            .get_sub_epoch_challenge_segments(hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segments.segments.first().map(|s| s.height), Some(0));
        assert_eq!(segments.segments.last().map(|s| s.height), Some(first));
    }
}
