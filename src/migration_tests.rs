//! v1 -> v2 migration scenarios: a sizeable chain with orphans, duplicate
//! hints and spent-after-peak coins, converted and then read back through
//! the v2 stores and the validator.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;

use crate::block::{ChallengeSegment, SubEpochSegments};
use crate::block_store::BlockStore;
use crate::coin_store::CoinStore;
use crate::db_upgrade::convert_v1_to_v2;
use crate::db_validate::validate_v2;
use crate::error::ChainStorageError;
use crate::hint_store::HintStore;
use crate::test_helpers::{
    build_v1_db, make_coin, make_hash, orphan_at, reward_coins, ChainBuilder, TestBlock,
};
use crate::transactional::{StoreOptions, TransactionalStore};
use crate::types::{Bytes32, CoinRecord};

const CHAIN_LENGTH: u32 = 1000;

struct V1Fixture {
    dir: TempDir,
    chain: ChainBuilder,
    clamped_coin: CoinRecord,
    dropped_coin: CoinRecord,
    hint_rows: Vec<(Bytes32, Vec<u8>)>,
    distinct_hints: usize,
    ses_rows: Vec<(Bytes32, Vec<u8>)>,
}

impl V1Fixture {
    fn v1_path(&self) -> std::path::PathBuf {
        self.dir.path().join("blockchain_v1_test.sqlite")
    }

    fn v2_path(&self) -> std::path::PathBuf {
        self.dir.path().join("blockchain_v2_test.sqlite")
    }
}

fn build_fixture() -> V1Fixture {
    let dir = TempDir::new().unwrap();
    let mut chain = ChainBuilder::new(21);
    chain.extend_to(CHAIN_LENGTH);
    let peak_height = CHAIN_LENGTH - 1;

    let orphans: Vec<TestBlock> = [100u32, 250, 999]
        .iter()
        .map(|h| orphan_at(&chain, *h, 77))
        .collect();

    // reward coins for every block; every fifth farmer coin spent one
    // block later
    let mut coin_rows = Vec::new();
    for height in 1..CHAIN_LENGTH {
        for (i, coin) in reward_coins(21, height).into_iter().enumerate() {
            let spent = if height % 5 == 0 && i == 0 && height + 1 <= peak_height {
                height + 1
            } else {
                0
            };
            coin_rows.push(CoinRecord {
                coin,
                confirmed_block_index: height,
                spent_block_index: spent,
                coinbase: true,
                timestamp: 1_600_000_000 + height as u64,
            });
        }
    }
    // spent after the snapshot peak: must convert to unspent
    let clamped_coin = CoinRecord {
        coin: make_coin(400_000, make_hash(2), 123),
        confirmed_block_index: 500,
        spent_block_index: peak_height + 100,
        coinbase: false,
        timestamp: 1_600_500_000,
    };
    coin_rows.push(clamped_coin);
    // confirmed after the snapshot peak: not converted at all
    let dropped_coin = CoinRecord {
        coin: make_coin(400_001, make_hash(3), 5),
        confirmed_block_index: peak_height + 50,
        spent_block_index: 0,
        coinbase: false,
        timestamp: 1_600_600_000,
    };
    coin_rows.push(dropped_coin);

    // 2000 distinct hint pairs plus 751 exact duplicates = 2751 v1 rows
    let mut hint_rows = Vec::new();
    for i in 0..2000u64 {
        hint_rows.push((make_hash(10_000 + i), vec![(i % 251) as u8; 32]));
    }
    for i in 0..751u64 {
        hint_rows.push((make_hash(10_000 + i), vec![(i % 251) as u8; 32]));
    }
    assert_eq!(hint_rows.len(), 2751);

    // segment blobs for the first three sub-epoch summary blocks
    let ses_rows: Vec<(Bytes32, Vec<u8>)> = chain
        .blocks()
        .iter()
        .filter(|b| b.record.sub_epoch_summary_included.is_some())
        .take(3)
        .map(|b| {
            let segments = SubEpochSegments {
                ses_block_hash: b.header_hash,
                segments: vec![ChallengeSegment {
                    height: b.block.height,
                    payload: vec![1, 2, 3],
                }],
            };
            (b.header_hash, segments.to_bytes().unwrap())
        })
        .collect();

    let fixture = V1Fixture {
        dir,
        chain,
        clamped_coin,
        dropped_coin,
        hint_rows,
        distinct_hints: 2000,
        ses_rows,
    };
    build_v1_db(
        &fixture.v1_path(),
        &fixture.chain,
        &orphans,
        &coin_rows,
        &fixture.hint_rows,
        &fixture.ses_rows,
    )
    .unwrap();
    fixture
}

async fn open_v2(
    fixture: &V1Fixture,
) -> (Arc<TransactionalStore>, BlockStore, CoinStore, HintStore) {
    let pool = Arc::new(
        TransactionalStore::open(&fixture.v2_path(), &StoreOptions::default()).unwrap(),
    );
    let blocks = BlockStore::create(pool.clone()).await.unwrap();
    let coins = CoinStore::create(pool.clone()).await.unwrap();
    let hints = HintStore::create(pool.clone()).await.unwrap();
    (pool, blocks, coins, hints)
}

#[tokio::test]
async fn test_convert_v1_to_v2_round_trip() {
    let fixture = build_fixture();
    convert_v1_to_v2(&fixture.v1_path(), &fixture.v2_path())
        .await
        .unwrap();

    let (_pool, blocks, coins, hints) = open_v2(&fixture).await;

    // peak carried over
    let (peak_hash, peak_height) = blocks.get_peak().await.unwrap().unwrap();
    assert_eq!(peak_hash, fixture.chain.tip().header_hash);
    assert_eq!(peak_height, CHAIN_LENGTH - 1);

    // spot-check full blocks and records round-trip at several heights
    for height in [0u32, 1, 7, 500, CHAIN_LENGTH - 1] {
        let expected = &fixture.chain.blocks()[height as usize];
        let block = blocks
            .get_full_block(expected.header_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*block, expected.block);
        let record = blocks
            .get_block_record(expected.header_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record, expected.record);
    }

    // orphaned v1 rows were skipped
    let orphan = orphan_at(&fixture.chain, 100, 77);
    assert!(blocks
        .get_full_block(orphan.header_hash)
        .await
        .unwrap()
        .is_none());

    // coin semantics: spent stays spent, clamped becomes unspent, late
    // confirmation is dropped
    let spent = reward_coins(21, 5)[0];
    let record = coins.get_coin_record(spent.coin_id()).await.unwrap().unwrap();
    assert_eq!(record.spent_block_index, 6);
    let unspent = reward_coins(21, 7)[0];
    let record = coins
        .get_coin_record(unspent.coin_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.spent_block_index, 0);
    let clamped = coins
        .get_coin_record(fixture.clamped_coin.name())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(clamped.spent_block_index, 0);
    assert_eq!(clamped.coin, fixture.clamped_coin.coin);
    assert!(coins
        .get_coin_record(fixture.dropped_coin.name())
        .await
        .unwrap()
        .is_none());

    // added/removed-at-height views agree with the fixture
    let added = coins.get_coins_added_at_height(10).await.unwrap();
    let expected: HashSet<Bytes32> = reward_coins(21, 10).iter().map(|c| c.coin_id()).collect();
    assert_eq!(
        added.iter().map(|r| r.name()).collect::<HashSet<_>>(),
        expected
    );
    let removed = coins.get_coins_removed_at_height(6).await.unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name(), reward_coins(21, 5)[0].coin_id());

    // hints deduplicated, still queryable
    assert_eq!(hints.count_hints().await.unwrap(), fixture.distinct_hints as u64);
    let (coin_id, hint) = &fixture.hint_rows[0];
    let ids = hints.get_coin_ids(hint).await.unwrap();
    assert!(ids.contains(coin_id));

    // sub-epoch segments copied with binary keys
    for (ses_hash, blob) in &fixture.ses_rows {
        let segments = blocks
            .get_sub_epoch_challenge_segments(*ses_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(segments.to_bytes().unwrap(), *blob);
    }
}

#[tokio::test]
async fn test_converted_database_validates() {
    let fixture = build_fixture();
    convert_v1_to_v2(&fixture.v1_path(), &fixture.v2_path())
        .await
        .unwrap();

    let summary = validate_v2(&fixture.v2_path(), false).unwrap();
    assert_eq!(summary.peak_height, CHAIN_LENGTH - 1);
    assert_eq!(summary.main_chain_blocks, CHAIN_LENGTH);
    assert_eq!(summary.orphaned_blocks, 0);

    // deep validation decodes every blob
    let summary = validate_v2(&fixture.v2_path(), true).unwrap();
    assert_eq!(summary.main_chain_blocks, CHAIN_LENGTH);
}

#[tokio::test]
async fn test_convert_refuses_bad_inputs() {
    let fixture = build_fixture();
    convert_v1_to_v2(&fixture.v1_path(), &fixture.v2_path())
        .await
        .unwrap();

    // output exists
    let err = convert_v1_to_v2(&fixture.v1_path(), &fixture.v2_path())
        .await
        .unwrap_err();
    assert!(matches!(err, ChainStorageError::InvalidOperation(_)));

    // converting a v2 file
    let twice = fixture.dir.path().join("twice.sqlite");
    let err = convert_v1_to_v2(&fixture.v2_path(), &twice).await.unwrap_err();
    assert!(matches!(err, ChainStorageError::InvalidOperation(_)));
}

#[tokio::test]
async fn test_validate_catches_flag_corruption() {
    let fixture = build_fixture();
    convert_v1_to_v2(&fixture.v1_path(), &fixture.v2_path())
        .await
        .unwrap();

    {
        let db = rusqlite::Connection::open(fixture.v2_path()).unwrap();
        db.execute("UPDATE full_blocks SET in_main_chain=0 WHERE height=400", [])
            .unwrap();
    }
    let err = validate_v2(&fixture.v2_path(), false).unwrap_err();
    assert!(matches!(err, ChainStorageError::Corruption(_)));
}

#[tokio::test]
async fn test_runtime_refuses_v1_schema() {
    let fixture = build_fixture();
    let pool = Arc::new(
        TransactionalStore::open(&fixture.v1_path(), &StoreOptions::default()).unwrap(),
    );
    let err = BlockStore::create(pool.clone()).await.unwrap_err();
    assert!(matches!(err, ChainStorageError::UnsupportedSchemaVersion(1)));
    let err = CoinStore::create(pool).await.unwrap_err();
    assert!(matches!(err, ChainStorageError::UnsupportedSchemaVersion(1)));
}
