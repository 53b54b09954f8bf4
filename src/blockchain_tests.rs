//! End-to-end coordinator scenarios: linear growth, orphans, reorgs,
//! double spends and the read-path queries that hang off the main chain.

use std::collections::HashSet;

use crate::blockchain::AddBlockResult;
use crate::error::ChainStorageError;
use crate::generator::TransactionsInfo;
use crate::test_helpers::{
    add, make_coin, orphan_at, reward_coins, temp_blockchain, BlockSpec, ChainBuilder,
};
use crate::types::Bytes32;

fn is_new_peak(result: &AddBlockResult) -> bool {
    matches!(result, AddBlockResult::NewPeak { .. })
}

#[tokio::test]
async fn test_simple_extend() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(1);
    builder.extend_to(10);

    for block in builder.blocks() {
        let result = add(&chain, block).await.unwrap();
        assert!(is_new_peak(&result), "expected NewPeak, got {:?}", result);
    }
    assert_eq!(chain.get_peak_height(), Some(9));
    assert_eq!(
        chain.get_peak().map(|p| p.header_hash),
        Some(builder.tip().header_hash)
    );

    // re-adding an existing block is a no-op
    let result = add(&chain, &builder.blocks()[4]).await.unwrap();
    assert!(matches!(result, AddBlockResult::AlreadyHaveBlock));

    // coins added at height 5 are exactly that block's reward coins
    let added = chain
        .coin_store
        .get_coins_added_at_height(5)
        .await
        .unwrap();
    let expected: HashSet<Bytes32> = reward_coins(1, 5).iter().map(|c| c.coin_id()).collect();
    let got: HashSet<Bytes32> = added.iter().map(|r| r.name()).collect();
    assert_eq!(got, expected);

    // height map and block store agree at every height up to the peak
    for height in 0..=9u32 {
        let hash = chain.height_to_hash(height).unwrap();
        let block = chain
            .block_store
            .get_full_block(hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.height, height);
    }
}

#[tokio::test]
async fn test_genesis_only() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(2);
    builder.extend_to(1);
    match add(&chain, builder.tip()).await.unwrap() {
        AddBlockResult::NewPeak { fork_height, .. } => assert_eq!(fork_height, 0),
        other => panic!("expected NewPeak, got {:?}", other),
    }
    assert_eq!(chain.get_peak_height(), Some(0));
}

#[tokio::test]
async fn test_disconnected_and_invalid() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(3);
    builder.extend_to(4);

    // block 2 without blocks 0 and 1
    let result = add(&chain, &builder.blocks()[2]).await.unwrap();
    assert!(matches!(result, AddBlockResult::DisconnectedBlock));

    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    // pre-validation failure is returned, block not stored
    let mut next = builder.clone_next_block();
    let mut pre = next.pre_validation();
    pre.error = Some("bad proof of space".into());
    let result = chain
        .add_block(next.block.clone(), next.record.clone(), pre, None)
        .await
        .unwrap();
    assert!(matches!(result, AddBlockResult::InvalidBlock(_)));
    assert!(!chain.contains_block(next.header_hash).await.unwrap());

    // height mismatch against the parent
    next.block.height = 9;
    next.record.height = 9;
    let result = chain
        .add_block(
            next.block.clone(),
            next.record.clone(),
            next.pre_validation(),
            None,
        )
        .await
        .unwrap();
    assert!(matches!(result, AddBlockResult::InvalidBlock(_)));
}

#[tokio::test]
async fn test_orphan_block() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(1);
    builder.extend_to(6);
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    let orphan = orphan_at(&builder, 3, 42);
    let result = add(&chain, &orphan).await.unwrap();
    assert!(matches!(result, AddBlockResult::AddedAsOrphan));

    // peak unchanged, orphan retrievable, flag clear
    assert_eq!(chain.get_peak_height(), Some(5));
    assert!(chain
        .block_store
        .get_full_block(orphan.header_hash)
        .await
        .unwrap()
        .is_some());
    let reader = chain.block_store.pool().reader().await.unwrap();
    let in_main_chain: i64 = reader
        .query_row(
            "SELECT in_main_chain FROM full_blocks WHERE header_hash=?",
            [orphan.header_hash],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(in_main_chain, 0);
    // no coin state was created for the orphan
    assert!(chain
        .coin_store
        .get_coin_record(orphan.block.reward_coins[0].coin_id())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reorg() {
    let (chain, _dir) = temp_blockchain().await;
    let mut a = ChainBuilder::new(1);
    a.extend_to(30);
    for block in a.blocks() {
        add(&chain, block).await.unwrap();
    }
    assert_eq!(chain.get_peak_height(), Some(29));

    // heavier-per-block branch forking above height 19
    let mut b = a.fork_at(19, 2, 3);
    b.extend_to(35);

    let mut reorg_fork_height = None;
    let mut orphans_before_reorg = 0;
    for block in &b.blocks()[20..] {
        match add(&chain, block).await.unwrap() {
            AddBlockResult::AddedAsOrphan => {
                assert!(reorg_fork_height.is_none());
                orphans_before_reorg += 1;
            }
            AddBlockResult::NewPeak {
                fork_height,
                coin_changes,
                ..
            } => {
                if reorg_fork_height.is_none() {
                    // the first peak change is the reorg itself
                    reorg_fork_height = Some(fork_height);
                    assert!(!coin_changes.is_empty());
                }
            }
            other => panic!("unexpected result {:?}", other),
        }
    }
    assert_eq!(reorg_fork_height, Some(19));
    assert!(orphans_before_reorg > 0);
    assert_eq!(chain.get_peak_height(), Some(34));
    assert_eq!(
        chain.get_peak().map(|p| p.header_hash),
        Some(b.tip().header_hash)
    );

    // branch A's coins above the fork are gone
    let ph_a25 = reward_coins(1, 25)[0].puzzle_hash;
    assert!(chain
        .coin_store
        .get_coin_records_by_puzzle_hash(true, ph_a25, 0, u32::MAX)
        .await
        .unwrap()
        .is_empty());
    // branch B's coins are live
    let ph_b25 = reward_coins(2, 25)[0].puzzle_hash;
    assert_eq!(
        chain
            .coin_store
            .get_coin_records_by_puzzle_hash(false, ph_b25, 0, u32::MAX)
            .await
            .unwrap()
            .len(),
        1
    );
    // the shared prefix survived
    let ph_a10 = reward_coins(1, 10)[0].puzzle_hash;
    assert_eq!(
        chain
            .coin_store
            .get_coin_records_by_puzzle_hash(true, ph_a10, 0, u32::MAX)
            .await
            .unwrap()
            .len(),
        1
    );

    // height map follows branch B, and the stored flags agree
    for height in 20..=34u32 {
        assert_eq!(
            chain.height_to_hash(height),
            Some(b.blocks()[height as usize].header_hash)
        );
    }
    let reader = chain.block_store.pool().reader().await.unwrap();
    let flagged_a: i64 = reader
        .query_row(
            "SELECT count(*) FROM full_blocks WHERE in_main_chain=1 AND header_hash=?",
            [a.blocks()[25].header_hash],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(flagged_a, 0);

    // sub-epoch summaries above the fork were replaced by branch B's
    assert_eq!(
        chain.get_ses(21).map(|s| s.0),
        b.blocks()[21]
            .record
            .sub_epoch_summary_included
            .clone()
            .map(|s| s.0)
    );
}

#[tokio::test]
async fn test_reorg_with_fork_hint() {
    let (chain, _dir) = temp_blockchain().await;
    let mut a = ChainBuilder::new(4);
    a.extend_to(8);
    for block in a.blocks() {
        add(&chain, block).await.unwrap();
    }
    // a.peak is height 7 at weight 16; branch b overtakes it at height 7
    let mut b = a.fork_at(5, 5, 3);
    b.extend_to(8);
    let result = add(&chain, &b.blocks()[6]).await.unwrap();
    assert!(matches!(result, AddBlockResult::AddedAsOrphan));
    let result = chain
        .add_block(
            b.blocks()[7].block.clone(),
            b.blocks()[7].record.clone(),
            b.blocks()[7].pre_validation(),
            Some(5),
        )
        .await
        .unwrap();
    match result {
        AddBlockResult::NewPeak { fork_height, .. } => assert_eq!(fork_height, 5),
        other => panic!("expected NewPeak, got {:?}", other),
    }
    assert_eq!(chain.get_peak_height(), Some(7));
    assert_eq!(
        chain.get_peak().map(|p| p.header_hash),
        Some(b.tip().header_hash)
    );
}

#[tokio::test]
async fn test_double_spend_leaves_first_peak() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(1);
    builder.extend_to(4);
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }
    // block 3 added one coin by default
    let coin_c = builder.blocks()[3]
        .transactions
        .as_ref()
        .unwrap()
        .additions[0];

    let spend = TransactionsInfo {
        additions: vec![],
        removals: vec![coin_c.coin_id()],
        hints: vec![],
    };
    builder.push_block_with(BlockSpec {
        transactions: Some(spend.clone()),
        ..BlockSpec::default()
    });
    add(&chain, builder.tip()).await.unwrap();
    assert_eq!(chain.get_peak_height(), Some(4));

    // a later block spending the same coin must fail and change nothing
    builder.push_block_with(BlockSpec {
        transactions: Some(spend),
        ..BlockSpec::default()
    });
    let err = add(&chain, builder.tip()).await.unwrap_err();
    assert!(matches!(
        err,
        ChainStorageError::DoubleSpendOrMissingCoin { .. }
    ));

    assert_eq!(chain.get_peak_height(), Some(4));
    // the failed block was rolled back entirely
    assert!(!chain
        .contains_block(builder.tip().header_hash)
        .await
        .unwrap());
    let record = chain
        .coin_store
        .get_coin_record(coin_c.coin_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.spent_block_index, 4);
}

#[tokio::test]
async fn test_hints_flow_through_new_peak() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(6);
    builder.extend_to(3);
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    let coin = make_coin(999, crate::test_helpers::make_hash(888), 77);
    let hint = vec![0x42u8; 32];
    builder.push_block_with(BlockSpec {
        transactions: Some(TransactionsInfo {
            additions: vec![coin],
            removals: vec![],
            hints: vec![(coin.coin_id(), hint.clone()), (coin.coin_id(), hint.clone())],
        }),
        ..BlockSpec::default()
    });

    match add(&chain, builder.tip()).await.unwrap() {
        AddBlockResult::NewPeak { hint_changes, .. } => {
            let for_hint = hint_changes.get(&hint).unwrap();
            let record = for_hint.get(&coin.coin_id()).unwrap();
            assert_eq!(record.confirmed_block_index, 3);
        }
        other => panic!("expected NewPeak, got {:?}", other),
    }
    assert_eq!(
        chain.hint_store.get_coin_ids(&hint).await.unwrap(),
        vec![coin.coin_id()]
    );
}

#[tokio::test]
async fn test_get_block_generator_with_refs() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(7);
    builder.extend_to(4); // block 3 has a generator
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    let info = TransactionsInfo {
        additions: vec![],
        removals: vec![],
        hints: vec![],
    };
    builder.push_block_with(BlockSpec {
        transactions: Some(info),
        generator_refs: vec![3],
        ..BlockSpec::default()
    });
    let with_ref = builder.tip();

    let generator = chain
        .get_block_generator(&with_ref.block)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generator.generator_refs.len(), 1);
    let expected = builder.blocks()[3]
        .block
        .transactions_generator
        .clone()
        .unwrap();
    assert_eq!(generator.generator_refs[0], expected);

    // a ref to a block with no generator payload
    let mut bad = with_ref.clone();
    bad.block.transactions_generator_ref_list = vec![2];
    let err = chain.get_block_generator(&bad.block).await.unwrap_err();
    assert!(matches!(
        err,
        ChainStorageError::GeneratorRefHasNoGenerator(2)
    ));

    // a block with no generator resolves to None
    assert!(chain
        .get_block_generator(&builder.blocks()[1].block)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_get_block_generator_walks_side_branch() {
    let (chain, _dir) = temp_blockchain().await;
    let mut a = ChainBuilder::new(1);
    a.extend_to(7);
    for block in a.blocks() {
        add(&chain, block).await.unwrap();
    }

    // a lighter branch with its own generator at height 5
    let mut b = a.fork_at(4, 9, 1);
    let branch_info = TransactionsInfo {
        additions: vec![make_coin(123_456, crate::test_helpers::make_hash(9), 5)],
        removals: vec![],
        hints: vec![],
    };
    b.push_block_with(BlockSpec {
        transactions: Some(branch_info),
        ..BlockSpec::default()
    });
    let b5 = b.tip().clone();
    add(&chain, &b5).await.unwrap(); // orphan

    b.push_block_with(BlockSpec {
        transactions: Some(TransactionsInfo::default()),
        generator_refs: vec![5],
        ..BlockSpec::default()
    });
    let b6 = b.tip();

    let generator = chain
        .get_block_generator(&b6.block)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        generator.generator_refs[0],
        b5.block.transactions_generator.clone().unwrap()
    );
}

#[tokio::test]
async fn test_header_blocks_in_range() {
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(1);
    builder.extend_to(7);
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    let headers = chain.get_header_blocks_in_range(2, 5, true).await.unwrap();
    assert_eq!(headers.len(), 4);
    assert_eq!(headers[0].height, 2);
    assert_eq!(headers[3].height, 5);

    // block 3 added a coin; its puzzle hash must match the filter
    let added = &builder.blocks()[3].transactions.as_ref().unwrap().additions[0];
    let h3 = &headers[1];
    let filter = h3.transactions_filter.as_ref().unwrap();
    assert!(crate::filters::filter_matches(
        filter,
        h3.header_hash,
        added.puzzle_hash.as_bytes()
    ));
    // reward coin puzzle hashes are in there too
    let reward_ph = reward_coins(1, 3)[0].puzzle_hash;
    assert!(crate::filters::filter_matches(
        filter,
        h3.header_hash,
        reward_ph.as_bytes()
    ));
    assert!(!crate::filters::filter_matches(
        filter,
        h3.header_hash,
        b"unrelated puzzle hash 1234567890"
    ));

    let plain = chain.get_header_blocks_in_range(2, 5, false).await.unwrap();
    assert!(plain.iter().all(|h| h.transactions_filter.is_none()));
}

#[tokio::test]
async fn test_sp_and_ip_sub_slots() {
    use crate::block::SubSlot;
    let (chain, _dir) = temp_blockchain().await;
    let mut builder = ChainBuilder::new(8);
    builder.extend_to(2);

    let s1 = SubSlot {
        challenge_hash: crate::test_helpers::make_hash(1001),
        data: vec![1],
    };
    let s2 = SubSlot {
        challenge_hash: crate::test_helpers::make_hash(1002),
        data: vec![2],
    };
    let s3 = SubSlot {
        challenge_hash: crate::test_helpers::make_hash(1003),
        data: vec![3],
    };
    // block 2 closes two sub-slots, block 5 closes one
    builder.push_block_with(BlockSpec {
        sub_slots: vec![s1.clone(), s2.clone()],
        ..BlockSpec::default()
    });
    builder.extend_to(5);
    builder.push_block_with(BlockSpec {
        sub_slots: vec![s3.clone()],
        ..BlockSpec::default()
    });
    builder.extend_to(7);
    for block in builder.blocks() {
        add(&chain, block).await.unwrap();
    }

    // a block carrying two finished sub-slots brackets itself
    let (sp, ip) = chain
        .get_sp_and_ip_sub_slots(builder.blocks()[2].header_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sp, Some(s1));
    assert_eq!(ip, Some(s2.clone()));

    // a later block walks back: ip from block 5, sp from block 2
    let (sp, ip) = chain
        .get_sp_and_ip_sub_slots(builder.blocks()[6].header_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sp, Some(s2));
    assert_eq!(ip, Some(s3));

    // before any sub-slot exists
    let (sp, ip) = chain
        .get_sp_and_ip_sub_slots(builder.blocks()[1].header_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sp, None);
    assert_eq!(ip, None);

    // unknown block
    assert!(chain
        .get_sp_and_ip_sub_slots(crate::test_helpers::make_hash(4040))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_restart_restores_peak_and_heights() {
    use crate::block_store::BlockStore;
    use crate::blockchain::Blockchain;
    use crate::coin_store::CoinStore;
    use crate::hint_store::HintStore;
    use crate::test_helpers::TestGeneratorRunner;
    use std::sync::Arc;

    let (pool, dir) = crate::test_helpers::temp_pool().await;
    let mut builder = ChainBuilder::new(12);
    builder.extend_to(12);
    {
        let block_store = Arc::new(BlockStore::create(pool.clone()).await.unwrap());
        let coin_store = Arc::new(CoinStore::create(pool.clone()).await.unwrap());
        let hint_store = Arc::new(HintStore::create(pool.clone()).await.unwrap());
        let chain = Blockchain::create(
            pool.clone(),
            block_store,
            coin_store,
            hint_store,
            dir.path(),
            Arc::new(TestGeneratorRunner),
        )
        .await
        .unwrap();
        for block in builder.blocks() {
            add(&chain, block).await.unwrap();
        }
    }

    // a fresh coordinator over the same file sees the same chain
    let block_store = Arc::new(BlockStore::create(pool.clone()).await.unwrap());
    let coin_store = Arc::new(CoinStore::create(pool.clone()).await.unwrap());
    let hint_store = Arc::new(HintStore::create(pool.clone()).await.unwrap());
    let chain = Blockchain::create(
        pool,
        block_store,
        coin_store,
        hint_store,
        dir.path(),
        Arc::new(TestGeneratorRunner),
    )
    .await
    .unwrap();
    assert_eq!(chain.get_peak_height(), Some(11));
    for height in 0..=11u32 {
        assert_eq!(
            chain.height_to_hash(height),
            Some(builder.blocks()[height as usize].header_hash)
        );
    }
    assert_eq!(chain.get_ses_heights(), vec![7]);
}
