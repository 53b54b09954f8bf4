//! Persistence for coin records (the UTXO set plus spend heights).
//!
//! `coin_name` is unique because the table always represents a single peak;
//! competing branches never coexist here. `new_block` is the atomic unit of
//! change and `rollback_to_block` is its inverse for reorgs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use crate::block_store::placeholders;
use crate::db_version::ensure_version_2;
use crate::error::ChainStorageError;
use crate::transactional::{TransactionalStore, WriteTx};
use crate::types::{Bytes32, Coin, CoinRecord, CoinState, UnspentLineageInfo};

/// Headroom under the host-parameter limit for the non-IN parameters a
/// query carries alongside the key batch.
const PARAMETER_SLACK: usize = 10;

pub struct CoinStore {
    db: Arc<TransactionalStore>,
}

impl std::fmt::Debug for CoinStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinStore").finish_non_exhaustive()
    }
}

impl CoinStore {
    /// Create the table and indices. Refuses a schema-v1 file.
    pub async fn create(db: Arc<TransactionalStore>) -> Result<Self, ChainStorageError> {
        {
            let tx = db.writer().await?;
            ensure_version_2(&tx)?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS coin_record(
                     coin_name blob PRIMARY KEY,
                     confirmed_index bigint,
                     spent_index bigint,
                     coinbase int,
                     puzzle_hash blob,
                     coin_parent blob,
                     amount blob,
                     timestamp bigint);
                 CREATE INDEX IF NOT EXISTS coin_confirmed_index
                     ON coin_record(confirmed_index);
                 CREATE INDEX IF NOT EXISTS coin_spent_index ON coin_record(spent_index);
                 CREATE INDEX IF NOT EXISTS coin_puzzle_hash ON coin_record(puzzle_hash);
                 CREATE INDEX IF NOT EXISTS coin_parent_index ON coin_record(coin_parent);",
            )?;
            tx.commit()?;
        }
        Ok(CoinStore { db })
    }

    pub fn pool(&self) -> &Arc<TransactionalStore> {
        &self.db
    }

    fn batch_size(&self) -> usize {
        self.db.host_parameter_limit().saturating_sub(PARAMETER_SLACK)
    }

    /// Largest puzzle-hash batch `batch_coin_states_by_puzzle_hashes`
    /// accepts in one call.
    pub fn max_puzzle_hash_batch_size(&self) -> usize {
        self.batch_size()
    }

    // ========== Block application ==========

    /// Apply one block's coin changes: create a record for every addition
    /// and reward coin, then mark removals spent. Reward coins exist for
    /// every block except genesis (farmer and pool at minimum). The rows
    /// become visible to readers only when the enclosing transaction
    /// commits. Re-invocation at the same height fails on the reward-coin
    /// primary keys.
    pub fn new_block(
        &self,
        tx: &WriteTx<'_>,
        height: u32,
        timestamp: u64,
        included_reward_coins: &[Coin],
        tx_additions: &[Coin],
        tx_removals: &[Bytes32],
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        if height == 0 {
            if !included_reward_coins.is_empty() {
                return Err(ChainStorageError::InvalidOperation(
                    "genesis block must not carry reward coins".into(),
                ));
            }
        } else if included_reward_coins.len() < 2 {
            return Err(ChainStorageError::InvalidOperation(format!(
                "block at height {} carries {} reward coins, expected at least 2",
                height,
                included_reward_coins.len()
            )));
        }

        let start = Instant::now();

        let mut additions = Vec::with_capacity(tx_additions.len() + included_reward_coins.len());
        for coin in tx_additions {
            additions.push(CoinRecord {
                coin: *coin,
                confirmed_block_index: height,
                spent_block_index: 0,
                coinbase: false,
                timestamp,
            });
        }
        for coin in included_reward_coins {
            additions.push(CoinRecord {
                coin: *coin,
                confirmed_block_index: height,
                spent_block_index: 0,
                coinbase: true,
                timestamp,
            });
        }

        self.add_coin_records(tx, &additions)?;
        self.set_spent(tx, tx_removals, height)?;

        let elapsed = start.elapsed();
        if elapsed.as_secs() >= 10 {
            warn!(
                height,
                additions = tx_additions.len(),
                removals = tx_removals.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "slow coin-store block application; check database drive speed"
            );
        } else {
            debug!(
                height,
                additions = tx_additions.len(),
                removals = tx_removals.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "applied block to coin store"
            );
        }

        Ok(additions)
    }

    fn add_coin_records(
        &self,
        tx: &WriteTx<'_>,
        records: &[CoinRecord],
    ) -> Result<(), ChainStorageError> {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO coin_record VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for record in records {
            stmt.execute(params![
                record.coin.coin_id(),
                record.confirmed_block_index,
                record.spent_block_index,
                record.coinbase as i64,
                record.coin.puzzle_hash,
                record.coin.parent_coin_id,
                &record.coin.amount_blob()[..],
                record.timestamp as i64,
            ])?;
        }
        Ok(())
    }

    /// Mark `coin_names` spent at `height`. Exactly one unspent row must be
    /// updated per name; any shortfall is a double spend or a spend of an
    /// unknown coin.
    fn set_spent(
        &self,
        tx: &WriteTx<'_>,
        coin_names: &[Bytes32],
        height: u32,
    ) -> Result<(), ChainStorageError> {
        let mut updated = 0usize;
        for batch in coin_names.chunks(self.batch_size()) {
            let sql = format!(
                "UPDATE coin_record SET spent_index=? WHERE spent_index=0 AND coin_name IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = tx.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(batch.len() + 1);
            values.push(&height);
            for name in batch {
                values.push(name);
            }
            updated += stmt.execute(values.as_slice())?;
        }
        if updated != coin_names.len() {
            return Err(ChainStorageError::DoubleSpendOrMissingCoin {
                expected: coin_names.len(),
                updated,
                height,
            });
        }
        Ok(())
    }

    /// Rewind the coin set to `height`: erase records confirmed above it,
    /// un-spend records spent above it. Returns the union of both sets as a
    /// pre-mutation snapshot so the coordinator can emit a delta.
    pub fn rollback_to_block(
        &self,
        tx: &WriteTx<'_>,
        height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        let mut changes: HashMap<Bytes32, CoinRecord> = HashMap::new();

        let mut stmt = tx.prepare("SELECT * FROM coin_record WHERE confirmed_index>?")?;
        let rows = stmt.query_map(params![height], row_to_coin_record)?;
        for row in rows {
            let record = row?;
            changes.insert(record.name(), record);
        }
        drop(stmt);

        let mut stmt = tx.prepare("SELECT * FROM coin_record WHERE spent_index>?")?;
        let rows = stmt.query_map(params![height], row_to_coin_record)?;
        for row in rows {
            let record = row?;
            changes.entry(record.name()).or_insert(record);
        }
        drop(stmt);

        tx.execute(
            "DELETE FROM coin_record WHERE confirmed_index>?",
            params![height],
        )?;
        tx.execute(
            "UPDATE coin_record SET spent_index=0 WHERE spent_index>?",
            params![height],
        )?;

        Ok(changes.into_values().collect())
    }

    // ========== Queries ==========

    fn get_coin_record_on(
        &self,
        conn: &Connection,
        coin_name: Bytes32,
    ) -> Result<Option<CoinRecord>, ChainStorageError> {
        Ok(conn
            .query_row(
                "SELECT * FROM coin_record WHERE coin_name=?",
                params![coin_name],
                row_to_coin_record,
            )
            .optional()?)
    }

    pub async fn get_coin_record(
        &self,
        coin_name: Bytes32,
    ) -> Result<Option<CoinRecord>, ChainStorageError> {
        let reader = self.db.reader().await?;
        self.get_coin_record_on(&reader, coin_name)
    }

    /// Same lookup from inside an open write transaction (sees uncommitted
    /// spends during replay).
    pub fn get_coin_record_tx(
        &self,
        tx: &WriteTx<'_>,
        coin_name: Bytes32,
    ) -> Result<Option<CoinRecord>, ChainStorageError> {
        self.get_coin_record_on(tx, coin_name)
    }

    /// Records for the given names, order not guaranteed.
    pub async fn get_coin_records(
        &self,
        names: &[Bytes32],
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        if names.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut records = Vec::new();
        for batch in names.chunks(self.batch_size()) {
            let sql = format!(
                "SELECT * FROM coin_record WHERE coin_name IN ({})",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), row_to_coin_record)?;
            for row in rows {
                records.push(row?);
            }
        }
        Ok(records)
    }

    pub async fn get_coins_added_at_height(
        &self,
        height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare("SELECT * FROM coin_record WHERE confirmed_index=?")?;
        let rows = stmt.query_map(params![height], row_to_coin_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_coins_removed_at_height(
        &self,
        height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        // spent_index=0 means unspent, so height 0 would sweep the whole
        // unspent set
        if height == 0 {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare("SELECT * FROM coin_record WHERE spent_index=?")?;
        let rows = stmt.query_map(params![height], row_to_coin_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_coin_records_by_puzzle_hash(
        &self,
        include_spent_coins: bool,
        puzzle_hash: Bytes32,
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        self.get_coin_records_by_puzzle_hashes(
            include_spent_coins,
            &[puzzle_hash],
            start_height,
            end_height,
        )
        .await
    }

    pub async fn get_coin_records_by_puzzle_hashes(
        &self,
        include_spent_coins: bool,
        puzzle_hashes: &[Bytes32],
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        self.keyed_coin_records(
            "puzzle_hash",
            include_spent_coins,
            puzzle_hashes,
            start_height,
            end_height,
        )
        .await
    }

    pub async fn get_coin_records_by_names(
        &self,
        include_spent_coins: bool,
        names: &[Bytes32],
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        self.keyed_coin_records("coin_name", include_spent_coins, names, start_height, end_height)
            .await
    }

    pub async fn get_coin_records_by_parent_ids(
        &self,
        include_spent_coins: bool,
        parent_ids: &[Bytes32],
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        self.keyed_coin_records(
            "coin_parent",
            include_spent_coins,
            parent_ids,
            start_height,
            end_height,
        )
        .await
    }

    async fn keyed_coin_records(
        &self,
        column: &str,
        include_spent_coins: bool,
        keys: &[Bytes32],
        start_height: u32,
        end_height: u32,
    ) -> Result<Vec<CoinRecord>, ChainStorageError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut records = Vec::new();
        for batch in keys.chunks(self.batch_size()) {
            let sql = format!(
                "SELECT * FROM coin_record WHERE {} IN ({})
                 AND confirmed_index>=? AND confirmed_index<? {}",
                column,
                placeholders(batch.len()),
                if include_spent_coins {
                    ""
                } else {
                    "AND spent_index=0"
                }
            );
            let mut stmt = reader.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(batch.len() + 2);
            for key in batch {
                values.push(key);
            }
            values.push(&start_height);
            values.push(&end_height);
            let rows = stmt.query_map(values.as_slice(), row_to_coin_record)?;
            for row in rows {
                records.push(row?);
            }
        }
        Ok(records)
    }

    /// Coin states for the given ids at or above `min_height` (by either
    /// confirmation or spend).
    pub async fn get_coin_states_by_ids(
        &self,
        coin_ids: &[Bytes32],
        min_height: u32,
    ) -> Result<Vec<CoinState>, ChainStorageError> {
        if coin_ids.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.db.reader().await?;
        let mut states = Vec::new();
        for batch in coin_ids.chunks(self.batch_size()) {
            let sql = format!(
                "SELECT * FROM coin_record WHERE coin_name IN ({})
                 AND (confirmed_index>=? OR spent_index>=?)",
                placeholders(batch.len())
            );
            let mut stmt = reader.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(batch.len() + 2);
            for id in batch {
                values.push(id);
            }
            values.push(&min_height);
            values.push(&min_height);
            let rows = stmt.query_map(values.as_slice(), row_to_coin_record)?;
            for row in rows {
                states.push(CoinState::from(&row?));
            }
        }
        Ok(states)
    }

    /// Streaming query for wallet subscriptions. Results are ordered by
    /// `max(confirmed_index, spent_index)` ascending and are never split
    /// mid-block: if the row budget would cut a block in half, that whole
    /// block is dropped and its height is returned so the next call resumes
    /// there. `None` for the height means this batch is complete.
    #[allow(clippy::too_many_arguments)]
    pub async fn batch_coin_states_by_puzzle_hashes(
        &self,
        puzzle_hashes: &[Bytes32],
        min_height: u32,
        include_spent: bool,
        include_unspent: bool,
        include_hinted: bool,
        min_amount: u64,
        max_items: usize,
    ) -> Result<(Vec<CoinState>, Option<u32>), ChainStorageError> {
        if puzzle_hashes.len() > self.max_puzzle_hash_batch_size() {
            return Err(ChainStorageError::InvalidOperation(format!(
                "puzzle hash batch of {} exceeds the maximum of {}",
                puzzle_hashes.len(),
                self.max_puzzle_hash_batch_size()
            )));
        }
        if puzzle_hashes.is_empty() || (!include_spent && !include_unspent) {
            return Ok((vec![], None));
        }

        let spent_filter = if include_spent && include_unspent {
            ""
        } else if include_spent {
            "AND spent_index>0"
        } else {
            "AND spent_index=0"
        };
        let amount_blob: Vec<u8> = min_amount.to_be_bytes().to_vec();
        let amount_filter = if min_amount > 0 { "AND amount>=?" } else { "" };
        // one row over budget is enough to detect a split block
        let fetch_limit = max_items.saturating_add(1).min(i64::MAX as usize) as i64;

        let reader = self.db.reader().await?;
        let mut rows_by_id: HashMap<Bytes32, (u32, CoinState)> = HashMap::new();

        {
            let sql = format!(
                "SELECT * FROM coin_record
                 WHERE puzzle_hash IN ({})
                 AND (confirmed_index>=? OR spent_index>=?) {} {}
                 ORDER BY MAX(confirmed_index, spent_index) ASC LIMIT ?",
                placeholders(puzzle_hashes.len()),
                spent_filter,
                amount_filter,
            );
            let mut stmt = reader.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> =
                Vec::with_capacity(puzzle_hashes.len() + 4);
            for ph in puzzle_hashes {
                values.push(ph);
            }
            values.push(&min_height);
            values.push(&min_height);
            if min_amount > 0 {
                values.push(&amount_blob);
            }
            values.push(&fetch_limit);
            let rows = stmt.query_map(values.as_slice(), row_to_coin_record)?;
            for row in rows {
                let record = row?;
                let height = record.confirmed_block_index.max(record.spent_block_index);
                rows_by_id.insert(record.name(), (height, CoinState::from(&record)));
            }
        }

        if include_hinted {
            // the same coin may surface both directly and via a hint;
            // the map deduplicates by coin id
            let sql = format!(
                "SELECT coin_record.* FROM coin_record
                 INNER JOIN hints ON coin_record.coin_name = hints.coin_id
                 WHERE hints.hint IN ({})
                 AND (confirmed_index>=? OR spent_index>=?) {} {}
                 ORDER BY MAX(confirmed_index, spent_index) ASC LIMIT ?",
                placeholders(puzzle_hashes.len()),
                spent_filter,
                amount_filter,
            );
            let mut stmt = reader.prepare(&sql)?;
            let mut values: Vec<&dyn rusqlite::ToSql> =
                Vec::with_capacity(puzzle_hashes.len() + 4);
            for ph in puzzle_hashes {
                values.push(ph);
            }
            values.push(&min_height);
            values.push(&min_height);
            if min_amount > 0 {
                values.push(&amount_blob);
            }
            values.push(&fetch_limit);
            let rows = stmt.query_map(values.as_slice(), row_to_coin_record)?;
            for row in rows {
                let record = row?;
                let height = record.confirmed_block_index.max(record.spent_block_index);
                rows_by_id.insert(record.name(), (height, CoinState::from(&record)));
            }
        }

        let mut merged: Vec<(u32, CoinState)> = rows_by_id.into_values().collect();
        merged.sort_by_key(|(height, _)| *height);

        if merged.len() <= max_items {
            return Ok((merged.into_iter().map(|(_, state)| state).collect(), None));
        }

        // block-boundary preservation: drop every row sharing the height of
        // the first row over budget and resume from that height
        let next_height = merged[max_items].0;
        while merged
            .last()
            .map(|(height, _)| *height >= next_height)
            .unwrap_or(false)
        {
            merged.pop();
        }
        Ok((
            merged.into_iter().map(|(_, state)| state).collect(),
            Some(next_height),
        ))
    }

    /// The unique unspent coin with puzzle hash `ph` whose parent shares
    /// the puzzle hash and amount and is spent. Zero or multiple candidates
    /// yield `None`.
    pub async fn get_unspent_lineage_info_for_puzzle_hash(
        &self,
        puzzle_hash: Bytes32,
    ) -> Result<Option<UnspentLineageInfo>, ChainStorageError> {
        let reader = self.db.reader().await?;
        let mut stmt = reader.prepare(
            "SELECT unspent.coin_name, unspent.coin_parent, parent.coin_parent
             FROM coin_record AS unspent
             INNER JOIN coin_record AS parent ON unspent.coin_parent = parent.coin_name
             WHERE unspent.spent_index = 0
             AND parent.spent_index > 0
             AND unspent.puzzle_hash = ?
             AND parent.puzzle_hash = ?
             AND unspent.amount = parent.amount
             LIMIT 2",
        )?;
        let rows = stmt.query_map(params![puzzle_hash, puzzle_hash], |row| {
            Ok(UnspentLineageInfo {
                coin_id: row.get(0)?,
                parent_id: row.get(1)?,
                parent_parent_id: row.get(2)?,
            })
        })?;
        let found = rows.collect::<Result<Vec<_>, _>>()?;
        if found.len() == 1 {
            Ok(Some(found[0]))
        } else {
            Ok(None)
        }
    }
}

/// Decode a full `coin_record` row. Column order is fixed by the schema:
/// coin_name, confirmed_index, spent_index, coinbase, puzzle_hash,
/// coin_parent, amount, timestamp.
fn row_to_coin_record(row: &Row<'_>) -> rusqlite::Result<CoinRecord> {
    let puzzle_hash: Bytes32 = row.get(4)?;
    let parent: Bytes32 = row.get(5)?;
    let amount_blob: Vec<u8> = row.get(6)?;
    if amount_blob.len() != 8 {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Blob,
            format!("amount blob of {} bytes, expected 8", amount_blob.len()).into(),
        ));
    }
    let amount = BigEndian::read_u64(&amount_blob);
    Ok(CoinRecord {
        coin: Coin::new(parent, puzzle_hash, amount),
        confirmed_block_index: row.get(1)?,
        spent_block_index: row.get(2)?,
        coinbase: row.get::<_, i64>(3)? != 0,
        timestamp: row.get::<_, i64>(7)? as u64,
    })
}

/// Multiset equality helper for round-trip assertions.
#[cfg(test)]
pub(crate) fn record_set(records: &[CoinRecord]) -> std::collections::HashSet<Bytes32> {
    records.iter().map(|r| r.name()).collect()
}
