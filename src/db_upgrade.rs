//! Offline schema migration from v1 to v2.
//!
//! v1 stores hex-text hashes, uncompressed block blobs, a redundant `spent`
//! flag next to `spent_index`, a separate `block_records` table whose
//! `is_peak` row is the authoritative pointer, and permits duplicate hints.
//! The conversion walks the chain from the v1 peak downward, cross-
//! referencing block records with full blocks, and emits binary-keyed,
//! compressed, `in_main_chain`-flagged v2 rows. Orphaned v1 rows are
//! skipped. Commits happen in batches so terabyte-scale files convert with
//! bounded memory.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::block::compress_blob;
use crate::block_store::BlockStore;
use crate::coin_store::CoinStore;
use crate::error::ChainStorageError;
use crate::hint_store::HintStore;
use crate::transactional::{StoreOptions, TransactionalStore};
use crate::types::Bytes32;

const BLOCK_COMMIT_RATE: usize = 10_000;
const SES_COMMIT_RATE: usize = 2_000;
const HINT_COMMIT_RATE: usize = 2_000;
const COIN_COMMIT_RATE: usize = 30_000;

fn from_hex_column(value: &str) -> Result<Bytes32, ChainStorageError> {
    Bytes32::from_hex(value).ok_or_else(|| {
        ChainStorageError::Corruption(format!("invalid hex hash in v1 database: {}", value))
    })
}

/// Read the v1 peak from the `is_peak` flag on `block_records`.
fn v1_peak(in_db: &Connection) -> Result<(Bytes32, u32), ChainStorageError> {
    let row: Option<(String, u32)> = in_db
        .query_row(
            "SELECT header_hash, height FROM block_records WHERE is_peak = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    match row {
        Some((hash, height)) => Ok((from_hex_column(&hash)?, height)),
        None => Err(ChainStorageError::Corruption(
            "v1 database has no peak".into(),
        )),
    }
}

/// Convert `in_path` (v1) into a fresh v2 file at `out_path`. The input is
/// opened read-only and left untouched.
pub async fn convert_v1_to_v2(in_path: &Path, out_path: &Path) -> Result<(), ChainStorageError> {
    if out_path.exists() {
        return Err(ChainStorageError::InvalidOperation(format!(
            "output file already exists: {}",
            out_path.display()
        )));
    }

    println!("opening file for reading: {}", in_path.display());
    let in_db = Connection::open_with_flags(in_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    if let Some(version) = crate::db_version::lookup_db_version(&in_db)? {
        if version != 1 {
            return Err(ChainStorageError::InvalidOperation(format!(
                "input database is already version {}",
                version
            )));
        }
    }

    println!("opening file for writing: {}", out_path.display());
    let out_db = Connection::open(out_path)?;
    // conversion speed settings; the output is rebuilt from scratch on
    // failure anyway
    let _mode: String = out_db.query_row("PRAGMA journal_mode=OFF", [], |row| row.get(0))?;
    out_db.execute_batch(
        "PRAGMA synchronous=OFF;
         PRAGMA cache_size=131072;",
    )?;

    println!("initializing v2 version");
    out_db.execute_batch(
        "CREATE TABLE database_version(version int);
         INSERT INTO database_version VALUES(2);",
    )?;

    println!("initializing v2 block store");
    out_db.execute_batch(
        "CREATE TABLE full_blocks(
             header_hash blob PRIMARY KEY,
             prev_hash blob,
             height bigint,
             sub_epoch_summary blob,
             is_fully_compactified tinyint,
             in_main_chain tinyint,
             block blob,
             block_record blob);
         CREATE TABLE sub_epoch_segments_v3(
             ses_block_hash blob PRIMARY KEY,
             challenge_segments blob);
         CREATE TABLE current_peak(key int PRIMARY KEY, hash blob);",
    )?;

    let (peak_hash, peak_height) = v1_peak(&in_db)?;
    println!("peak: {} height: {}", peak_hash, peak_height);
    out_db.execute(
        "INSERT INTO current_peak VALUES(0, ?)",
        params![peak_hash],
    )?;

    convert_full_blocks(&in_db, &out_db, peak_hash, peak_height)?;
    convert_sub_epoch_segments(&in_db, &out_db)?;
    convert_hints(&in_db, &out_db)?;
    convert_coins(&in_db, &out_db, peak_height)?;
    drop(in_db);
    drop(out_db);

    println!("[5/5] building indices");
    let pool = Arc::new(TransactionalStore::open(out_path, &StoreOptions::default())?);
    BlockStore::create(pool.clone()).await?;
    CoinStore::create(pool.clone()).await?;
    HintStore::create(pool.clone()).await?;

    Ok(())
}

/// Walk `block_records` from the peak down, cross-referencing `full_blocks`
/// by the expected hash chain. Rows not on the chain are orphans and are
/// skipped.
fn convert_full_blocks(
    in_db: &Connection,
    out_db: &Connection,
    peak_hash: Bytes32,
    peak_height: u32,
) -> Result<(), ChainStorageError> {
    println!("[1/5] converting full_blocks");

    let mut records_stmt = in_db.prepare(
        "SELECT header_hash, prev_hash, block, sub_epoch_summary
         FROM block_records ORDER BY height DESC",
    )?;
    let mut blocks_stmt = in_db.prepare(
        "SELECT header_hash, height, is_fully_compactified, block
         FROM full_blocks ORDER BY height DESC",
    )?;
    let mut record_rows = records_stmt.query([])?;
    let mut block_rows = blocks_stmt.query([])?;

    let mut expected = peak_hash;
    let mut height = peak_height + 1;
    let mut commit_in = BLOCK_COMMIT_RATE;
    let mut converted = 0usize;

    out_db.execute_batch("BEGIN")?;
    let mut insert = out_db.prepare(
        "INSERT OR REPLACE INTO full_blocks VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
    )?;

    while let Some(row) = record_rows.next()? {
        let header_hash = from_hex_column(&row.get::<_, String>(0)?)?;
        if header_hash != expected {
            // orphaned row, not part of the chain ending at the peak
            continue;
        }
        let prev_hash = from_hex_column(&row.get::<_, String>(1)?)?;
        let record_blob: Vec<u8> = row.get(2)?;
        let ses: Option<Vec<u8>> = row.get(3)?;

        // advance the block cursor until it reaches this hash
        let (is_fully_compactified, block_blob) = loop {
            let block_row = block_rows.next()?.ok_or_else(|| {
                ChainStorageError::Corruption(format!("block {} not found", expected))
            })?;
            let block_hash = from_hex_column(&block_row.get::<_, String>(0)?)?;
            if block_hash == expected {
                let block_height: u32 = block_row.get(1)?;
                if block_height != height - 1 {
                    return Err(ChainStorageError::Corruption(format!(
                        "block {} at height {}, expected {}",
                        expected,
                        block_height,
                        height - 1
                    )));
                }
                break (
                    block_row.get::<_, i64>(2)?,
                    block_row.get::<_, Vec<u8>>(3)?,
                );
            }
        };
        height -= 1;

        insert.execute(params![
            header_hash,
            prev_hash,
            height,
            ses,
            is_fully_compactified,
            1i64, // in_main_chain
            compress_blob(&block_blob)?,
            record_blob,
        ])?;
        expected = prev_hash;
        converted += 1;

        commit_in -= 1;
        if commit_in == 0 {
            commit_in = BLOCK_COMMIT_RATE;
            out_db.execute_batch("COMMIT; BEGIN")?;
            println!("  {:>10} blocks, at height {}", converted, height);
        }
    }
    out_db.execute_batch("COMMIT")?;

    if height != 0 {
        return Err(ChainStorageError::Corruption(format!(
            "chain walk stopped at height {}, block {} missing",
            height, expected
        )));
    }
    println!("  {} blocks on the main chain", converted);
    Ok(())
}

fn convert_sub_epoch_segments(
    in_db: &Connection,
    out_db: &Connection,
) -> Result<(), ChainStorageError> {
    println!("[2/5] converting sub_epoch_segments_v3");
    if !crate::db_version::has_table(in_db, "sub_epoch_segments_v3")? {
        println!("  no sub_epoch_segments_v3 table, skipping");
        return Ok(());
    }
    let mut stmt =
        in_db.prepare("SELECT ses_block_hash, challenge_segments FROM sub_epoch_segments_v3")?;
    let mut rows = stmt.query([])?;
    let mut insert =
        out_db.prepare("INSERT OR REPLACE INTO sub_epoch_segments_v3 VALUES(?, ?)")?;
    let mut commit_in = SES_COMMIT_RATE;
    out_db.execute_batch("BEGIN")?;
    while let Some(row) = rows.next()? {
        let hash = from_hex_column(&row.get::<_, String>(0)?)?;
        let segments: Vec<u8> = row.get(1)?;
        insert.execute(params![hash, segments])?;
        commit_in -= 1;
        if commit_in == 0 {
            commit_in = SES_COMMIT_RATE;
            out_db.execute_batch("COMMIT; BEGIN")?;
        }
    }
    out_db.execute_batch("COMMIT")?;
    Ok(())
}

fn convert_hints(in_db: &Connection, out_db: &Connection) -> Result<(), ChainStorageError> {
    println!("[3/5] converting hints");
    out_db.execute_batch(
        "CREATE TABLE hints(coin_id blob, hint blob, UNIQUE (coin_id, hint))",
    )?;
    if !crate::db_version::has_table(in_db, "hints")? {
        println!("  no hints table, skipping");
        return Ok(());
    }
    let mut stmt = in_db.prepare("SELECT coin_id, hint FROM hints")?;
    let mut rows = stmt.query([])?;
    // v1 permits exact-duplicate pairs; OR IGNORE collapses them
    let mut insert = out_db.prepare("INSERT OR IGNORE INTO hints VALUES(?, ?)")?;
    let mut commit_in = HINT_COMMIT_RATE;
    out_db.execute_batch("BEGIN")?;
    while let Some(row) = rows.next()? {
        let coin_id: Vec<u8> = row.get(0)?;
        let hint: Vec<u8> = row.get(1)?;
        insert.execute(params![coin_id, hint])?;
        commit_in -= 1;
        if commit_in == 0 {
            commit_in = HINT_COMMIT_RATE;
            out_db.execute_batch("COMMIT; BEGIN")?;
        }
    }
    out_db.execute_batch("COMMIT")?;
    Ok(())
}

fn convert_coins(
    in_db: &Connection,
    out_db: &Connection,
    peak_height: u32,
) -> Result<(), ChainStorageError> {
    println!("[4/5] converting coin_record");
    out_db.execute_batch(
        "CREATE TABLE coin_record(
             coin_name blob PRIMARY KEY,
             confirmed_index bigint,
             spent_index bigint,
             coinbase int,
             puzzle_hash blob,
             coin_parent blob,
             amount blob,
             timestamp bigint)",
    )?;
    let mut stmt = in_db.prepare(
        "SELECT coin_name, confirmed_index, spent_index, coinbase, puzzle_hash,
                coin_parent, amount, timestamp
         FROM coin_record WHERE confirmed_index <= ?",
    )?;
    let mut rows = stmt.query(params![peak_height])?;
    let mut insert = out_db.prepare("INSERT INTO coin_record VALUES(?, ?, ?, ?, ?, ?, ?, ?)")?;
    let mut commit_in = COIN_COMMIT_RATE;
    let mut converted = 0usize;
    out_db.execute_batch("BEGIN")?;
    while let Some(row) = rows.next()? {
        let mut spent_index: u32 = row.get(2)?;
        // a coin spent after the snapshot peak is unspent in the converted
        // snapshot
        if spent_index > peak_height {
            spent_index = 0;
        }
        insert.execute(params![
            from_hex_column(&row.get::<_, String>(0)?)?,
            row.get::<_, u32>(1)?,
            spent_index,
            row.get::<_, i64>(3)?,
            from_hex_column(&row.get::<_, String>(4)?)?,
            from_hex_column(&row.get::<_, String>(5)?)?,
            row.get::<_, Vec<u8>>(6)?,
            row.get::<_, i64>(7)?,
        ])?;
        converted += 1;
        commit_in -= 1;
        if commit_in == 0 {
            commit_in = COIN_COMMIT_RATE;
            out_db.execute_batch("COMMIT; BEGIN")?;
            println!("  {:>10} coins", converted);
        }
    }
    out_db.execute_batch("COMMIT")?;
    println!("  {} coins", converted);
    Ok(())
}
