//! Read-only integrity check for v2 database files.
//!
//! Walks the whole `full_blocks` table from the top, verifying the chain is
//! gap-free from the peak to height 0, that exactly the rows on that walk
//! carry `in_main_chain=1`, and that the height-0 prev hash is the genesis
//! challenge. With `validate_blocks` every blob is decoded and checked
//! against its row and its block record.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::block::{BlockRecord, FullBlock};
use crate::config::GENESIS_CHALLENGE;
use crate::error::ChainStorageError;
use crate::types::Bytes32;

/// Statistics from a successful validation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationSummary {
    pub peak_height: u32,
    pub main_chain_blocks: u32,
    pub orphaned_blocks: u32,
}

pub fn validate_v2(
    in_path: &Path,
    validate_blocks: bool,
) -> Result<ValidationSummary, ChainStorageError> {
    if !in_path.exists() {
        return Err(ChainStorageError::InvalidOperation(format!(
            "input file doesn't exist: {}",
            in_path.display()
        )));
    }
    println!("opening file for reading: {}", in_path.display());
    let db = Connection::open_with_flags(in_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    match crate::db_version::lookup_db_version(&db)? {
        Some(2) => {}
        Some(version) => {
            return Err(ChainStorageError::Corruption(format!(
                "database has the wrong version ({} expected 2)",
                version
            )))
        }
        None => {
            return Err(ChainStorageError::Corruption(
                "database is missing its version table".into(),
            ))
        }
    }

    let peak: Bytes32 = db
        .query_row("SELECT hash FROM current_peak WHERE key = 0", [], |row| {
            row.get(0)
        })
        .optional()?
        .ok_or_else(|| ChainStorageError::Corruption("database is missing current_peak".into()))?;
    println!("peak hash: {}", peak);

    let peak_height: u32 = db
        .query_row(
            "SELECT height FROM full_blocks WHERE header_hash = ?",
            params![peak],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            ChainStorageError::Corruption("database is missing the peak block".into())
        })?;
    println!("peak height: {}", peak_height);
    println!("traversing the full chain");

    let sql = format!(
        "SELECT header_hash, prev_hash, height, in_main_chain{} \
         FROM full_blocks ORDER BY height DESC",
        if validate_blocks {
            ", block, block_record"
        } else {
            ""
        }
    );
    let mut stmt = db.prepare(&sql)?;
    let mut rows = stmt.query([])?;

    let mut current_height = peak_height;
    // the hash we expect to find at current_height
    let mut expect_hash = peak;
    // set once found; becomes expect_hash at the next level down
    let mut next_hash: Option<Bytes32> = None;
    let mut num_orphans = 0u32;
    let mut main_chain_blocks = 0u32;

    while let Some(row) = rows.next()? {
        let header_hash: Bytes32 = row.get(0)?;
        let prev_hash: Bytes32 = row.get(1)?;
        let height: u32 = row.get(2)?;
        let in_main_chain: bool = row.get::<_, i64>(3)? != 0;

        // blocks added since we picked the peak are not part of this check
        if height > peak_height {
            continue;
        }

        let mut decoded: Option<(FullBlock, BlockRecord)> = None;
        if validate_blocks {
            let block = FullBlock::decompress(&row.get::<_, Vec<u8>>(4)?)?;
            let record = BlockRecord::from_bytes(&row.get::<_, Vec<u8>>(5)?)?;
            if record.header_hash != header_hash {
                return Err(ChainStorageError::Corruption(format!(
                    "block {} has a block record keyed {}",
                    header_hash, record.header_hash
                )));
            }
            if record.prev_hash != block.prev_hash || block.prev_hash != prev_hash {
                return Err(ChainStorageError::Corruption(format!(
                    "block {} has mismatching prev hashes",
                    header_hash
                )));
            }
            if block.height != height || record.height != height {
                return Err(ChainStorageError::Corruption(format!(
                    "block {} has a mismatching height: {} in blob, {} in row",
                    header_hash, block.height, height
                )));
            }
            decoded = Some((block, record));
        }

        if height != current_height {
            // moving down a level; the previous level must have produced
            // its chain block
            let found = next_hash.take().ok_or_else(|| {
                ChainStorageError::Corruption(format!(
                    "database is missing the block with hash {} at height {}",
                    expect_hash, current_height
                ))
            })?;
            expect_hash = found;
            current_height = height;
        }

        if header_hash == expect_hash {
            if next_hash.is_some() {
                return Err(ChainStorageError::Corruption(format!(
                    "database has multiple blocks with hash {} at height {}",
                    header_hash, height
                )));
            }
            if !in_main_chain {
                return Err(ChainStorageError::Corruption(format!(
                    "block {} (height {}) is part of the main chain, but in_main_chain is not set",
                    header_hash, height
                )));
            }
            next_hash = Some(prev_hash);
            main_chain_blocks += 1;
            drop(decoded);
        } else {
            if in_main_chain {
                return Err(ChainStorageError::Corruption(format!(
                    "block {} (height {}) is orphaned, but in_main_chain is set",
                    header_hash, height
                )));
            }
            num_orphans += 1;
        }
    }

    if current_height != 0 {
        return Err(ChainStorageError::Corruption(format!(
            "database is missing blocks below height {}",
            current_height
        )));
    }
    match next_hash {
        Some(genesis_prev) if genesis_prev == GENESIS_CHALLENGE => {}
        Some(genesis_prev) => {
            return Err(ChainStorageError::Corruption(format!(
                "blockchain has invalid genesis challenge {}, expected {}",
                genesis_prev, GENESIS_CHALLENGE
            )))
        }
        None => {
            return Err(ChainStorageError::Corruption(format!(
                "database is missing the block with hash {} at height 0",
                expect_hash
            )))
        }
    }

    if num_orphans > 0 {
        println!("{} orphaned blocks", num_orphans);
    }
    Ok(ValidationSummary {
        peak_height,
        main_chain_blocks,
        orphaned_blocks: num_orphans,
    })
}
