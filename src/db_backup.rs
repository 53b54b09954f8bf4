//! Online backup of a live database file via the engine's backup API.
//!
//! Safe against a running node: the backup iterates pages and restarts its
//! window when the source changes under it. `no_indexes` drops the known
//! secondary indices on the destination, shrinking the file; the target can
//! rebuild them at the next `create()`.

use std::path::Path;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};

use crate::error::ChainStorageError;

const PAGES_PER_STEP: std::os::raw::c_int = 1024;
const PAUSE_BETWEEN_STEPS: Duration = Duration::from_millis(10);

/// Secondary indices the stores create; the base tables are self-contained
/// without them.
const DROPPABLE_INDICES: &[&str] = &[
    "height",
    "is_fully_compactified",
    "coin_confirmed_index",
    "coin_spent_index",
    "coin_puzzle_hash",
    "coin_parent_index",
    "hint_index",
];

pub fn backup_db(
    in_path: &Path,
    out_path: &Path,
    no_indexes: bool,
) -> Result<(), ChainStorageError> {
    if out_path.exists() {
        return Err(ChainStorageError::InvalidOperation(format!(
            "output file already exists: {}",
            out_path.display()
        )));
    }
    println!("backing up {} to {}", in_path.display(), out_path.display());

    let source = Connection::open_with_flags(in_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut destination = Connection::open(out_path)?;
    {
        let backup = Backup::new(&source, &mut destination)?;
        backup.run_to_completion(PAGES_PER_STEP, PAUSE_BETWEEN_STEPS, None)?;
    }

    if no_indexes {
        for index in DROPPABLE_INDICES {
            destination.execute_batch(&format!("DROP INDEX IF EXISTS {}", index))?;
        }
        destination.execute_batch("VACUUM")?;
        println!("dropped {} indices on the destination", DROPPABLE_INDICES.len());
    }
    Ok(())
}
