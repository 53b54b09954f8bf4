//! Schema version bookkeeping.
//!
//! The runtime refuses schema v1 outright; v1 files are input to the
//! offline migration only. Legacy v1 files predate the `database_version`
//! table, so v1 is also recognized structurally.

use rusqlite::{Connection, OptionalExtension};

use crate::error::ChainStorageError;

pub fn lookup_db_version(conn: &Connection) -> Result<Option<u32>, ChainStorageError> {
    if !has_table(conn, "database_version")? {
        return Ok(None);
    }
    let version: Option<u32> = conn
        .query_row("SELECT version FROM database_version", [], |row| row.get(0))
        .optional()?;
    Ok(version)
}

pub fn has_table(conn: &Connection, name: &str) -> Result<bool, ChainStorageError> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Verify the file is schema v2, stamping fresh files as v2. A separate
/// `block_records` table is the v1 schema's signature.
pub fn ensure_version_2(conn: &Connection) -> Result<(), ChainStorageError> {
    match lookup_db_version(conn)? {
        Some(2) => Ok(()),
        Some(version) => Err(ChainStorageError::UnsupportedSchemaVersion(version)),
        None => {
            if has_table(conn, "block_records")? {
                return Err(ChainStorageError::UnsupportedSchemaVersion(1));
            }
            conn.execute_batch(
                "CREATE TABLE database_version(version int);
                 INSERT INTO database_version VALUES(2);",
            )?;
            Ok(())
        }
    }
}
