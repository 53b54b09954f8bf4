//! Single-writer, many-reader connection pool over the embedded engine.
//!
//! One physical write connection guarded by a FIFO-fair async mutex, plus a
//! pool of read connections. Write transactions are nested savepoints with
//! generated names: only the outermost release commits to disk, an inner
//! failure rolls back that savepoint alone. Read transactions are deferred
//! and rolled back when the guard is dropped.
//!
//! Re-entrant writer acquisition is expressed by threading the `WriteTx`
//! guard through calls instead of tracking task identity: a callee that
//! takes `&WriteTx` joins the caller's transaction, a callee that takes
//! `&mut WriteTx` may open its own nested savepoint. Reading your own
//! uncommitted writes means querying through the guard you hold.

use std::collections::VecDeque;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use rusqlite::limits::Limit;
use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard, Semaphore, SemaphorePermit};
use tracing::debug;

use crate::error::{ChainStorageError, ForeignKeyViolation};

/// Knobs the caller passes in; the store reads no environment itself.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub reader_count: usize,
    /// `PRAGMA synchronous` level; `None` leaves the engine default.
    pub synchronous: Option<String>,
    pub foreign_keys: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            reader_count: 4,
            synchronous: None,
            foreign_keys: false,
        }
    }
}

struct ReaderPool {
    semaphore: Semaphore,
    connections: StdMutex<VecDeque<Connection>>,
}

/// The connection pool. All stores share one of these; the coordinator's
/// write path funnels through `writer()`.
pub struct TransactionalStore {
    writer: Mutex<Connection>,
    readers: ReaderPool,
    savepoint_seq: AtomicU64,
    fk_delay_active: AtomicBool,
    host_parameter_limit: usize,
}

impl TransactionalStore {
    /// Open the database file, configure WAL journaling on the writer and
    /// `query_only` readers, and fill the reader pool.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, ChainStorageError> {
        let writer = Connection::open(path)?;
        // journal_mode returns a result row, so it cannot go through
        // execute_batch
        let mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "opened write connection");
        if let Some(level) = &options.synchronous {
            writer.execute_batch(&format!("PRAGMA synchronous={}", level))?;
        }
        writer.execute_batch(&format!(
            "PRAGMA foreign_keys={}",
            if options.foreign_keys { "ON" } else { "OFF" }
        ))?;

        let host_parameter_limit = writer.limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER) as usize;

        let mut connections = VecDeque::with_capacity(options.reader_count);
        for _ in 0..options.reader_count {
            let reader = Connection::open(path)?;
            // readers can never be used for writing
            reader.execute_batch("PRAGMA query_only=ON")?;
            connections.push_back(reader);
        }

        Ok(TransactionalStore {
            writer: Mutex::new(writer),
            readers: ReaderPool {
                semaphore: Semaphore::new(options.reader_count),
                connections: StdMutex::new(connections),
            },
            savepoint_seq: AtomicU64::new(0),
            fk_delay_active: AtomicBool::new(false),
            host_parameter_limit,
        })
    }

    /// The engine's host-parameter limit; multi-key queries must batch
    /// their inputs below this.
    pub fn host_parameter_limit(&self) -> usize {
        self.host_parameter_limit
    }

    fn next_savepoint_name(&self) -> String {
        format!("s{}", self.savepoint_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquire the write connection and begin a savepoint. Dropping the
    /// guard without `commit()` rolls the savepoint back; this runs
    /// synchronously in `Drop`, so cancellation cannot leave the savepoint
    /// open.
    pub async fn writer(&self) -> Result<WriteTx<'_>, ChainStorageError> {
        let conn = self.writer.lock().await;
        let name = self.next_savepoint_name();
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(WriteTx {
            conn,
            seq: &self.savepoint_seq,
            name,
            done: false,
        })
    }

    /// A reader with a deferred read transaction: the guard observes one
    /// consistent snapshot until dropped (the transaction is closed with a
    /// rollback, never a commit).
    pub async fn reader(&self) -> Result<ReadTx<'_>, ChainStorageError> {
        let tx = self.reader_no_transaction().await?;
        tx.execute_batch("BEGIN DEFERRED")?;
        Ok(tx)
    }

    /// A reader without an explicit transaction; each statement sees the
    /// latest committed state.
    pub async fn reader_no_transaction(&self) -> Result<ReadTx<'_>, ChainStorageError> {
        let permit = self
            .readers
            .semaphore
            .acquire()
            .await
            .map_err(|_| ChainStorageError::InvalidOperation("reader pool closed".into()))?;
        let conn = self
            .readers
            .connections
            .lock()
            .expect("reader pool mutex poisoned")
            .pop_front()
            .expect("semaphore permit guarantees an available reader");
        Ok(ReadTx {
            pool: &self.readers,
            conn: Some(conn),
            _permit: permit,
        })
    }

    /// Run `scope` on the write connection with foreign-key enforcement set
    /// to `enforcement_enabled`. When enforcement was disabled, a full
    /// `foreign_key_check` runs on successful exit and any violation fails
    /// the scope (rolling it back) with the offending rows enumerated.
    /// Requesting a delay scope while one is active fails immediately.
    pub async fn delay_foreign_keys<T>(
        &self,
        enforcement_enabled: bool,
        scope: impl FnOnce(&Connection) -> Result<T, ChainStorageError>,
    ) -> Result<T, ChainStorageError> {
        if self.fk_delay_active.swap(true, Ordering::SeqCst) {
            return Err(ChainStorageError::NestedForeignKeyDelayedRequest);
        }
        let result = self.delay_foreign_keys_inner(enforcement_enabled, scope).await;
        self.fk_delay_active.store(false, Ordering::SeqCst);
        result
    }

    async fn delay_foreign_keys_inner<T>(
        &self,
        enforcement_enabled: bool,
        scope: impl FnOnce(&Connection) -> Result<T, ChainStorageError>,
    ) -> Result<T, ChainStorageError> {
        let conn = self.writer.lock().await;
        let original: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let requested = i64::from(enforcement_enabled);
        // the pragma is a no-op inside a transaction, so it must be set
        // before the savepoint opens
        if original != requested {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys={}",
                if enforcement_enabled { "ON" } else { "OFF" }
            ))?;
        }

        let name = self.next_savepoint_name();
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        let outcome = match scope(&conn) {
            Ok(value) => {
                let violations = if enforcement_enabled {
                    Vec::new()
                } else {
                    foreign_key_check(&conn)?
                };
                if violations.is_empty() {
                    conn.execute_batch(&format!("RELEASE {}", name))?;
                    Ok(value)
                } else {
                    let _ = conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", name));
                    Err(ChainStorageError::ForeignKeyViolations(violations))
                }
            }
            Err(e) => {
                let _ = conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", name));
                Err(e)
            }
        };

        if original != requested {
            let _ = conn.execute_batch(&format!("PRAGMA foreign_keys={}", original));
        }
        outcome
    }
}

fn foreign_key_check(conn: &Connection) -> Result<Vec<ForeignKeyViolation>, ChainStorageError> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
            fkid: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// An open write transaction (outermost savepoint). Deref yields the
/// connection for queries; `savepoint()` opens a nested scope.
pub struct WriteTx<'a> {
    conn: MutexGuard<'a, Connection>,
    seq: &'a AtomicU64,
    name: String,
    done: bool,
}

impl<'a> WriteTx<'a> {
    /// Open a nested savepoint. The borrow on `self` keeps the nesting
    /// strictly stack-shaped.
    pub fn savepoint(&mut self) -> Result<SavepointTx<'_>, ChainStorageError> {
        SavepointTx::begin(&self.conn, self.seq)
    }

    /// Release the savepoint. For the outermost transaction this is the
    /// point where changes reach disk.
    pub fn commit(mut self) -> Result<(), ChainStorageError> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.done = true;
        Ok(())
    }
}

impl Deref for WriteTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            // rollback to a savepoint does not end it; it must still be
            // released
            let _ = self
                .conn
                .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name));
        }
    }
}

/// A nested savepoint scope within a `WriteTx`.
pub struct SavepointTx<'t> {
    conn: &'t Connection,
    seq: &'t AtomicU64,
    name: String,
    done: bool,
}

impl<'t> SavepointTx<'t> {
    fn begin(conn: &'t Connection, seq: &'t AtomicU64) -> Result<Self, ChainStorageError> {
        let name = format!("s{}", seq.fetch_add(1, Ordering::Relaxed));
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(SavepointTx {
            conn,
            seq,
            name,
            done: false,
        })
    }

    pub fn savepoint(&mut self) -> Result<SavepointTx<'_>, ChainStorageError> {
        SavepointTx::begin(self.conn, self.seq)
    }

    pub fn commit(mut self) -> Result<(), ChainStorageError> {
        self.conn.execute_batch(&format!("RELEASE {}", self.name))?;
        self.done = true;
        Ok(())
    }
}

impl Deref for SavepointTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl Drop for SavepointTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self
                .conn
                .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name));
        }
    }
}

/// A pooled read connection, returned to the pool on drop.
pub struct ReadTx<'a> {
    pool: &'a ReaderPool,
    conn: Option<Connection>,
    _permit: SemaphorePermit<'a>,
}

impl Deref for ReadTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("reader connection present until drop")
    }
}

impl Drop for ReadTx<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                // read transactions are side-effect-free; rollback is
                // idempotent here
                let _ = conn.execute_batch("ROLLBACK");
            }
            self.pool
                .connections
                .lock()
                .expect("reader pool mutex poisoned")
                .push_back(conn);
        }
    }
}
