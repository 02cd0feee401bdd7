//! Resilient Bulk Loader
//!
//! Owns one store connection and a per-table cache of copy managers. Every
//! operation runs inside a reconnect-retry wrapper:
//!
//! - failure with the connection still open: surfaced at once, never retried
//! - failure with the connection closed: reconnect (only if closed), rebind
//!   every cached copy manager to the new connection, re-run the operation
//! - still closed after `retries` reconnects: terminal error naming the
//!   operation and the attempt count
//!
//! Batches are materialised into a [`CopyBuffer`] before the first attempt so
//! a retry re-sends exactly the same rows.
//!
//! ```text
//!   Open --(op fails, conn closed)--> reconnect --> Open
//!                                         |
//!                                         +--(connect fails)--> Closed
//!   Open/Closed --(budget exhausted)--> Failed
//! ```

use crate::store::{CopyBuffer, CopyRow, Connector, StoreConnection, StoreError};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info, warn};

pub const DEFAULT_RETRIES_ON_DISCONNECT: u32 = 3;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum LoadError {
    /// The initial connection could not be opened.
    Connect { target: String, source: StoreError },
    /// The operation failed while the connection stayed open. Not retried.
    Rejected { op: String, source: StoreError },
    /// Still disconnected after the retry budget was spent.
    Exhausted {
        op: String,
        attempts: u32,
        source: StoreError,
    },
    /// A row's width differs from the column list.
    Schema {
        table: String,
        expected: usize,
        got: usize,
    },
    /// The table's cached copy manager was built for other columns.
    ColumnMismatch { table: String },
}

impl LoadError {
    /// True for the retry-budget failure.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect { target, source } => {
                write!(f, "unable to connect to {}: {}", target, source)
            }
            Self::Rejected { op, source } => write!(f, "unable to {}: {}", op, source),
            Self::Exhausted {
                op,
                attempts,
                source,
            } => write!(f, "unable to {} after {} attempts: {}", op, attempts, source),
            Self::Schema {
                table,
                expected,
                got,
            } => write!(
                f,
                "row for {} has {} values, expected {}",
                table, got, expected
            ),
            Self::ColumnMismatch { table } => {
                write!(f, "copy manager for {} was created with other columns", table)
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. }
            | Self::Rejected { source, .. }
            | Self::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// Copy managers
// =============================================================================

/// Reusable per-table bulk-copy writer. Holds the table → columns binding
/// across reconnects; only the connection binding changes.
#[derive(Debug, Clone)]
pub struct CopyManager {
    table: String,
    columns: Vec<String>,
    bound_to: u64,
    batches: u64,
    rows: u64,
}

impl CopyManager {
    fn new(table: &str, columns: &[String], generation: u64) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.to_vec(),
            bound_to: generation,
            batches: 0,
            rows: 0,
        }
    }

    fn rebind(&mut self, generation: u64) {
        self.bound_to = generation;
    }

    fn copy<S: StoreConnection>(
        &mut self,
        conn: &mut S,
        generation: u64,
        batch: &CopyBuffer,
    ) -> Result<u64, StoreError> {
        if self.bound_to != generation {
            return Err(StoreError::StaleHandle {
                table: self.table.clone(),
            });
        }
        let written = conn.copy_in(&self.table, &self.columns, batch)?;
        self.batches += 1;
        self.rows += written;
        Ok(written)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Connection generation this manager writes through.
    pub fn bound_to(&self) -> u64 {
        self.bound_to
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

// =============================================================================
// Loader
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    Open,
    /// Disconnected; the next operation reconnects.
    Closed,
    /// The last operation exhausted its retry budget.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub batches: u64,
    pub rows: u64,
    pub commits: u64,
    pub reconnects: u64,
}

pub struct BulkLoader<C: Connector> {
    connector: C,
    conn: C::Connection,
    /// Bumped on every fresh connection; copy managers record the value they
    /// are bound to.
    generation: u64,
    retries: u32,
    copy_managers: HashMap<String, CopyManager>,
    state: LoaderState,
    stats: LoaderStats,
}

impl<C: Connector> BulkLoader<C> {
    /// Open the initial connection. `retries` bounds reconnects per operation.
    pub fn connect(connector: C, retries: u32) -> Result<Self, LoadError> {
        let conn = connector.connect().map_err(|source| LoadError::Connect {
            target: connector.describe(),
            source,
        })?;
        info!(target_store = %connector.describe(), retries, "bulk loader connected");

        Ok(Self {
            connector,
            conn,
            generation: 1,
            retries,
            copy_managers: HashMap::new(),
            state: LoaderState::Open,
            stats: LoaderStats::default(),
        })
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn stats(&self) -> LoaderStats {
        self.stats
    }

    pub fn copy_manager(&self, table: &str) -> Option<&CopyManager> {
        self.copy_managers.get(table)
    }

    /// Connection generation currently live (1 for the initial connection).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// Append `rows` to `table`. The rows are buffered first so a retry after
    /// a reconnect re-sends the identical batch.
    pub fn insert_batch<I>(
        &mut self,
        table: &str,
        columns: &[String],
        rows: I,
    ) -> Result<u64, LoadError>
    where
        I: IntoIterator,
        I::Item: CopyRow,
    {
        let mut batch = CopyBuffer::new(columns.len());
        for row in rows {
            batch
                .push(row.copy_values())
                .map_err(|got| LoadError::Schema {
                    table: table.to_string(),
                    expected: columns.len(),
                    got,
                })?;
        }

        let generation = self.generation;
        let manager = self
            .copy_managers
            .entry(table.to_string())
            .or_insert_with(|| CopyManager::new(table, columns, generation));
        if manager.columns != columns {
            return Err(LoadError::ColumnMismatch {
                table: table.to_string(),
            });
        }

        let op = format!("insert to {}", table);
        let written = self.with_reconnects(&op, |loader| {
            let generation = loader.generation;
            match loader.copy_managers.get_mut(table) {
                Some(manager) => manager.copy(&mut loader.conn, generation, &batch),
                None => Err(StoreError::StaleHandle {
                    table: table.to_string(),
                }),
            }
        })?;

        self.stats.batches += 1;
        self.stats.rows += written;
        debug!(table, rows = written, "batch copied");
        Ok(written)
    }

    /// Commit everything copied since the last commit. Nothing is replayed:
    /// rows staged on a connection that was lost are gone with it.
    pub fn commit(&mut self) -> Result<(), LoadError> {
        self.with_reconnects("perform commit", |loader| loader.conn.commit())?;
        self.stats.commits += 1;
        Ok(())
    }

    /// Idempotent.
    pub fn close(&mut self) {
        self.conn.close();
        self.state = LoaderState::Closed;
    }

    fn with_reconnects<T>(
        &mut self,
        op: &str,
        mut operation: impl FnMut(&mut Self) -> Result<T, StoreError>,
    ) -> Result<T, LoadError> {
        let mut attempt = 1u32;
        loop {
            let err = match operation(self) {
                Ok(value) => {
                    self.state = LoaderState::Open;
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.conn.is_closed() {
                return Err(LoadError::Rejected {
                    op: op.to_string(),
                    source: err,
                });
            }

            if attempt > self.retries {
                self.state = LoaderState::Failed;
                return Err(LoadError::Exhausted {
                    op: op.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            attempt += 1;
            warn!(op, attempt, error = %err, "connection lost, reconnecting");
            if self.reconnect() {
                info!(attempt, "Reconnected");
            }
        }
    }

    /// Open a fresh connection if the current one is closed and rebind every
    /// cached copy manager to it. Returns whether a live connection exists.
    fn reconnect(&mut self) -> bool {
        if !self.conn.is_closed() {
            return true;
        }

        match self.connector.connect() {
            Ok(conn) => {
                self.conn.close();
                self.conn = conn;
                self.generation += 1;
                for manager in self.copy_managers.values_mut() {
                    manager.rebind(self.generation);
                }
                self.stats.reconnects += 1;
                self.state = LoaderState::Open;
                true
            }
            Err(e) => {
                warn!(target_store = %self.connector.describe(), error = %e, "reconnect failed");
                self.state = LoaderState::Closed;
                false
            }
        }
    }
}

impl<C: Connector> Drop for BulkLoader<C> {
    fn drop(&mut self) {
        self.conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CopyValue, MemoryStore};

    fn cols() -> Vec<String> {
        vec!["id".to_string(), "label".to_string()]
    }

    fn rows(n: i64) -> Vec<Vec<CopyValue>> {
        (0..n)
            .map(|i| vec![CopyValue::Int(i), CopyValue::Text(format!("row-{}", i))])
            .collect()
    }

    #[test]
    fn test_insert_and_commit() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        assert_eq!(loader.insert_batch("t", &cols(), rows(5)).unwrap(), 5);
        loader.commit().unwrap();

        assert_eq!(store.committed_rows("t"), rows(5));
        assert_eq!(loader.stats().batches, 1);
        assert_eq!(loader.stats().commits, 1);
        assert_eq!(loader.state(), LoaderState::Open);
    }

    #[test]
    fn test_copy_manager_is_cached_per_table() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        loader.insert_batch("a", &cols(), rows(2)).unwrap();
        loader.insert_batch("a", &cols(), rows(3)).unwrap();
        loader.insert_batch("b", &cols(), rows(1)).unwrap();

        let a = loader.copy_manager("a").unwrap();
        assert_eq!(a.batches(), 2);
        assert_eq!(a.rows(), 5);
        assert_eq!(loader.copy_manager("b").unwrap().batches(), 1);
    }

    #[test]
    fn test_reconnect_rebinds_and_inserts_once() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();
        loader.insert_batch("t", &cols(), rows(1)).unwrap();
        loader.commit().unwrap();

        store.drop_connection_on_next_copies(2);
        assert_eq!(loader.insert_batch("t", &cols(), rows(4)).unwrap(), 4);
        loader.commit().unwrap();

        assert_eq!(loader.generation(), 3);
        let manager = loader.copy_manager("t").unwrap();
        assert_eq!(manager.bound_to(), 3);
        assert_eq!(manager.columns(), cols().as_slice());
        assert_eq!(store.committed_count("t"), 5);
        assert_eq!(store.attempted_batch_sizes(), vec![1, 4, 4, 4]);
        let attempts = store.attempted_batches();
        assert!(attempts[1..].iter().all(|batch| *batch == rows(4)));
        assert_eq!(loader.stats().reconnects, 2);
    }

    #[test]
    fn test_exhausted_budget_reports_attempts() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 2).unwrap();

        store.drop_connection_on_next_copies(10);
        let err = loader.insert_batch("t", &cols(), rows(3)).unwrap_err();

        assert!(err.is_terminal());
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(
            err.to_string(),
            "unable to insert to t after 3 attempts: connection lost: server closed the connection"
        );
        assert_eq!(store.attempted_batches(), vec![rows(3); 3]);
        assert_eq!(loader.state(), LoaderState::Failed);
    }

    #[test]
    fn test_refused_reconnects_consume_budget() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        store.kill_connection();
        store.refuse_next_connects(10);
        let err = loader.commit().unwrap_err();

        assert_eq!(err.attempts(), Some(4));
        assert!(err.to_string().starts_with("unable to perform commit after 4 attempts"));
        assert_eq!(store.connections_opened(), 1);
    }

    #[test]
    fn test_rejection_is_not_retried() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        store.reject_next_copies(1);
        let err = loader.insert_batch("t", &cols(), rows(2)).unwrap_err();

        assert!(matches!(err, LoadError::Rejected { .. }));
        assert_eq!(store.connections_opened(), 1);
        assert_eq!(store.copy_attempts(), 1);
        assert_eq!(loader.stats().reconnects, 0);
    }

    #[test]
    fn test_commit_reconnects_without_replay() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        loader.insert_batch("t", &cols(), rows(2)).unwrap();
        store.drop_connection_on_next_commits(1);
        loader.commit().unwrap();

        // Staged rows were lost with the first connection.
        assert_eq!(store.committed_count("t"), 0);
        assert_eq!(store.commit_attempts(), 2);
        assert_eq!(store.connections_opened(), 2);
    }

    #[test]
    fn test_schema_errors() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 3).unwrap();

        let short = vec![vec![CopyValue::Int(1)]];
        assert!(matches!(
            loader.insert_batch("t", &cols(), short).unwrap_err(),
            LoadError::Schema {
                expected: 2,
                got: 1,
                ..
            }
        ));

        loader.insert_batch("t", &cols(), rows(1)).unwrap();
        let other = vec!["id".to_string(), "other".to_string()];
        assert!(matches!(
            loader.insert_batch("t", &other, rows(1)).unwrap_err(),
            LoadError::ColumnMismatch { .. }
        ));
        assert_eq!(store.copy_attempts(), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_recoverable() {
        let store = MemoryStore::new();
        let mut loader = BulkLoader::connect(store.clone(), 1).unwrap();

        loader.close();
        loader.close();
        assert!(loader.is_closed());
        assert_eq!(loader.state(), LoaderState::Closed);

        loader.insert_batch("t", &cols(), rows(1)).unwrap();
        loader.commit().unwrap();
        assert_eq!(store.committed_count("t"), 1);
        assert_eq!(loader.state(), LoaderState::Open);
    }

    #[test]
    fn test_initial_connect_failure() {
        let store = MemoryStore::new();
        store.refuse_next_connects(1);
        let err = BulkLoader::connect(store, 3).err().unwrap();
        assert!(matches!(err, LoadError::Connect { .. }));
    }
}
