//! In-process store.
//!
//! Backs `ingest --dry-run` and the resilience tests. Staged rows become
//! visible in `committed` only after `commit`; faults can be queued to drop
//! the live connection, refuse reconnects or reject data while connected.

use super::{CopyBuffer, CopyValue, Connector, StoreConnection, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct MemoryState {
    committed: HashMap<String, Vec<Vec<CopyValue>>>,
    live_connection: Option<u64>,
    connections_opened: u64,
    copy_attempts: u64,
    commit_attempts: u64,
    attempted_batches: Vec<Vec<Vec<CopyValue>>>,
    // Faults, consumed in order of occurrence
    drop_on_copy: u32,
    reject_copy: u32,
    drop_on_commit: u32,
    reject_commit: u32,
    refuse_connect: u32,
}

/// Shared handle to the in-memory database. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` copies drop the connection instead of writing.
    pub fn drop_connection_on_next_copies(&self, n: u32) {
        self.state.lock().drop_on_copy += n;
    }

    /// The next `n` copies fail while the connection stays open.
    pub fn reject_next_copies(&self, n: u32) {
        self.state.lock().reject_copy += n;
    }

    /// The next `n` commits drop the connection instead of committing.
    pub fn drop_connection_on_next_commits(&self, n: u32) {
        self.state.lock().drop_on_commit += n;
    }

    /// The next `n` commits fail while the connection stays open. Staged
    /// rows are discarded, as a rolled back transaction would be.
    pub fn reject_next_commits(&self, n: u32) {
        self.state.lock().reject_commit += n;
    }

    /// The next `n` connect attempts fail.
    pub fn refuse_next_connects(&self, n: u32) {
        self.state.lock().refuse_connect += n;
    }

    /// Sever the live connection from the server side.
    pub fn kill_connection(&self) {
        self.state.lock().live_connection = None;
    }

    pub fn committed_rows(&self, table: &str) -> Vec<Vec<CopyValue>> {
        self.state
            .lock()
            .committed
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn committed_count(&self, table: &str) -> usize {
        self.state.lock().committed.get(table).map_or(0, Vec::len)
    }

    pub fn connections_opened(&self) -> u64 {
        self.state.lock().connections_opened
    }

    pub fn copy_attempts(&self) -> u64 {
        self.state.lock().copy_attempts
    }

    pub fn commit_attempts(&self) -> u64 {
        self.state.lock().commit_attempts
    }

    /// Row count of every copy that reached the store, in order.
    pub fn attempted_batch_sizes(&self) -> Vec<usize> {
        self.state
            .lock()
            .attempted_batches
            .iter()
            .map(Vec::len)
            .collect()
    }

    /// Rows of every copy that reached the store, including dropped and
    /// rejected ones, in order.
    pub fn attempted_batches(&self) -> Vec<Vec<Vec<CopyValue>>> {
        self.state.lock().attempted_batches.clone()
    }
}

impl Connector for MemoryStore {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let mut state = self.state.lock();
        if state.refuse_connect > 0 {
            state.refuse_connect -= 1;
            return Err(StoreError::Connect("memory store refused connection".into()));
        }

        state.connections_opened += 1;
        let id = state.connections_opened;
        state.live_connection = Some(id);

        Ok(MemoryConnection {
            store: self.clone(),
            id,
            closed: false,
            staged: Vec::new(),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    store: MemoryStore,
    id: u64,
    closed: bool,
    staged: Vec<(String, Vec<Vec<CopyValue>>)>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn sever(&mut self, state: &mut MemoryState) {
        if state.live_connection == Some(self.id) {
            state.live_connection = None;
        }
        self.closed = true;
        self.staged.clear();
    }
}

impl StoreConnection for MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed || self.store.state.lock().live_connection != Some(self.id)
    }

    fn copy_in(
        &mut self,
        table: &str,
        _columns: &[String],
        batch: &CopyBuffer,
    ) -> Result<u64, StoreError> {
        if self.is_closed() {
            self.staged.clear();
            return Err(StoreError::Disconnected(format!("connection {} is closed", self.id)));
        }

        let store = self.store.clone();
        let mut state = store.state.lock();
        state.copy_attempts += 1;
        state.attempted_batches.push(batch.rows().to_vec());

        if state.drop_on_copy > 0 {
            state.drop_on_copy -= 1;
            self.sever(&mut state);
            return Err(StoreError::Disconnected("server closed the connection".into()));
        }
        if state.reject_copy > 0 {
            state.reject_copy -= 1;
            return Err(StoreError::Rejected(format!("invalid data for {}", table)));
        }

        self.staged.push((table.to_string(), batch.rows().to_vec()));
        Ok(batch.len() as u64)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.is_closed() {
            self.staged.clear();
            return Err(StoreError::Disconnected(format!("connection {} is closed", self.id)));
        }

        let store = self.store.clone();
        let mut state = store.state.lock();
        state.commit_attempts += 1;

        if state.drop_on_commit > 0 {
            state.drop_on_commit -= 1;
            self.sever(&mut state);
            return Err(StoreError::Disconnected("server closed the connection".into()));
        }
        if state.reject_commit > 0 {
            state.reject_commit -= 1;
            self.staged.clear();
            return Err(StoreError::Rejected("commit failed".into()));
        }

        for (table, rows) in self.staged.drain(..) {
            state.committed.entry(table).or_default().extend(rows);
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let store = self.store.clone();
        let mut state = store.state.lock();
        self.sever(&mut state);
    }
}
