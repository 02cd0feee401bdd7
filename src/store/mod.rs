//! Store Connection Seam
//!
//! The loader talks to storage through two traits:
//!
//! - [`Connector`] opens fresh connections (initial connect and reconnects)
//! - [`StoreConnection`] is one live connection: bulk copy, commit, close
//!
//! Rows cross the seam as [`CopyValue`]s inside a [`CopyBuffer`], which is
//! materialised once per batch so it can be re-sent after a reconnect.

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use std::fmt;

pub use memory::{MemoryConnection, MemoryStore};
pub use sqlite::{SqliteConnection, SqliteConnector};

// =============================================================================
// Errors
// =============================================================================

/// Failure reported by a store backend.
#[derive(Debug)]
pub enum StoreError {
    /// Opening a connection failed.
    Connect(String),
    /// The operation found the connection gone.
    Disconnected(String),
    /// The store refused the data or statement (constraint, syntax, ...).
    Rejected(String),
    /// A copy manager was used with a connection it is not bound to.
    StaleHandle { table: String },
    Sqlite(rusqlite::Error),
}

impl StoreError {
    /// Whether the error text itself points at connectivity. The loader
    /// decides retries from `StoreConnection::is_closed`, not from this.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Disconnected(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(reason) => write!(f, "connect failed: {}", reason),
            Self::Disconnected(reason) => write!(f, "connection lost: {}", reason),
            Self::Rejected(reason) => write!(f, "rejected by store: {}", reason),
            Self::StaleHandle { table } => {
                write!(f, "copy manager for {} is bound to a stale connection", table)
            }
            Self::Sqlite(e) => write!(f, "sqlite: {}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

// =============================================================================
// Connection traits
// =============================================================================

/// Opens connections to one store.
pub trait Connector {
    type Connection: StoreConnection;

    fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Target description for logs. Must not contain credentials.
    fn describe(&self) -> String;
}

/// One live connection. Writes are staged until `commit`.
pub trait StoreConnection {
    /// True once the connection is unusable (closed locally or dropped by
    /// the peer).
    fn is_closed(&self) -> bool;

    /// Append every row of `batch` to `table` in one bulk transfer.
    fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        batch: &CopyBuffer,
    ) -> Result<u64, StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    /// Idempotent.
    fn close(&mut self);
}

// =============================================================================
// Copy values
// =============================================================================

/// A single cell in a bulk-copy row.
#[derive(Debug, Clone, PartialEq)]
pub enum CopyValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Stored in UTC so text ordering matches time ordering.
    Timestamp(DateTime<Utc>),
}

impl CopyValue {
    /// Canonical text form used by text-typed backends.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(v) => Some(v.to_string()),
            Self::Real(v) => Some(v.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Self::Time(t) => Some(t.format("%H:%M:%S").to_string()),
            Self::Timestamp(ts) => Some(format_timestamp(ts)),
        }
    }
}

/// `2024-01-02T14:30:00Z`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Anything that can be written as one bulk-copy row.
pub trait CopyRow {
    fn copy_values(&self) -> Vec<CopyValue>;
}

impl CopyRow for Vec<CopyValue> {
    fn copy_values(&self) -> Vec<CopyValue> {
        self.clone()
    }
}

/// A fully materialised batch. Cheap to re-send after a reconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyBuffer {
    width: usize,
    rows: Vec<Vec<CopyValue>>,
}

impl CopyBuffer {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: Vec::new(),
        }
    }

    /// Returns the offending width when the row does not fit.
    pub fn push(&mut self, row: Vec<CopyValue>) -> Result<(), usize> {
        if row.len() != self.width {
            return Err(row.len());
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<CopyValue>] {
        &self.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_copy_buffer_rejects_wrong_width() {
        let mut buf = CopyBuffer::new(2);
        assert!(buf.push(vec![CopyValue::Int(1), CopyValue::Null]).is_ok());
        assert_eq!(buf.push(vec![CopyValue::Int(1)]), Err(1));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_text_forms() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        assert_eq!(CopyValue::Timestamp(ts).to_text().unwrap(), "2024-01-02T14:30:00Z");
        assert_eq!(
            CopyValue::Time(NaiveTime::from_hms_opt(15, 30, 0).unwrap()).to_text().unwrap(),
            "15:30:00"
        );
        assert_eq!(CopyValue::Null.to_text(), None);
    }

    #[test]
    fn test_disconnect_classification() {
        assert!(StoreError::Disconnected("eof".into()).is_disconnect());
        assert!(!StoreError::Rejected("bad row".into()).is_disconnect());
    }
}
