//! SQLite store backend.
//!
//! A bulk copy is one prepared INSERT executed per row inside a savepoint, so
//! a failed batch leaves nothing behind while earlier batches of the same
//! transaction survive until `commit`.

use super::{CopyBuffer, CopyValue, Connector, StoreConnection, StoreError};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const CONNECTION_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
"#;

impl ToSql for CopyValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            CopyValue::Null => ToSqlOutput::Owned(Value::Null),
            CopyValue::Int(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            CopyValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            CopyValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            other => ToSqlOutput::Owned(other.to_text().map_or(Value::Null, Value::Text)),
        })
    }
}

/// Opens connections to one SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    init_sql: Option<String>,
}

impl SqliteConnector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            init_sql: None,
        }
    }

    /// SQL run on every fresh connection, after the pragmas (schema setup).
    pub fn with_init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Connector for SqliteConnector {
    type Connection = SqliteConnection;

    fn connect(&self) -> Result<SqliteConnection, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| {
            StoreError::Connect(format!("{}: {}", self.path.display(), e))
        })?;

        conn.execute_batch(CONNECTION_PRAGMAS)
            .map_err(|e| StoreError::Connect(format!("pragmas: {}", e)))?;
        if let Some(sql) = &self.init_sql {
            conn.execute_batch(sql)
                .map_err(|e| StoreError::Connect(format!("schema: {}", e)))?;
        }

        debug!(path = %self.path.display(), "sqlite connection opened");
        Ok(SqliteConnection {
            conn: Some(conn),
            in_transaction: false,
        })
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

/// One SQLite connection with an explicit write transaction.
pub struct SqliteConnection {
    conn: Option<Connection>,
    in_transaction: bool,
}

fn insert_sql(table: &str, columns: &[String]) -> String {
    let cols = columns
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO \"{}\" ({}) VALUES ({})", table, cols, placeholders)
}

fn copy_rows(conn: &Connection, sql: &str, batch: &CopyBuffer) -> rusqlite::Result<u64> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut written = 0u64;
    for row in batch.rows() {
        written += stmt.execute(params_from_iter(row.iter()))? as u64;
    }
    Ok(written)
}

impl StoreConnection for SqliteConnection {
    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    fn copy_in(
        &mut self,
        table: &str,
        columns: &[String],
        batch: &CopyBuffer,
    ) -> Result<u64, StoreError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StoreError::Disconnected("sqlite connection closed".into()))?;
        if !self.in_transaction {
            conn.execute_batch("BEGIN")?;
            self.in_transaction = true;
        }

        let sql = insert_sql(table, columns);
        conn.execute_batch("SAVEPOINT copy_batch")?;
        match copy_rows(conn, &sql, batch) {
            Ok(written) => {
                conn.execute_batch("RELEASE copy_batch")?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rb) = conn.execute_batch("ROLLBACK TO copy_batch; RELEASE copy_batch") {
                    warn!(error = %rb, "savepoint rollback failed");
                }
                Err(StoreError::Sqlite(e))
            }
        }
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StoreError::Disconnected("sqlite connection closed".into()))?;
        if !self.in_transaction {
            return Ok(());
        }

        self.in_transaction = false;
        conn.execute_batch("COMMIT").map_err(|e| {
            // Leave the connection usable for the next day.
            conn.execute_batch("ROLLBACK").ok();
            StoreError::from(e)
        })
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "sqlite close reported an error");
            }
        }
        self.in_transaction = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TEST_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS t (a INTEGER NOT NULL, b TEXT);";

    fn columns() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn batch(rows: &[(i64, &str)]) -> CopyBuffer {
        let mut buf = CopyBuffer::new(2);
        for (a, b) in rows {
            buf.push(vec![CopyValue::Int(*a), CopyValue::Text(b.to_string())])
                .unwrap();
        }
        buf
    }

    fn count(path: &Path) -> i64 {
        let conn = Connection::open(path).unwrap();
        conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_copy_is_invisible_until_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let connector = SqliteConnector::new(&path).with_init_sql(TEST_SCHEMA);

        let mut conn = connector.connect().unwrap();
        let written = conn.copy_in("t", &columns(), &batch(&[(1, "x"), (2, "y")])).unwrap();
        assert_eq!(written, 2);
        assert_eq!(count(&path), 0);

        conn.commit().unwrap();
        assert_eq!(count(&path), 2);
    }

    #[test]
    fn test_failed_batch_rolls_back_only_itself() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let connector = SqliteConnector::new(&path).with_init_sql(TEST_SCHEMA);
        let mut conn = connector.connect().unwrap();

        conn.copy_in("t", &columns(), &batch(&[(1, "x")])).unwrap();

        let mut bad = CopyBuffer::new(2);
        bad.push(vec![CopyValue::Int(2), CopyValue::Null]).unwrap();
        bad.push(vec![CopyValue::Null, CopyValue::Null]).unwrap();
        let err = conn.copy_in("t", &columns(), &bad).unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(!conn.is_closed());

        conn.commit().unwrap();
        assert_eq!(count(&path), 1);
    }

    #[test]
    fn test_closed_connection_reports_disconnect() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let connector = SqliteConnector::new(&path).with_init_sql(TEST_SCHEMA);
        let mut conn = connector.connect().unwrap();

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        let err = conn.copy_in("t", &columns(), &batch(&[(1, "x")])).unwrap_err();
        assert!(err.is_disconnect());
        assert!(conn.commit().unwrap_err().is_disconnect());
    }

    #[test]
    fn test_insert_sql_quotes_identifiers() {
        assert_eq!(
            insert_sql("raw_pricing", &columns()),
            "INSERT INTO \"raw_pricing\" (\"a\", \"b\") VALUES (?1, ?2)"
        );
    }
}
