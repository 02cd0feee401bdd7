//! Pricing Reports
//!
//! Read-only queries over a loaded pricing table. Results come back as a
//! [`ReportTable`] (ordered columns plus JSON cells) and print either as JSON
//! lines or as a tab separated table.

use crate::session::localize;
use crate::store::format_timestamp;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, Params};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Number, Value};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// Result tables
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ReportTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell by column name.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }

    fn without_column(mut self, column: &str) -> Self {
        if let Some(idx) = self.columns.iter().position(|c| c == column) {
            self.columns.remove(idx);
            for row in &mut self.rows {
                if idx < row.len() {
                    row.remove(idx);
                }
            }
        }
        self
    }

    pub fn write<W: Write>(&self, out: &mut W, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::Json => {
                for row in &self.rows {
                    let view = RowView {
                        columns: &self.columns,
                        cells: row,
                    };
                    serde_json::to_writer(&mut *out, &view)?;
                    writeln!(out)?;
                }
            }
            OutputFormat::Table => {
                writeln!(out, "{}", self.columns.join("\t"))?;
                for row in &self.rows {
                    let cells: Vec<String> = row.iter().map(cell_text).collect();
                    writeln!(out, "{}", cells.join("\t"))?;
                }
                writeln!(out, "({} rows)", self.rows.len())?;
            }
        }
        Ok(())
    }
}

/// One row serialised as a JSON object with columns in table order.
struct RowView<'a> {
    columns: &'a [String],
    cells: &'a [Value],
}

impl Serialize for RowView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (column, cell) in self.columns.iter().zip(self.cells) {
            map.serialize_entry(column, cell)?;
        }
        map.end()
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "table" | "tsv" => Ok(Self::Table),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Table => "table",
            Self::Json => "json",
        })
    }
}

/// Which end of a window a snapshot is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Earliest timestamp in the window
    Asc,
    /// Latest timestamp in the window
    #[default]
    Desc,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

// =============================================================================
// Size
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TableSize {
    pub table: String,
    pub rows: u64,
    pub database_bytes: u64,
    pub size: String,
}

/// Human-readable byte count: `512 bytes`, `48 kB`, `12 MB`.
pub fn pretty_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["kB", "MB", "GB", "TB"];
    if bytes < 10 * 1024 {
        return format!("{} bytes", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 10.0 * 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{} {}", value.round() as u64, UNITS[unit])
}

// =============================================================================
// Queries
// =============================================================================

/// Read-only handle on a pricing database.
pub struct ReportDb {
    conn: Connection,
    table: String,
}

impl ReportDb {
    pub fn open(path: impl AsRef<Path>, table: &str) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::with_connection(conn, table)
    }

    pub fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid table name: {:?}", table);
        }
        Ok(Self {
            conn,
            table: table.to_string(),
        })
    }

    pub fn table_size(&self) -> Result<TableSize> {
        let rows: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )?;
        let page_count: i64 = self.conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = self.conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        let bytes = (page_count * page_size).max(0) as u64;

        Ok(TableSize {
            table: self.table.clone(),
            rows: rows.max(0) as u64,
            database_bytes: bytes,
            size: pretty_bytes(bytes),
        })
    }

    /// Every row of `fund` on local day `day`, newest first.
    pub fn day_data(&self, fund: &str, day: NaiveDate, tz: Tz) -> Result<ReportTable> {
        let (start, end) = local_day_bounds(day, day, tz)?;
        let sql = format!(
            "SELECT * FROM {} WHERE fund = ?1 AND time >= ?2 AND time < ?3 ORDER BY time DESC",
            self.table
        );
        self.query(&sql, params![fund, format_timestamp(&start), format_timestamp(&end)])
    }

    /// All rows at the first (`Asc`) or last (`Desc`) timestamp in
    /// `[start, end)`.
    pub fn snapshot(
        &self,
        fund: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        direction: Direction,
    ) -> Result<ReportTable> {
        let order = match direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        let sql = format!(
            "SELECT rp.* FROM {table} AS rp
             WHERE rp.fund = ?1
               AND rp.time = (
                 SELECT time FROM {table}
                  WHERE fund = ?1 AND time >= ?2 AND time < ?3
                  ORDER BY time {order} LIMIT 1)",
            table = self.table,
            order = order,
        );
        self.query(&sql, params![fund, format_timestamp(&start), format_timestamp(&end)])
    }

    /// Rows at exactly `ts`.
    pub fn exact_snapshot(&self, fund: &str, ts: DateTime<Utc>) -> Result<ReportTable> {
        let sql = format!("SELECT * FROM {} WHERE fund = ?1 AND time = ?2", self.table);
        self.query(&sql, params![fund, format_timestamp(&ts)])
    }

    /// First row per UTC day bucket and contract, for local days
    /// `start..=end`.
    pub fn open_data_daily(
        &self,
        fund: &str,
        start: NaiveDate,
        end: NaiveDate,
        tz: Tz,
    ) -> Result<ReportTable> {
        let (from, to) = local_day_bounds(start, end, tz)?;
        let sql = format!(
            "SELECT * FROM (
               SELECT substr(rp.time, 1, 10) AS bucket, rp.*,
                      ROW_NUMBER() OVER (
                        PARTITION BY substr(rp.time, 1, 10), rp.expiry_date, rp.expiry_time,
                                     rp.expiry_cycle, rp.contract_type, rp.option_kind, rp.strike
                        ORDER BY rp.time) AS first_rank
                 FROM {} AS rp
                WHERE rp.fund = ?1 AND rp.time >= ?2 AND rp.time < ?3)
              WHERE first_rank = 1
              ORDER BY bucket, expiry_date, strike, option_kind",
            self.table
        );
        let table =
            self.query(&sql, params![fund, format_timestamp(&from), format_timestamp(&to)])?;
        Ok(table.without_column("first_rank"))
    }

    fn query<P: Params>(&self, sql: &str, params: P) -> Result<ReportTable> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let rows = stmt
            .query_map(params, |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(json_cell))
                    .collect::<rusqlite::Result<Vec<Value>>>()
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ReportTable { columns, rows })
    }
}

fn json_cell(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// UTC instants of local midnight on `first` and on the day after `last`.
fn local_day_bounds(
    first: NaiveDate,
    last: NaiveDate,
    tz: Tz,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let after = last
        .succ_opt()
        .with_context(|| format!("no day after {}", last))?;
    let start = localize(first.and_time(NaiveTime::MIN), tz)?;
    let end = localize(after.and_time(NaiveTime::MIN), tz)?;
    Ok((start.with_timezone(&Utc), end.with_timezone(&Utc)))
}
