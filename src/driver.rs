//! SQL driver abstraction
//!
//! A deliberately text-oriented contract: a [`Connection`] executes raw SQL
//! and hands back a [`RecordSet`] that can be walked row by row, each row
//! exposing its (column-name, column-value) pairs as text. Numeric coercion
//! is the cursor layer's concern, not the driver's.
//!
//! Three drivers implement the contract: the native PostgreSQL client
//! (preferred), a generic ODBC client (behind the `odbc` cargo feature),
//! and an in-memory driver for tests and demos.

use crate::error::{Result, StoreError};

/// One result row
pub trait RowView {
    /// Walk the (column-name, value) pairs in column order. NULL columns
    /// are skipped. The callback returns true to stop early.
    fn foreach_column(&self, cb: &mut dyn FnMut(&str, &str) -> bool);
}

/// The response to one SQL statement
pub trait RecordSet {
    /// Walk the rows in order. The callback returns true to stop early.
    fn foreach_row(&mut self, cb: &mut dyn FnMut(&dyn RowView) -> bool);

    /// Number of rows in the set
    fn row_count(&self) -> usize;
}

/// A live database connection
pub trait Connection: Send {
    /// Execute one SQL statement, returning its result rows
    fn exec(&mut self, sql: &str) -> Result<Box<dyn RecordSet>>;

    /// Whether the connection is still usable
    fn connected(&mut self) -> bool;
}

// ---------------------------------------------------------------------------
// Materialized text rows, shared by the concrete drivers
// ---------------------------------------------------------------------------

/// A fully materialized row of (column, text value) pairs
#[derive(Debug, Clone, Default)]
pub struct TextRow {
    cols: Vec<(String, String)>,
}

impl TextRow {
    pub fn new() -> Self {
        TextRow { cols: Vec::new() }
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cols.push((name.into(), value.into()));
    }
}

impl RowView for TextRow {
    fn foreach_column(&self, cb: &mut dyn FnMut(&str, &str) -> bool) {
        for (name, value) in &self.cols {
            if cb(name, value) {
                break;
            }
        }
    }
}

/// A fully materialized record set
#[derive(Debug, Clone, Default)]
pub struct TextRecordSet {
    rows: Vec<TextRow>,
}

impl TextRecordSet {
    pub fn new() -> Self {
        TextRecordSet { rows: Vec::new() }
    }

    pub fn push(&mut self, row: TextRow) {
        self.rows.push(row);
    }
}

impl RecordSet for TextRecordSet {
    fn foreach_row(&mut self, cb: &mut dyn FnMut(&dyn RowView) -> bool) {
        for row in &self.rows {
            if cb(row) {
                break;
            }
        }
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }
}

// ---------------------------------------------------------------------------
// URI scheme dispatch
// ---------------------------------------------------------------------------

/// Which driver a connection URI selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Postgres,
    Odbc,
    Memory,
}

/// Classify a connection URI by its scheme prefix. A leading `/` defaults
/// to the native driver; anything unrecognized is a configuration error.
pub fn driver_kind(uri: &str) -> Result<DriverKind> {
    if uri.starts_with("postgres") || uri.starts_with('/') {
        Ok(DriverKind::Postgres)
    } else if uri.starts_with("odbc") {
        Ok(DriverKind::Odbc)
    } else if uri.starts_with("mem") {
        Ok(DriverKind::Memory)
    } else {
        Err(StoreError::Config(uri.to_string()))
    }
}

/// Open one connection for the given URI
pub fn connect(uri: &str) -> Result<Box<dyn Connection>> {
    match driver_kind(uri)? {
        DriverKind::Postgres => Ok(Box::new(crate::driver_pg::PgConnection::open(uri)?)),
        DriverKind::Memory => Ok(Box::new(crate::driver_mem::MemConnection::open(uri)?)),
        #[cfg(feature = "odbc")]
        DriverKind::Odbc => Ok(Box::new(crate::driver_odbc::OdbcConnection::open(uri)?)),
        #[cfg(not(feature = "odbc"))]
        DriverKind::Odbc => Err(StoreError::Config(format!(
            "{} (rebuild with the `odbc` feature)",
            uri
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_dispatch() {
        assert_eq!(
            driver_kind("postgres://u@localhost/db").unwrap(),
            DriverKind::Postgres
        );
        assert_eq!(
            driver_kind("/var/run/postgresql").unwrap(),
            DriverKind::Postgres
        );
        assert_eq!(driver_kind("odbc://dsn").unwrap(), DriverKind::Odbc);
        assert_eq!(driver_kind("mem://t1").unwrap(), DriverKind::Memory);
        assert!(matches!(
            driver_kind("mysql://nope"),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_text_record_set_walk() {
        let mut row = TextRow::new();
        row.push("uuid", "7");
        row.push("name", "cat");
        let mut rs = TextRecordSet::new();
        rs.push(row);

        let mut seen = Vec::new();
        rs.foreach_row(&mut |r| {
            r.foreach_column(&mut |name, value| {
                seen.push((name.to_string(), value.to_string()));
                false
            });
            false
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], ("uuid".to_string(), "7".to_string()));
    }
}
