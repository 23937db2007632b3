//! Generic ODBC driver
//!
//! Fallback for backends without a native client; roughly three times
//! slower than the native path. Enabled by the `odbc` cargo feature.
//! The URI is everything after the `odbc://` prefix, handed to the ODBC
//! driver manager as a connection string.

use crate::driver::{Connection, RecordSet, TextRecordSet, TextRow};
use crate::error::{Result, StoreError};
use odbc_api::buffers::TextRowSet;
use odbc_api::{ConnectionOptions, Cursor, Environment, ResultSetMetadata};

const BATCH_SIZE: usize = 256;
const MAX_CELL_BYTES: usize = 4096;

/// Connection through the ODBC driver manager
pub struct OdbcConnection {
    env: &'static Environment,
    conn_str: String,
    alive: bool,
}

fn environment() -> Result<&'static Environment> {
    use once_cell::sync::OnceCell;
    static ENV: OnceCell<Environment> = OnceCell::new();
    ENV.get_or_try_init(Environment::new)
        .map_err(|e| StoreError::Driver(e.to_string()))
}

impl OdbcConnection {
    pub fn open(uri: &str) -> Result<OdbcConnection> {
        let conn_str = uri
            .trim_start_matches("odbc")
            .trim_start_matches(':')
            .trim_start_matches("//")
            .to_string();
        let env = environment()?;
        // Probe once so a bad DSN fails at pool construction, not mid-query.
        env.connect_with_connection_string(&conn_str, ConnectionOptions::default())
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        Ok(OdbcConnection {
            env,
            conn_str,
            alive: true,
        })
    }
}

impl Connection for OdbcConnection {
    fn exec(&mut self, sql: &str) -> Result<Box<dyn RecordSet>> {
        let conn = self
            .env
            .connect_with_connection_string(&self.conn_str, ConnectionOptions::default())
            .map_err(|e| {
                self.alive = false;
                StoreError::Driver(e.to_string())
            })?;

        let mut rs = TextRecordSet::new();
        let cursor = conn
            .execute(sql, ())
            .map_err(|e| StoreError::Driver(e.to_string()))?;

        if let Some(mut cursor) = cursor {
            let names: Vec<String> = cursor
                .column_names()
                .map_err(|e| StoreError::Driver(e.to_string()))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| StoreError::Driver(e.to_string()))?;

            let mut buffers = TextRowSet::for_cursor(BATCH_SIZE, &mut cursor, Some(MAX_CELL_BYTES))
                .map_err(|e| StoreError::Driver(e.to_string()))?;
            let mut row_set_cursor = cursor
                .bind_buffer(&mut buffers)
                .map_err(|e| StoreError::Driver(e.to_string()))?;

            while let Some(batch) = row_set_cursor
                .fetch()
                .map_err(|e| StoreError::Driver(e.to_string()))?
            {
                for row in 0..batch.num_rows() {
                    let mut text_row = TextRow::new();
                    for (column, name) in names.iter().enumerate() {
                        if let Some(bytes) = batch.at(column, row) {
                            text_row.push(name.clone(), String::from_utf8_lossy(bytes));
                        }
                    }
                    rs.push(text_row);
                }
            }
        }
        Ok(Box::new(rs))
    }

    fn connected(&mut self) -> bool {
        self.alive
    }
}
