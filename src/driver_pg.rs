//! Native PostgreSQL driver
//!
//! Uses the simple-query protocol, which returns every column as text --
//! exactly the contract the driver abstraction promises. Binary row
//! formats would buy nothing here, since the cursor layer parses text.

use crate::driver::{Connection, RecordSet, TextRecordSet, TextRow};
use crate::error::{Result, StoreError};
use postgres::{Client, NoTls, SimpleQueryMessage};

/// Connection over the native client
pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    /// Open a connection. `postgres://…` URIs pass through unchanged; a
    /// bare leading `/` is taken as a unix socket directory.
    pub fn open(uri: &str) -> Result<PgConnection> {
        let params = if uri.starts_with('/') {
            format!("host={}", uri)
        } else {
            uri.to_string()
        };
        let client = Client::connect(&params, NoTls)
            .map_err(|e| StoreError::Driver(e.to_string()))?;
        Ok(PgConnection { client })
    }
}

impl Connection for PgConnection {
    fn exec(&mut self, sql: &str) -> Result<Box<dyn RecordSet>> {
        let messages = self
            .client
            .simple_query(sql)
            .map_err(|e| StoreError::Driver(e.to_string()))?;

        let mut rs = TextRecordSet::new();
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                let mut text_row = TextRow::new();
                for i in 0..row.len() {
                    // NULL columns are skipped, matching the contract.
                    if let Some(value) = row
                        .try_get(i)
                        .map_err(|e| StoreError::Driver(e.to_string()))?
                    {
                        text_row.push(row.columns()[i].name(), value);
                    }
                }
                rs.push(text_row);
            }
        }
        Ok(Box::new(rs))
    }

    fn connected(&mut self) -> bool {
        !self.client.is_closed()
    }
}
