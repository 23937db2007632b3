//! Query cursor
//!
//! A scratch object allocated on the caller's stack for the duration of a
//! query sequence. It borrows a pooled connection on first use, parses
//! column callbacks into strongly typed scratch fields, and returns the
//! connection to the pool when dropped -- so every exit path of a query
//! scope releases its connection.

use crate::driver::Connection;
use crate::error::Result;
use crate::pool::ConnectionPool;

/// Scratch record filled from one result row
///
/// Column dispatch is by fixed column name; unknown columns are ignored.
/// Numeric fields parse permissively (unparsable text reads as zero, like
/// the C library converters the wire format was designed against).
#[derive(Debug, Default, Clone)]
pub(crate) struct Scratch {
    pub uuid: u64,
    pub space: u64,
    /// db-side type code of an atom row, or value-kind code of a value row
    pub itype: i32,
    pub name: Option<String>,
    pub outlist: Option<String>,
    pub height: i32,
    pub tv_type: i32,
    pub mean: f64,
    pub confidence: f64,
    pub count: f64,
    pub fltval: Option<String>,
    pub strval: Option<String>,
    pub lnkval: Option<String>,
    pub key: u64,
    pub vuid: u64,
    pub tname: Option<String>,
}

impl Scratch {
    pub fn clear(&mut self) {
        *self = Scratch::default();
    }

    /// Fixed-column-name dispatch into the scratch fields
    pub fn absorb(&mut self, column: &str, value: &str) {
        match column {
            "uuid" => self.uuid = value.parse().unwrap_or(0),
            "space" => self.space = value.parse().unwrap_or(0),
            "type" => self.itype = value.parse().unwrap_or(0),
            "name" => self.name = Some(value.to_string()),
            "outgoing" => self.outlist = Some(value.to_string()),
            "height" => self.height = value.parse().unwrap_or(0),
            "tv_type" => self.tv_type = value.parse().unwrap_or(0),
            "stv_mean" => self.mean = value.parse().unwrap_or(0.0),
            "stv_confidence" => self.confidence = value.parse().unwrap_or(0.0),
            "stv_count" => self.count = value.parse().unwrap_or(0.0),
            "floatvalue" => self.fltval = Some(value.to_string()),
            "stringvalue" => self.strval = Some(value.to_string()),
            "linkvalue" => self.lnkval = Some(value.to_string()),
            "key" => self.key = value.parse().unwrap_or(0),
            "vuid" => self.vuid = value.parse().unwrap_or(0),
            "typename" => self.tname = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Cursor over a sequence of queries sharing one pooled connection
pub(crate) struct Response<'p> {
    pool: &'p ConnectionPool,
    conn: Option<Box<dyn Connection>>,
    pub row: Scratch,
}

impl<'p> Response<'p> {
    pub fn new(pool: &'p ConnectionPool) -> Response<'p> {
        Response {
            pool,
            conn: None,
            row: Scratch::default(),
        }
    }

    /// Execute a statement, ignoring any result rows
    pub fn exec(&mut self, sql: &str) -> Result<()> {
        self.exec_each(sql, |_| false).map(|_| ())
    }

    /// Execute a query, invoking `per_row` with the freshly filled scratch
    /// record for each result row. The callback returns true to stop early.
    /// Returns the number of rows visited.
    pub fn exec_each<F>(&mut self, sql: &str, mut per_row: F) -> Result<usize>
    where
        F: FnMut(&Scratch) -> bool,
    {
        // Taking a connection may block; the pool size regulates how many
        // SQL requests can be outstanding in parallel.
        if self.conn.is_none() {
            self.conn = Some(self.pool.pop());
        }
        let conn = self.conn.as_mut().expect("connection just acquired");
        let mut rs = conn.exec(sql)?;

        let row = &mut self.row;
        let mut visited = 0;
        rs.foreach_row(&mut |view| {
            row.clear();
            view.foreach_column(&mut |column, value| {
                row.absorb(column, value);
                false
            });
            visited += 1;
            per_row(row)
        });
        Ok(visited)
    }
}

impl Drop for Response<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_dispatch() {
        let mut row = Scratch::default();
        row.absorb("uuid", "42");
        row.absorb("type", "7");
        row.absorb("name", "cat");
        row.absorb("stv_mean", "0.5");
        row.absorb("no_such_column", "ignored");
        assert_eq!(row.uuid, 42);
        assert_eq!(row.itype, 7);
        assert_eq!(row.name.as_deref(), Some("cat"));
        assert_eq!(row.mean, 0.5);
    }

    #[test]
    fn test_response_returns_connection() {
        crate::driver_mem::MemDb::forget("response_unit_1");
        let pool = ConnectionPool::open("mem://response_unit_1", 1).unwrap();
        {
            let mut rp = Response::new(&pool);
            rp.exec("VACUUM;").unwrap();
            assert_eq!(pool.free(), 0, "cursor holds its connection");
        }
        assert_eq!(pool.free(), 1, "drop must return the connection");
    }

    #[test]
    fn test_exec_each_counts_rows() {
        crate::driver_mem::MemDb::forget("response_unit_2");
        let pool = ConnectionPool::open("mem://response_unit_2", 1).unwrap();
        let mut rp = Response::new(&pool);
        rp.exec("INSERT INTO Spaces VALUES (1,1);").unwrap();
        rp.exec("INSERT INTO Spaces VALUES (2,1);").unwrap();
        let mut spaces = Vec::new();
        let n = rp
            .exec_each("SELECT space FROM Spaces;", |row| {
                spaces.push(row.space);
                false
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(spaces, vec![1, 2]);
    }
}
