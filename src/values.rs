//! Typed value store
//!
//! Values are immutable rows keyed by vuid; valuations bind a
//! (key-atom, host-atom) pair to a value and are updated by
//! delete-then-insert inside a transaction. LinkValue composites store
//! their children depth-first and own them exclusively, so deleting a
//! parent reclaims the whole tree.

use crate::atomtable::Handle;
use crate::error::{Result, StoreError};
use crate::response::{Response, Scratch};
use crate::storage::{AtomStorage, StmtBuilder, StorageInner, RECURSION_LIMIT};
use crate::types::{Uuid, Value, Vuid, FLOAT_VALUE_CODE, LINK_VALUE_CODE, STRING_VALUE_CODE};
use std::sync::atomic::Ordering;

// ---------------------------------------------------------------------------
// Array literals: the backend's `{e1,e2,…}` form, wrapped in SQL quotes
// on the way out, unwrapped and unescaped on the way in.
// ---------------------------------------------------------------------------

/// Wrap an array body in SQL single quotes
fn sql_quote(body: String) -> String {
    format!("'{}'", body.replace('\'', "''"))
}

pub(crate) fn id_array_literal(ids: &[u64]) -> String {
    let body = ids
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    sql_quote(format!("{{{}}}", body))
}

pub(crate) fn float_array_literal(vals: &[f64]) -> String {
    let body = vals
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    sql_quote(format!("{{{}}}", body))
}

/// String elements are always double-quoted, with backslash and quote
/// escaped, so commas and quotes in the payload round-trip.
pub(crate) fn string_array_literal(vals: &[String]) -> String {
    let body = vals
        .iter()
        .map(|s| format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(", ");
    sql_quote(format!("{{{}}}", body))
}

/// Parse `{1, 2, 3}` into ids; tolerant of whitespace and empty arrays
pub(crate) fn parse_id_array(text: &str) -> Vec<u64> {
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|t| t.trim().parse().ok())
        .collect()
}

pub(crate) fn parse_float_array(text: &str) -> Vec<f64> {
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|t| t.trim().parse().ok())
        .collect()
}

/// Parse `{"a", "b b"}` into strings, handling quoted elements with
/// backslash escapes and bare (unquoted) elements.
pub(crate) fn parse_string_array(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let inner = text.trim();
    let inner = inner.strip_prefix('{').unwrap_or(inner);
    let inner = inner.strip_suffix('}').unwrap_or(inner);

    let mut chars = inner.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None => break,
            Some('"') => {
                chars.next();
                let mut elem = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                elem.push(escaped);
                            }
                        }
                        '"' => break,
                        other => elem.push(other),
                    }
                }
                out.push(elem);
                // Skip to the next separator.
                while matches!(chars.peek(), Some(c) if *c != ',') {
                    chars.next();
                }
                chars.next();
            }
            Some(_) => {
                let mut elem = String::new();
                while matches!(chars.peek(), Some(c) if *c != ',') {
                    elem.push(chars.next().expect("peeked"));
                }
                chars.next();
                out.push(elem.trim().to_string());
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Engine internals
// ---------------------------------------------------------------------------

impl StorageInner {
    /// Fill the typed column for a value, serializing LinkValue children
    /// first (depth-first) so their vuids can be referenced.
    fn add_value_columns(&self, stmt: &mut StmtBuilder, value: &Value, depth: usize) -> Result<()> {
        stmt.col("type", value.wire_code());
        match value {
            Value::Float(vals) => stmt.col("floatvalue", float_array_literal(vals)),
            Value::Str(vals) => stmt.col("stringvalue", string_array_literal(vals)),
            Value::Link(children) => {
                let mut vuids = Vec::with_capacity(children.len());
                for child in children {
                    vuids.push(self.store_value_at(child, depth + 1)?.as_u64());
                }
                stmt.col("linkvalue", id_array_literal(&vuids));
            }
        }
        Ok(())
    }

    /// Store a value as a fresh row; returns its vuid
    pub(crate) fn store_value_at(&self, value: &Value, depth: usize) -> Result<Vuid> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        let vuid = self.next_vuid.fetch_add(1, Ordering::SeqCst);
        let mut stmt = StmtBuilder::insert("Values");
        stmt.col("vuid", vuid);
        self.add_value_columns(&mut stmt, value, depth)?;
        let mut rp = Response::new(&self.pool);
        rp.exec(&stmt.finish(None))?;
        Ok(Vuid::new(vuid))
    }

    /// Rebuild a value from a fetched row, recursing through LinkValue
    /// children.
    fn unpack_value(&self, row: &Scratch, depth: usize) -> Result<Value> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        match row.itype {
            FLOAT_VALUE_CODE => Ok(Value::Float(parse_float_array(
                row.fltval.as_deref().unwrap_or("{}"),
            ))),
            STRING_VALUE_CODE => Ok(Value::Str(parse_string_array(
                row.strval.as_deref().unwrap_or("{}"),
            ))),
            LINK_VALUE_CODE => {
                let vuids = parse_id_array(row.lnkval.as_deref().unwrap_or("{}"));
                let mut children = Vec::with_capacity(vuids.len());
                for vuid in vuids {
                    children.push(self.get_value_at(vuid, depth + 1)?);
                }
                Ok(Value::Link(children))
            }
            other => Err(StoreError::UnknownValueType(other)),
        }
    }

    /// Fetch the single row of a value query and unpack it
    fn do_get_value(&self, sql: &str, depth: usize) -> Result<Value> {
        let mut found: Option<Scratch> = None;
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each(sql, |row| {
                found = Some(row.clone());
                true
            })?;
        }
        let row = found.ok_or_else(|| StoreError::EmptyResult(sql.to_string()))?;
        self.unpack_value(&row, depth)
    }

    pub(crate) fn get_value_at(&self, vuid: u64, depth: usize) -> Result<Value> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        let sql = format!("SELECT * FROM Values WHERE vuid = {};", vuid);
        self.do_get_value(&sql, depth)
    }

    /// Delete a value row, cascading through LinkValue children first.
    /// The cursor is released before recursing so that deeply nested
    /// composites cannot pin the whole connection pool.
    pub(crate) fn delete_value_at(&self, vuid: u64, depth: usize) -> Result<()> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        let mut found: Option<Scratch> = None;
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each(&format!("SELECT * FROM Values WHERE vuid = {};", vuid), |row| {
                found = Some(row.clone());
                true
            })?;
        }
        if let Some(row) = found {
            if row.itype == LINK_VALUE_CODE {
                for child in parse_id_array(row.lnkval.as_deref().unwrap_or("{}")) {
                    self.delete_value_at(child, depth + 1)?;
                }
            }
        }
        let mut rp = Response::new(&self.pool);
        rp.exec(&format!("DELETE FROM Values WHERE vuid = {};", vuid))
    }

    /// Delete the valuation row for (key, atom), if any, reclaiming the
    /// storage of its value tree. Runs on the caller's cursor so it joins
    /// the caller's transaction.
    fn delete_valuation_rows(&self, rp: &mut Response<'_>, kuid: u64, auid: u64) -> Result<()> {
        let mut existing: Option<Scratch> = None;
        rp.exec_each(
            &format!(
                "SELECT * FROM Valuations WHERE key = {} AND atom = {};",
                kuid, auid
            ),
            |row| {
                existing = Some(row.clone());
                true
            },
        )?;
        if let Some(row) = existing {
            if row.itype == LINK_VALUE_CODE {
                for child in parse_id_array(row.lnkval.as_deref().unwrap_or("{}")) {
                    self.delete_value_at(child, 0)?;
                }
            }
            rp.exec(&format!(
                "DELETE FROM Valuations WHERE key = {} AND atom = {};",
                kuid, auid
            ))?;
        }
        Ok(())
    }

    /// Replace the valuation for (key, atom). The delete and insert run
    /// inside one transaction so concurrent readers always observe either
    /// the old binding or the new one.
    pub(crate) fn store_valuation(&self, key: &Handle, atom: &Handle, value: &Value) -> Result<()> {
        // Whatever the TLB answers goes into the row; an unregistered key
        // or atom surfaces as the backend's foreign-key rejection.
        let kuid = self.tlb.get_uuid(key).as_u64();
        let auid = self.tlb.get_uuid(atom).as_u64();

        let mut rp = Response::new(&self.pool);
        rp.exec("BEGIN;")?;
        let outcome = (|| -> Result<()> {
            self.delete_valuation_rows(&mut rp, kuid, auid)?;

            let mut stmt = StmtBuilder::insert("Valuations");
            stmt.col("key", kuid);
            stmt.col("atom", auid);
            self.add_value_columns(&mut stmt, value, 0)?;
            rp.exec(&stmt.finish(None))
        })();
        match outcome {
            Ok(()) => rp.exec("COMMIT;"),
            Err(e) => {
                let _ = rp.exec("ROLLBACK;");
                Err(e)
            }
        }
    }

    pub(crate) fn get_valuation(&self, key: &Handle, atom: &Handle) -> Result<Value> {
        let sql = format!(
            "SELECT * FROM Valuations WHERE key = {} AND atom = {};",
            self.tlb.get_uuid(key).as_u64(),
            self.tlb.get_uuid(atom).as_u64()
        );
        self.do_get_value(&sql, 0)
    }

    pub(crate) fn delete_valuation(&self, key: &Handle, atom: &Handle) -> Result<()> {
        let kuid = self.tlb.get_uuid(key).as_u64();
        let auid = self.tlb.get_uuid(atom).as_u64();
        let mut rp = Response::new(&self.pool);
        rp.exec("BEGIN;")?;
        match self.delete_valuation_rows(&mut rp, kuid, auid) {
            Ok(()) => rp.exec("COMMIT;"),
            Err(e) => {
                let _ = rp.exec("ROLLBACK;");
                Err(e)
            }
        }
    }

    /// Persist every value attached to the atom
    pub(crate) fn store_atom_values(&self, atom: &Handle) -> Result<()> {
        for (key, value) in atom.value_entries() {
            self.store_valuation(&key, atom, &value)?;
        }
        Ok(())
    }

    /// Fetch every valuation of the atom and attach the values. A
    /// valuation whose key uuid cannot be resolved in the TLB is a hard
    /// error, never silently dropped.
    pub(crate) fn get_atom_values(&self, atom: &Handle) -> Result<()> {
        let uuid = self.tlb.get_uuid(atom);
        let mut rows: Vec<Scratch> = Vec::new();
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each(
                &format!("SELECT * FROM Valuations WHERE atom = {};", uuid.as_u64()),
                |row| {
                    rows.push(row.clone());
                    false
                },
            )?;
        }
        for row in rows {
            let key = self
                .tlb
                .get_atom(Uuid::new(row.key))
                .ok_or(StoreError::MissingValueKey(row.key))?;
            let value = self.unpack_value(&row, 0)?;
            atom.set_value(key, value);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

impl AtomStorage {
    /// Store a free-standing value; returns its vuid
    pub fn store_value(&self, value: &Value) -> Result<Vuid> {
        self.inner().store_value_at(value, 0)
    }

    /// Fetch a value by vuid, recursively for composites
    pub fn get_value(&self, vuid: Vuid) -> Result<Value> {
        self.inner().get_value_at(vuid.as_u64(), 0)
    }

    /// Delete a value by vuid, cascading through composite children
    pub fn delete_value(&self, vuid: Vuid) -> Result<()> {
        self.inner().delete_value_at(vuid.as_u64(), 0)
    }

    /// Bind a value to the (key, atom) slot, replacing and reclaiming any
    /// previous binding atomically.
    pub fn store_valuation(&self, key: &Handle, atom: &Handle, value: &Value) -> Result<()> {
        self.inner().store_valuation(key, atom, value)
    }

    /// Fetch the value bound to the (key, atom) slot
    pub fn get_valuation(&self, key: &Handle, atom: &Handle) -> Result<Value> {
        self.inner().get_valuation(key, atom)
    }

    /// Remove the (key, atom) binding and reclaim its value tree
    pub fn delete_valuation(&self, key: &Handle, atom: &Handle) -> Result<()> {
        self.inner().delete_valuation(key, atom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_array_roundtrip() {
        let lit = id_array_literal(&[1, 2, 3]);
        assert_eq!(lit, "'{1, 2, 3}'");
        assert_eq!(parse_id_array("{1, 2, 3}"), vec![1, 2, 3]);
        assert_eq!(parse_id_array("{}"), Vec::<u64>::new());
    }

    #[test]
    fn test_float_array_roundtrip() {
        let vals = [1.5, -2.25, 0.0];
        let lit = float_array_literal(&vals);
        assert_eq!(lit, "'{1.5, -2.25, 0}'");
        assert_eq!(parse_float_array("{1.5, -2.25, 0}"), vals.to_vec());
    }

    #[test]
    fn test_string_array_escaping() {
        let vals = vec![
            "plain".to_string(),
            "with, comma".to_string(),
            "with \"quotes\"".to_string(),
            "back\\slash".to_string(),
        ];
        let lit = string_array_literal(&vals);
        // Strip the outer SQL quotes to get what the backend would echo.
        let body = lit.trim_start_matches('\'').trim_end_matches('\'');
        assert_eq!(parse_string_array(body), vals);
    }

    #[test]
    fn test_string_array_bare_elements() {
        assert_eq!(
            parse_string_array("{aaa, bbb}"),
            vec!["aaa".to_string(), "bbb".to_string()]
        );
    }

    #[test]
    fn test_sql_quote_doubles_embedded_quotes() {
        let vals = vec!["it's".to_string()];
        let lit = string_array_literal(&vals);
        assert!(lit.contains("it''s"), "single quote must be doubled: {}", lit);
    }
}
