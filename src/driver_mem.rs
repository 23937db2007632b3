//! In-memory driver
//!
//! Executes the closed SQL dialect the storage engine emits against plain
//! in-process tables, enforcing the same uniqueness and foreign-key
//! constraints the real schema declares. Databases are process-global and
//! looked up by name (`mem://name`), so several pooled connections -- and
//! several storage instances in one test -- observe the same tables.
//!
//! This is not a SQL engine. Statements outside the engine's dialect are
//! rejected, which is a feature: it keeps the driver honest as a test
//! double for the real backends.

use crate::driver::{Connection, RecordSet, TextRecordSet, TextRow};
use crate::error::{Result, StoreError};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<MemDb>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Row as stored: (column, text value) pairs in insertion order
type Row = Vec<(String, String)>;

fn col<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    row.iter()
        .find(|(c, _)| c == name)
        .map(|(_, v)| v.as_str())
}

fn col_u64(row: &Row, name: &str) -> Option<u64> {
    col(row, name).and_then(|v| v.trim().parse().ok())
}

/// Parse an array literal body `{1, 2, 3}` into ids
fn parse_id_array(text: &str) -> Vec<u64> {
    text.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|t| t.trim().parse().ok())
        .collect()
}

#[derive(Default)]
struct Tables {
    atoms: BTreeMap<u64, Row>,
    node_index: HashMap<(i64, String), u64>,
    link_index: HashMap<(i64, Vec<u64>), u64>,
    values: BTreeMap<u64, Row>,
    valuations: BTreeMap<(u64, u64), Row>,
    spaces: BTreeMap<u64, u64>,
    typecodes: BTreeMap<i64, String>,
    backups: HashMap<String, Vec<Row>>,
}

/// One named in-memory database
pub struct MemDb {
    tables: Mutex<Tables>,
    /// BEGIN…COMMIT blocks mutually exclude, like real transactions do
    txn_held: Mutex<bool>,
    txn_free: Condvar,
}

impl MemDb {
    fn shared(name: &str) -> Arc<MemDb> {
        let mut registry = REGISTRY.lock();
        registry
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemDb {
                    tables: Mutex::new(Tables::default()),
                    txn_held: Mutex::new(false),
                    txn_free: Condvar::new(),
                })
            })
            .clone()
    }

    /// Drop a named database from the registry (test isolation helper)
    pub fn forget(name: &str) {
        REGISTRY.lock().remove(name);
    }
}

/// Connection to an in-memory database
pub struct MemConnection {
    db: Arc<MemDb>,
    in_txn: bool,
}

impl MemConnection {
    /// `mem://name` or `mem:name`; the name keys the global registry
    pub fn open(uri: &str) -> Result<MemConnection> {
        let name = uri
            .trim_start_matches("mem")
            .trim_start_matches(':')
            .trim_start_matches('/');
        if name.is_empty() {
            return Err(StoreError::Config(uri.to_string()));
        }
        Ok(MemConnection {
            db: MemDb::shared(name),
            in_txn: false,
        })
    }

    fn begin(&mut self) {
        if self.in_txn {
            return;
        }
        let mut held = self.db.txn_held.lock();
        while *held {
            self.db.txn_free.wait(&mut held);
        }
        *held = true;
        self.in_txn = true;
    }

    fn end_txn(&mut self) {
        if !self.in_txn {
            return;
        }
        *self.db.txn_held.lock() = false;
        self.db.txn_free.notify_one();
        self.in_txn = false;
    }
}

impl Connection for MemConnection {
    fn exec(&mut self, sql: &str) -> Result<Box<dyn RecordSet>> {
        let sql = sql.trim().trim_end_matches(';').trim();
        match sql
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase()
            .as_str()
        {
            "BEGIN" => {
                self.begin();
                return Ok(Box::new(TextRecordSet::new()));
            }
            "COMMIT" | "ROLLBACK" => {
                self.end_txn();
                return Ok(Box::new(TextRecordSet::new()));
            }
            _ => {}
        }
        let mut tables = self.db.tables.lock();
        execute(&mut tables, sql).map(|rs| Box::new(rs) as Box<dyn RecordSet>)
    }

    fn connected(&mut self) -> bool {
        true
    }
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        self.end_txn();
    }
}

// ---------------------------------------------------------------------------
// Literal scanning
// ---------------------------------------------------------------------------

/// Scan one literal starting at `pos`; returns (unquoted value, next pos).
///
/// Forms: dollar-tag quoted `$tag$...$tag$`, single-quoted with `''`
/// escaping, or a bare token ending at `,`, `)` or whitespace.
fn scan_literal(s: &str, pos: usize) -> Result<(String, usize)> {
    let bytes = s.as_bytes();
    let mut i = pos;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return Err(StoreError::Driver(format!("expected literal in: {}", s)));
    }
    match bytes[i] {
        b'$' => {
            let close = s[i + 1..]
                .find('$')
                .ok_or_else(|| StoreError::Driver(format!("unterminated dollar tag: {}", s)))?;
            let tag = &s[i..i + close + 2];
            let body_start = i + tag.len();
            let end = s[body_start..]
                .find(tag)
                .ok_or_else(|| StoreError::Driver(format!("unterminated dollar quote: {}", s)))?;
            let value = s[body_start..body_start + end].to_string();
            Ok((value, body_start + end + tag.len()))
        }
        b'\'' => {
            let mut value = String::new();
            let mut j = i + 1;
            loop {
                match s[j..].find('\'') {
                    None => {
                        return Err(StoreError::Driver(format!("unterminated string: {}", s)))
                    }
                    Some(q) => {
                        value.push_str(&s[j..j + q]);
                        j += q + 1;
                        // A doubled quote is an escaped quote, keep going.
                        if bytes.get(j) == Some(&b'\'') {
                            value.push('\'');
                            j += 1;
                        } else {
                            return Ok((value, j));
                        }
                    }
                }
            }
        }
        _ => {
            let mut j = i;
            while j < bytes.len()
                && !bytes[j].is_ascii_whitespace()
                && bytes[j] != b','
                && bytes[j] != b')'
            {
                j += 1;
            }
            Ok((s[i..j].to_string(), j))
        }
    }
}

/// Skip whitespace, then expect and consume the given character
fn expect_char(s: &str, pos: usize, c: char) -> Result<usize> {
    let bytes = s.as_bytes();
    let mut i = pos;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == c as u8 {
        Ok(i + 1)
    } else {
        Err(StoreError::Driver(format!(
            "expected '{}' at byte {} of: {}",
            c, i, s
        )))
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

enum Pred {
    Eq(String, String),
    Gt(String, u64),
    Le(String, u64),
    /// `outgoing @> ARRAY[CAST(n AS BIGINT)]`
    Contains(u64),
}

/// Parse a conjunction of predicates. Literals are scanned, not split on
/// " AND ", so quoted payloads containing the word are safe.
fn parse_where(s: &str) -> Result<Vec<Pred>> {
    let mut preds = Vec::new();
    let mut i = 0;
    let bytes = s.as_bytes();
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        let column = s[start..i].to_string();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if s[i..].starts_with("@>") {
            i += 2;
            let open = s[i..]
                .find('[')
                .ok_or_else(|| StoreError::Driver(format!("malformed ARRAY in: {}", s)))?;
            i += open + 1;
            let close = s[i..]
                .find(']')
                .ok_or_else(|| StoreError::Driver(format!("malformed ARRAY in: {}", s)))?;
            let inner = &s[i..i + close];
            let digits: String = inner.chars().filter(|c| c.is_ascii_digit()).collect();
            let id = digits
                .parse()
                .map_err(|_| StoreError::Driver(format!("malformed ARRAY member in: {}", s)))?;
            preds.push(Pred::Contains(id));
            i += close + 1;
        } else if s[i..].starts_with("<=") {
            i += 2;
            let (value, next) = scan_literal(s, i)?;
            let n = value
                .parse()
                .map_err(|_| StoreError::Driver(format!("non-numeric bound in: {}", s)))?;
            preds.push(Pred::Le(column, n));
            i = next;
        } else if s[i..].starts_with('>') {
            i += 1;
            let (value, next) = scan_literal(s, i)?;
            let n = value
                .parse()
                .map_err(|_| StoreError::Driver(format!("non-numeric bound in: {}", s)))?;
            preds.push(Pred::Gt(column, n));
            i = next;
        } else if s[i..].starts_with('=') {
            i += 1;
            let (value, next) = scan_literal(s, i)?;
            preds.push(Pred::Eq(column, value));
            i = next;
        } else {
            return Err(StoreError::Driver(format!(
                "unsupported operator after '{}' in: {}",
                column, s
            )));
        }
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if s[i..].len() >= 3 && s[i..i + 3].eq_ignore_ascii_case("AND") {
            i += 3;
        } else {
            break;
        }
    }
    Ok(preds)
}

fn row_matches(row: &Row, preds: &[Pred]) -> bool {
    preds.iter().all(|p| match p {
        Pred::Eq(column, want) => match col(row, column) {
            None => false,
            Some(have) => {
                if column == "outgoing" {
                    parse_id_array(have) == parse_id_array(want)
                } else if let (Ok(a), Ok(b)) = (have.parse::<i64>(), want.parse::<i64>()) {
                    a == b
                } else {
                    have == want
                }
            }
        },
        Pred::Gt(column, n) => col_u64(row, column).map(|v| v > *n).unwrap_or(false),
        Pred::Le(column, n) => col_u64(row, column).map(|v| v <= *n).unwrap_or(false),
        Pred::Contains(id) => col(row, "outgoing")
            .map(|o| parse_id_array(o).contains(id))
            .unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Statement execution
// ---------------------------------------------------------------------------

fn execute(tables: &mut Tables, sql: &str) -> Result<TextRecordSet> {
    let head: String = sql
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match head.as_str() {
        "" | "CREATE" | "VACUUM" => Ok(TextRecordSet::new()),
        "ALTER" => exec_rename(tables, sql),
        "INSERT" => exec_insert(tables, sql),
        "UPDATE" => exec_update(tables, sql),
        "DELETE" => exec_delete(tables, sql),
        "SELECT" => exec_select(tables, sql),
        _ => Err(StoreError::Driver(format!("unsupported statement: {}", sql))),
    }
}

fn table_name_after<'a>(sql: &'a str, keyword: &str) -> Result<&'a str> {
    let lower = sql.to_ascii_lowercase();
    let at = lower
        .find(&keyword.to_ascii_lowercase())
        .ok_or_else(|| StoreError::Driver(format!("malformed statement: {}", sql)))?;
    sql[at + keyword.len()..]
        .split_whitespace()
        .next()
        .map(|t| t.trim_matches(|c| c == '(' || c == ';'))
        .ok_or_else(|| StoreError::Driver(format!("malformed statement: {}", sql)))
}

fn exec_rename(tables: &mut Tables, sql: &str) -> Result<TextRecordSet> {
    let name = table_name_after(sql, "ALTER TABLE")?.to_ascii_lowercase();
    match name.as_str() {
        "atoms" => {
            let rows = std::mem::take(&mut tables.atoms).into_values().collect();
            tables.backups.insert("atoms".into(), rows);
            tables.node_index.clear();
            tables.link_index.clear();
        }
        "valuations" => {
            let rows = std::mem::take(&mut tables.valuations).into_values().collect();
            tables.backups.insert("valuations".into(), rows);
        }
        "values" => {
            let rows = std::mem::take(&mut tables.values).into_values().collect();
            tables.backups.insert("values".into(), rows);
        }
        "typecodes" => {
            let rows = std::mem::take(&mut tables.typecodes)
                .into_iter()
                .map(|(t, n)| vec![("type".to_string(), t.to_string()), ("typename".to_string(), n)])
                .collect();
            tables.backups.insert("typecodes".into(), rows);
        }
        other => {
            return Err(StoreError::Driver(format!("unknown table: {}", other)));
        }
    }
    Ok(TextRecordSet::new())
}

fn parse_insert(sql: &str) -> Result<(String, Vec<String>, Vec<String>)> {
    // Scan positionally: the table may itself be named "Values", so
    // searching for the VALUES keyword by substring would misfire.
    let lower = sql.to_ascii_lowercase();
    let bytes = sql.as_bytes();
    let mut i = lower
        .find("insert into")
        .ok_or_else(|| StoreError::Driver(format!("malformed INSERT: {}", sql)))?
        + "insert into".len();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let table_start = i;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    let table = sql[table_start..i].to_ascii_lowercase();
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }

    // Optional column list between the table name and VALUES.
    let mut columns = Vec::new();
    if bytes.get(i) == Some(&b'(') {
        let close = sql[i..]
            .find(')')
            .ok_or_else(|| StoreError::Driver(format!("malformed column list: {}", sql)))?
            + i;
        for c in sql[i + 1..close].split(',') {
            columns.push(c.trim().to_string());
        }
        i = close + 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
    }

    if !lower[i..].starts_with("values") {
        return Err(StoreError::Driver(format!("INSERT without VALUES: {}", sql)));
    }
    let mut pos = expect_char(sql, i + "values".len(), '(')?;
    let mut literals = Vec::new();
    loop {
        let (value, next) = scan_literal(sql, pos)?;
        literals.push(value);
        let bytes = sql.as_bytes();
        let mut i = next;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i) {
            Some(b',') => pos = i + 1,
            Some(b')') => break,
            _ => {
                return Err(StoreError::Driver(format!(
                    "malformed VALUES list: {}",
                    sql
                )))
            }
        }
    }
    Ok((table, columns, literals))
}

fn exec_insert(tables: &mut Tables, sql: &str) -> Result<TextRecordSet> {
    let (table, mut columns, literals) = parse_insert(sql)?;
    if columns.is_empty() {
        // Bare-VALUES inserts only occur for the Spaces table.
        if table == "spaces" {
            columns = vec!["space".to_string(), "parent".to_string()];
        } else {
            return Err(StoreError::Driver(format!(
                "INSERT without column list: {}",
                sql
            )));
        }
    }
    if columns.len() != literals.len() {
        return Err(StoreError::Driver(format!(
            "column/value arity mismatch: {}",
            sql
        )));
    }
    let row: Row = columns.into_iter().zip(literals).collect();

    match table.as_str() {
        "spaces" => {
            let space = col_u64(&row, "space")
                .ok_or_else(|| StoreError::Driver(format!("bad space id: {}", sql)))?;
            let parent = col_u64(&row, "parent").unwrap_or(space);
            tables.spaces.insert(space, parent);
        }
        "typecodes" => {
            let t: i64 = col(&row, "type")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| StoreError::Driver(format!("bad type code: {}", sql)))?;
            let name = col(&row, "typename").unwrap_or_default().to_string();
            if tables.typecodes.contains_key(&t)
                || tables.typecodes.values().any(|n| *n == name)
            {
                return Err(StoreError::Driver(
                    "duplicate key value violates unique constraint \"typecodes_type_key\""
                        .to_string(),
                ));
            }
            tables.typecodes.insert(t, name);
        }
        "atoms" => {
            let uuid = col_u64(&row, "uuid")
                .ok_or_else(|| StoreError::Driver(format!("bad uuid: {}", sql)))?;
            if tables.atoms.contains_key(&uuid) {
                return Err(StoreError::Driver(
                    "duplicate key value violates unique constraint \"atoms_pkey\"".to_string(),
                ));
            }
            let space = col_u64(&row, "space").unwrap_or(0);
            if !tables.spaces.contains_key(&space) {
                return Err(StoreError::Driver(format!(
                    "insert or update on table \"atoms\" violates foreign key constraint \
                     \"atoms_space_fkey\": space {} is not present",
                    space
                )));
            }
            let t: i64 = col(&row, "type").and_then(|v| v.parse().ok()).unwrap_or(-1);
            if let Some(name) = col(&row, "name") {
                let key = (t, name.to_string());
                if tables.node_index.contains_key(&key) {
                    return Err(StoreError::Driver(
                        "duplicate key value violates unique constraint \"atoms_type_name_key\""
                            .to_string(),
                    ));
                }
                tables.node_index.insert(key, uuid);
            }
            if let Some(out) = col(&row, "outgoing") {
                let key = (t, parse_id_array(out));
                if tables.link_index.contains_key(&key) {
                    return Err(StoreError::Driver(
                        "duplicate key value violates unique constraint \
                         \"atoms_type_outgoing_key\""
                            .to_string(),
                    ));
                }
                tables.link_index.insert(key, uuid);
            }
            tables.atoms.insert(uuid, row);
        }
        "values" => {
            let vuid = col_u64(&row, "vuid")
                .ok_or_else(|| StoreError::Driver(format!("bad vuid: {}", sql)))?;
            if tables.values.contains_key(&vuid) {
                return Err(StoreError::Driver(
                    "duplicate key value violates unique constraint \"values_pkey\"".to_string(),
                ));
            }
            tables.values.insert(vuid, row);
        }
        "valuations" => {
            let key = col_u64(&row, "key")
                .ok_or_else(|| StoreError::Driver(format!("bad key: {}", sql)))?;
            let atom = col_u64(&row, "atom")
                .ok_or_else(|| StoreError::Driver(format!("bad atom: {}", sql)))?;
            for (fk, id) in [("valuations_key_fkey", key), ("valuations_atom_fkey", atom)] {
                if !tables.atoms.contains_key(&id) {
                    return Err(StoreError::Driver(format!(
                        "insert or update on table \"valuations\" violates foreign key \
                         constraint \"{}\": atom {} is not present",
                        fk, id
                    )));
                }
            }
            if tables.valuations.contains_key(&(key, atom)) {
                return Err(StoreError::Driver(
                    "duplicate key value violates unique constraint \"valuations_key_atom_key\""
                        .to_string(),
                ));
            }
            tables.valuations.insert((key, atom), row);
        }
        other => {
            return Err(StoreError::Driver(format!("unknown table: {}", other)));
        }
    }
    Ok(TextRecordSet::new())
}

fn exec_update(tables: &mut Tables, sql: &str) -> Result<TextRecordSet> {
    let table = table_name_after(sql, "UPDATE")?.to_ascii_lowercase();
    if table != "atoms" {
        return Err(StoreError::Driver(format!("unsupported UPDATE: {}", sql)));
    }
    let lower = sql.to_ascii_lowercase();
    let set_at = lower
        .find(" set ")
        .ok_or_else(|| StoreError::Driver(format!("UPDATE without SET: {}", sql)))?;
    let where_at = lower
        .find(" where ")
        .ok_or_else(|| StoreError::Driver(format!("UPDATE without WHERE: {}", sql)))?;

    let mut assignments: Vec<(String, String)> = Vec::new();
    let clause = &sql[set_at + 5..where_at];
    let mut pos = 0;
    loop {
        let eq = match clause[pos..].find('=') {
            Some(e) => pos + e,
            None => break,
        };
        let column = clause[pos..eq].trim().trim_start_matches(',').trim().to_string();
        let (value, next) = scan_literal(clause, eq + 1)?;
        assignments.push((column, value));
        pos = next;
    }

    let preds = parse_where(&sql[where_at + 7..])?;
    for row in tables.atoms.values_mut() {
        if row_matches(row, &preds) {
            for (column, value) in &assignments {
                match row.iter_mut().find(|(c, _)| c == column) {
                    Some(slot) => slot.1 = value.clone(),
                    None => row.push((column.clone(), value.clone())),
                }
            }
        }
    }
    Ok(TextRecordSet::new())
}

fn exec_delete(tables: &mut Tables, sql: &str) -> Result<TextRecordSet> {
    let table = table_name_after(sql, "DELETE")?.to_ascii_lowercase();
    // "DELETE from <table>" -- the keyword FROM is the token we just read.
    let table = if table == "from" {
        table_name_after(sql, "DELETE FROM")?.to_ascii_lowercase()
    } else {
        table
    };
    let lower = sql.to_ascii_lowercase();
    let preds = match lower.find(" where ") {
        Some(at) => parse_where(&sql[at + 7..])?,
        None => Vec::new(),
    };
    match table.as_str() {
        "atoms" => {
            if preds.is_empty() {
                tables.atoms.clear();
                tables.node_index.clear();
                tables.link_index.clear();
            } else {
                let doomed: Vec<u64> = tables
                    .atoms
                    .iter()
                    .filter(|(_, row)| row_matches(row, &preds))
                    .map(|(uuid, _)| *uuid)
                    .collect();
                for uuid in doomed {
                    if let Some(row) = tables.atoms.remove(&uuid) {
                        let t: i64 =
                            col(&row, "type").and_then(|v| v.parse().ok()).unwrap_or(-1);
                        if let Some(name) = col(&row, "name") {
                            tables.node_index.remove(&(t, name.to_string()));
                        }
                        if let Some(out) = col(&row, "outgoing") {
                            tables.link_index.remove(&(t, parse_id_array(out)));
                        }
                    }
                }
            }
        }
        "values" => {
            if preds.is_empty() {
                tables.values.clear();
            } else {
                tables.values.retain(|_, row| !row_matches(row, &preds));
            }
        }
        "valuations" => {
            if preds.is_empty() {
                tables.valuations.clear();
            } else {
                tables.valuations.retain(|_, row| !row_matches(row, &preds));
            }
        }
        "spaces" => {
            tables.spaces.clear();
        }
        other => {
            return Err(StoreError::Driver(format!("unknown table: {}", other)));
        }
    }
    Ok(TextRecordSet::new())
}

fn exec_select(tables: &Tables, sql: &str) -> Result<TextRecordSet> {
    let lower = sql.to_ascii_lowercase();
    let from_at = lower
        .find(" from ")
        .ok_or_else(|| StoreError::Driver(format!("SELECT without FROM: {}", sql)))?;
    let projection: Vec<String> = sql["SELECT".len()..from_at]
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    let table = table_name_after(sql, " FROM ")?.to_ascii_lowercase();

    // The engine never combines WHERE with ORDER BY, so treating them as
    // mutually exclusive also keeps a quoted payload containing the words
    // "order by" from being misread as the clause.
    let where_at = lower.find(" where ");
    let order_at = if where_at.is_none() {
        lower.find(" order by ")
    } else {
        None
    };
    let preds = match where_at {
        Some(at) => parse_where(&sql[at + 7..])?,
        None => Vec::new(),
    };

    let mut rows: Vec<Row> = match table.as_str() {
        "atoms" => tables.atoms.values().cloned().collect(),
        "values" => tables.values.values().cloned().collect(),
        "valuations" => tables.valuations.values().cloned().collect(),
        "spaces" => tables
            .spaces
            .iter()
            .map(|(s, p)| {
                vec![
                    ("space".to_string(), s.to_string()),
                    ("parent".to_string(), p.to_string()),
                ]
            })
            .collect(),
        "typecodes" => tables
            .typecodes
            .iter()
            .map(|(t, n)| {
                vec![
                    ("type".to_string(), t.to_string()),
                    ("typename".to_string(), n.clone()),
                ]
            })
            .collect(),
        other => {
            return Err(StoreError::Driver(format!("unknown table: {}", other)));
        }
    };

    rows.retain(|row| row_matches(row, &preds));

    // Only the "ORDER BY <col> DESC LIMIT 1" shape is ever emitted.
    if let Some(at) = order_at {
        let column = sql[at + " order by ".len()..]
            .split_whitespace()
            .next()
            .unwrap_or("uuid")
            .to_string();
        rows.sort_by_key(|row| col_u64(row, &column).unwrap_or(0));
        rows = rows.into_iter().next_back().into_iter().collect();
    }

    let mut out = TextRecordSet::new();
    for row in rows {
        let mut text_row = TextRow::new();
        if projection.len() == 1 && projection[0] == "*" {
            for (name, value) in &row {
                text_row.push(name.clone(), value.clone());
            }
        } else {
            for want in &projection {
                if let Some(value) = col(&row, want) {
                    text_row.push(want.clone(), value.to_string());
                }
            }
        }
        out.push(text_row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_rows(rs: &mut Box<dyn RecordSet>) -> Vec<Vec<(String, String)>> {
        let mut rows = Vec::new();
        rs.foreach_row(&mut |r| {
            let mut cols = Vec::new();
            r.foreach_column(&mut |n, v| {
                cols.push((n.to_string(), v.to_string()));
                false
            });
            rows.push(cols);
            false
        });
        rows
    }

    fn conn(name: &str) -> MemConnection {
        MemDb::forget(name);
        let mut c = MemConnection::open(&format!("mem://{}", name)).unwrap();
        c.exec("INSERT INTO Spaces VALUES (1,1);").unwrap();
        c
    }

    #[test]
    fn test_insert_and_select_by_name() {
        let mut c = conn("mem_unit_1");
        c.exec("INSERT INTO Atoms (uuid, space, type, name, height, tv_type, stv_mean, stv_confidence, stv_count) VALUES (1, 1, 3, $ocp$cat$ocp$, 0, 1, 1, 0, 0);")
            .unwrap();
        let mut rs = c
            .exec("SELECT * FROM Atoms WHERE type = 3 AND name = $ocp$cat$ocp$;")
            .unwrap();
        let rows = all_rows(&mut rs);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains(&("uuid".to_string(), "1".to_string())));
    }

    #[test]
    fn test_unique_constraints() {
        let mut c = conn("mem_unit_2");
        c.exec("INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 1, 3, $ocp$cat$ocp$, 0);")
            .unwrap();
        let dup_pk = c.exec("INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 1, 3, $ocp$dog$ocp$, 0);");
        assert!(dup_pk.is_err(), "duplicate uuid must be rejected");
        let dup_name = c.exec("INSERT INTO Atoms (uuid, space, type, name, height) VALUES (2, 1, 3, $ocp$cat$ocp$, 0);");
        assert!(dup_name.is_err(), "duplicate (type, name) must be rejected");
    }

    #[test]
    fn test_space_foreign_key() {
        let mut c = conn("mem_unit_3");
        let missing = c.exec(
            "INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 9, 3, $ocp$x$ocp$, 0);",
        );
        assert!(missing.is_err(), "unknown space must be rejected");
        c.exec("INSERT INTO Spaces (space, parent) VALUES (9, 1);")
            .unwrap();
        c.exec(
            "INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 9, 3, $ocp$x$ocp$, 0);",
        )
        .unwrap();
    }

    #[test]
    fn test_incoming_set_containment() {
        let mut c = conn("mem_unit_4");
        c.exec("INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 1, 3, $ocp$a$ocp$, 0);").unwrap();
        c.exec("INSERT INTO Atoms (uuid, space, type, outgoing, height) VALUES (2, 1, 6, '{1}', 1);").unwrap();
        let mut rs = c
            .exec("SELECT * FROM Atoms WHERE outgoing @> ARRAY[CAST(1 AS BIGINT)];")
            .unwrap();
        assert_eq!(rs.row_count(), 1);
        let rows = all_rows(&mut rs);
        assert!(rows[0].contains(&("uuid".to_string(), "2".to_string())));
    }

    #[test]
    fn test_order_by_desc_limit() {
        let mut c = conn("mem_unit_5");
        for uuid in [4u64, 9, 2] {
            c.exec(&format!(
                "INSERT INTO Atoms (uuid, space, type, name, height) VALUES ({}, 1, 3, $ocp$n{}$ocp$, 0);",
                uuid, uuid
            ))
            .unwrap();
        }
        let mut rs = c
            .exec("SELECT uuid FROM Atoms ORDER BY uuid DESC LIMIT 1;")
            .unwrap();
        let rows = all_rows(&mut rs);
        assert_eq!(rows, vec![vec![("uuid".to_string(), "9".to_string())]]);
    }

    #[test]
    fn test_update_touches_only_matching_row() {
        let mut c = conn("mem_unit_6");
        c.exec("INSERT INTO Atoms (uuid, space, type, name, height, stv_mean) VALUES (1, 1, 3, $ocp$a$ocp$, 0, 0.25);").unwrap();
        c.exec("UPDATE Atoms SET stv_mean = 0.75, stv_count = 4 WHERE uuid = 1;")
            .unwrap();
        let mut rs = c.exec("SELECT * FROM Atoms WHERE uuid = 1;").unwrap();
        let rows = all_rows(&mut rs);
        assert!(rows[0].contains(&("stv_mean".to_string(), "0.75".to_string())));
        assert!(rows[0].contains(&("stv_count".to_string(), "4".to_string())));
    }

    #[test]
    fn test_quoted_literal_with_and_keyword() {
        let mut c = conn("mem_unit_7");
        c.exec("INSERT INTO Atoms (uuid, space, type, name, height) VALUES (1, 1, 3, $ocp$rock AND roll$ocp$, 0);").unwrap();
        let rs = c
            .exec("SELECT * FROM Atoms WHERE type = 3 AND name = $ocp$rock AND roll$ocp$;")
            .unwrap();
        assert_eq!(rs.row_count(), 1);
    }

    #[test]
    fn test_valuation_foreign_keys() {
        let mut c = conn("mem_unit_8");
        let orphan = c.exec("INSERT INTO Valuations (key, atom, type, floatvalue) VALUES (7, 8, 1, '{1}');");
        assert!(orphan.is_err(), "valuation on unknown atoms must be rejected");
    }
}
