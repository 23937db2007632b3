//! Atom storage engine
//!
//! Stores atoms and their attached values into the SQL backend and
//! reconstitutes them on demand, bridging the in-memory atom table and the
//! database through the pooled driver layer and the asynchronous write
//! queue.
//!
//! Atoms are identified by UUIDs, correlated with in-memory atoms via the
//! TLB. A row is created by the first successful INSERT for its UUID;
//! later stores of the same atom issue UPDATEs that touch only the truth
//! value columns. The immutable columns (type, name, outgoing, height)
//! are written exactly once.

use crate::atomtable::{Atom, AtomTable, Handle};
use crate::error::{Result, StoreError};
use crate::pool::{self, ConnectionPool, N_WRITERS};
use crate::queue::{QueueStats, WriteQueue};
use crate::response::{Response, Scratch};
use crate::tlb::Tlb;
use crate::typeinfo::{self, TypeRegistry};
use crate::typemap::TypeMap;
use crate::types::{
    TruthValue, TvKind, TypeId, Uuid, INVALID_UUID, MAX_LINK_ARITY, MAX_NODE_NAME_BYTES, NOTYPE,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Defensive cap on atom recursion (outgoing sets form a DAG, but a broken
/// backend row could cycle through the fetch path)
pub const RECURSION_LIMIT: usize = 512;

/// UUID range step for bulk scans; large result sets fragment driver-side
/// memory, so scans run in windows of this many ids
const UUID_STEP: u64 = 12003;

/// Pick a dollar-quote tag that does not occur in the payload
pub(crate) fn dollar_quote(name: &str) -> String {
    let mut tag = String::from("$ocp$");
    let mut n = 0u32;
    while name.contains(&tag) {
        n += 1;
        tag = format!("$ocp{}$", n);
    }
    format!("{}{}{}", tag, name, tag)
}

/// Incremental INSERT/UPDATE statement builder
pub(crate) struct StmtBuilder {
    table: &'static str,
    update: bool,
    first: bool,
    cols: String,
    vals: String,
}

impl StmtBuilder {
    pub fn insert(table: &'static str) -> StmtBuilder {
        StmtBuilder {
            table,
            update: false,
            first: true,
            cols: String::new(),
            vals: String::new(),
        }
    }

    pub fn update(table: &'static str) -> StmtBuilder {
        StmtBuilder {
            table,
            update: true,
            first: true,
            cols: String::new(),
            vals: String::new(),
        }
    }

    pub fn col(&mut self, name: &str, value: impl std::fmt::Display) {
        if self.update {
            if !self.first {
                self.cols.push_str(", ");
            }
            self.cols.push_str(name);
            self.cols.push_str(" = ");
            self.cols.push_str(&value.to_string());
        } else {
            if !self.first {
                self.cols.push_str(", ");
                self.vals.push_str(", ");
            }
            self.cols.push_str(name);
            self.vals.push_str(&value.to_string());
        }
        self.first = false;
    }

    /// Finish the statement; UPDATEs key on the given uuid
    pub fn finish(self, where_uuid: Option<u64>) -> String {
        if self.update {
            format!(
                "UPDATE {} SET {} WHERE uuid = {};",
                self.table,
                self.cols,
                where_uuid.unwrap_or(0)
            )
        } else {
            format!("INSERT INTO {} ({}) VALUES ({});", self.table, self.cols, self.vals)
        }
    }
}

/// Atom reassembled from a database row, before handle resolution
pub(crate) struct PseudoAtom {
    pub uuid: u64,
    pub type_id: TypeId,
    pub name: Option<String>,
    pub oset: Vec<u64>,
    pub tv: TruthValue,
}

#[derive(Default)]
struct IdCache {
    inited: bool,
    /// UUIDs known to exist as database rows
    present: HashSet<u64>,
    /// UUIDs some thread is currently first-inserting
    creating: HashSet<u64>,
    /// Space ids known to exist in the Spaces table
    spaces: HashSet<u64>,
}

/// Shared engine state; the public [`AtomStorage`] and the writer threads
/// both operate through this.
pub(crate) struct StorageInner {
    pub(crate) pool: ConnectionPool,
    pub(crate) tlb: Tlb,
    pub(crate) registry: Arc<TypeRegistry>,

    pub(crate) typemap_loaded: AtomicBool,
    pub(crate) typemap: Mutex<TypeMap>,

    id_create_mutex: Mutex<()>,
    id_cache: Mutex<IdCache>,
    id_created: Condvar,

    registered_table: Mutex<Option<Arc<AtomTable>>>,

    pub(crate) next_vuid: AtomicU64,
    bulk_load: AtomicBool,
    max_height: AtomicU64,

    load_count: AtomicU64,
    store_count: AtomicU64,
    num_get_nodes: AtomicU64,
    num_got_nodes: AtomicU64,
    num_get_links: AtomicU64,
    num_got_links: AtomicU64,
    num_get_insets: AtomicU64,
    num_get_inatoms: AtomicU64,
    num_node_inserts: AtomicU64,
    num_node_updates: AtomicU64,
    num_link_inserts: AtomicU64,
    num_link_updates: AtomicU64,
}

impl StorageInner {
    fn new(pool: ConnectionPool, registry: Arc<TypeRegistry>) -> StorageInner {
        StorageInner {
            pool,
            tlb: Tlb::new(),
            registry,
            typemap_loaded: AtomicBool::new(false),
            typemap: Mutex::new(TypeMap::new()),
            id_create_mutex: Mutex::new(()),
            id_cache: Mutex::new(IdCache::default()),
            id_created: Condvar::new(),
            registered_table: Mutex::new(None),
            next_vuid: AtomicU64::new(1),
            bulk_load: AtomicBool::new(false),
            max_height: AtomicU64::new(0),
            load_count: AtomicU64::new(0),
            store_count: AtomicU64::new(0),
            num_get_nodes: AtomicU64::new(0),
            num_got_nodes: AtomicU64::new(0),
            num_get_links: AtomicU64::new(0),
            num_got_links: AtomicU64::new(0),
            num_get_insets: AtomicU64::new(0),
            num_get_inatoms: AtomicU64::new(0),
            num_node_inserts: AtomicU64::new(0),
            num_node_updates: AtomicU64::new(0),
            num_link_inserts: AtomicU64::new(0),
            num_link_updates: AtomicU64::new(0),
        }
    }

    // -----------------------------------------------------------------
    // Connectivity and observed maxima

    pub(crate) fn connected(&self) -> bool {
        let mut conn = self.pool.pop();
        let alive = conn.connected();
        self.pool.push(conn);
        alive
    }

    fn max_observed(&self, sql: &str, pick: impl Fn(&Scratch) -> u64) -> Result<u64> {
        let mut rp = Response::new(&self.pool);
        let mut max = 0;
        rp.exec_each(sql, |row| {
            max = pick(row);
            false
        })?;
        Ok(max)
    }

    pub(crate) fn get_max_observed_uuid(&self) -> Result<u64> {
        self.max_observed("SELECT uuid FROM Atoms ORDER BY uuid DESC LIMIT 1;", |r| {
            r.uuid
        })
    }

    pub(crate) fn get_max_observed_vuid(&self) -> Result<u64> {
        self.max_observed("SELECT vuid FROM Values ORDER BY vuid DESC LIMIT 1;", |r| {
            r.vuid
        })
    }

    fn get_max_observed_height(&self) -> Result<u64> {
        self.max_observed(
            "SELECT height FROM Atoms ORDER BY height DESC LIMIT 1;",
            |r| r.height.max(0) as u64,
        )
    }

    pub(crate) fn reserve(&self) -> Result<()> {
        let max = self.get_max_observed_uuid()?;
        log::info!("reserving uuids up to {}", max);
        self.tlb.reserve_upto(max);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Type map bootstrap

    /// Reconcile the runtime type registry with the persisted TypeCodes
    /// table. Idempotent; one-shot under the typemap mutex.
    pub(crate) fn setup_typemap(&self) -> Result<()> {
        if self.typemap_loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut map = self.typemap.lock();
        if self.typemap_loaded.load(Ordering::Acquire) {
            return Ok(());
        }
        *map = TypeMap::new();

        let mut persisted: Vec<(i32, String)> = Vec::new();
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each("SELECT * FROM TypeCodes;", |row| {
                if let Some(tname) = &row.tname {
                    persisted.push((row.itype, tname.clone()));
                }
                false
            })?;
        }
        for (code, tname) in persisted {
            map.set_mapping(code as usize, &tname, &self.registry);
        }

        // Any runtime type not yet present by name claims its own code if
        // unused, else the smallest unused one, and is persisted.
        for t in 0..self.registry.len() as TypeId {
            if map.db_code(t).is_ok() {
                continue;
            }
            let tname = self
                .registry
                .name_of(t)
                .ok_or_else(|| StoreError::UnknownAtomType(format!("runtime type {}", t)))?;
            let mut sqid = t as usize;
            if map.db_code_in_use(sqid) {
                sqid = map.lowest_unused_code()?;
            }
            map.set_mapping(sqid, &tname, &self.registry);

            let mut rp = Response::new(&self.pool);
            rp.exec(&format!(
                "INSERT INTO TypeCodes (type, typename) VALUES ({}, '{}');",
                sqid, tname
            ))?;
        }

        self.typemap_loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn storing_code(&self, t: TypeId) -> Result<i32> {
        self.setup_typemap()?;
        self.typemap.lock().db_code(t)
    }

    // -----------------------------------------------------------------
    // UUID bookkeeping

    /// Build the client-side cache of all atom ids in storage, once.
    pub(crate) fn get_ids(&self) -> Result<()> {
        let mut cache = self.id_cache.lock();
        if cache.inited {
            return Ok(());
        }
        let max = self.get_max_observed_uuid()?;
        let mut rp = Response::new(&self.pool);
        let mut rec = 0;
        while rec <= max {
            let sql = format!(
                "SELECT uuid FROM Atoms WHERE uuid > {} AND uuid <= {};",
                rec,
                rec + UUID_STEP
            );
            rp.exec_each(&sql, |row| {
                cache.present.insert(row.uuid);
                false
            })?;
            rec += UUID_STEP;
        }

        cache.spaces.clear();
        rp.exec_each("SELECT space FROM Spaces;", |row| {
            cache.spaces.insert(row.space);
            false
        })?;
        cache.inited = true;
        Ok(())
    }

    /// Decide whether this thread must perform the first INSERT for the
    /// given uuid. Returns a held creation guard iff so; the guard is
    /// released by `add_id_to_cache` completing the insert. If another
    /// thread is mid-insert, waits for it to finish.
    fn maybe_create_id(&self, uuid: u64) -> Result<Option<MutexGuard<'_, ()>>> {
        let create_lock = self.id_create_mutex.lock();
        let mut cache = self.id_cache.lock();
        if cache.present.contains(&uuid) {
            return Ok(None);
        }
        if cache.creating.contains(&uuid) {
            drop(create_lock);
            loop {
                self.id_created.wait(&mut cache);
                if !cache.creating.contains(&uuid) {
                    if !cache.present.contains(&uuid) {
                        return Err(StoreError::IdCacheDesync(uuid));
                    }
                    return Ok(None);
                }
            }
        }
        cache.creating.insert(uuid);
        Ok(Some(create_lock))
    }

    /// Note that a uuid now exists as a row. Wakes any thread waiting on
    /// its creation.
    pub(crate) fn add_id_to_cache(&self, uuid: u64) {
        let mut cache = self.id_cache.lock();
        cache.present.insert(uuid);
        if cache.creating.remove(&uuid) {
            self.id_created.notify_all();
        }
    }

    /// First-insert failed: withdraw the creation claim so waiters do not
    /// stall forever.
    fn abort_create(&self, uuid: u64) {
        let mut cache = self.id_cache.lock();
        if cache.creating.remove(&uuid) {
            self.id_created.notify_all();
        }
    }

    pub(crate) fn reset_id_caches(&self) {
        let mut cache = self.id_cache.lock();
        cache.present.clear();
        cache.creating.clear();
        cache.spaces.clear();
        cache.spaces.insert(0);
        cache.spaces.insert(1);
        cache.inited = true;
        self.id_created.notify_all();
    }

    // -----------------------------------------------------------------
    // Spaces

    fn space_id(&self) -> u64 {
        self.registered_table
            .lock()
            .as_ref()
            .map(|t| t.uuid())
            .unwrap_or(1)
    }

    pub(crate) fn set_registered_table(&self, table: Option<Arc<AtomTable>>) {
        *self.registered_table.lock() = table;
    }

    /// Persist the (space, parent) chain for a table, walking parents first
    pub(crate) fn store_space_chain(&self, table: &AtomTable) -> Result<()> {
        let space = table.uuid();
        {
            let cache = self.id_cache.lock();
            if cache.spaces.contains(&space) {
                return Ok(());
            }
        }
        let parent = match table.environ() {
            Some(env) => {
                self.store_space_chain(&env)?;
                env.uuid()
            }
            None => 1,
        };
        self.id_cache.lock().spaces.insert(space);
        let mut rp = Response::new(&self.pool);
        rp.exec(&format!(
            "INSERT INTO Spaces (space, parent) VALUES ({}, {});",
            space, parent
        ))
    }

    // -----------------------------------------------------------------
    // Height

    /// Largest distance from this atom down to any node under it. Nodes
    /// are 0; a link is one more than its tallest outgoing atom.
    pub(crate) fn get_height(&self, h: &Handle, depth: usize) -> Result<u64> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        if h.is_node() {
            return Ok(0);
        }
        let mut maxd = 0;
        for child in h.outgoing() {
            maxd = maxd.max(self.get_height(child, depth + 1)?);
        }
        Ok(maxd + 1)
    }

    // -----------------------------------------------------------------
    // Store path

    /// Recursively store an atom and everything it points to, children
    /// before parents, values included. Returns the atom's height.
    pub(crate) fn do_store_atom(&self, h: &Handle) -> Result<u64> {
        self.do_store_atom_at(h, 0)
    }

    fn do_store_atom_at(&self, h: &Handle, depth: usize) -> Result<u64> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        if h.is_node() {
            self.do_store_single_atom(h, 0)?;
            self.store_atom_values(h)?;
            return Ok(0);
        }
        let mut lheight = 0;
        for child in h.outgoing() {
            lheight = lheight.max(self.do_store_atom_at(child, depth + 1)?);
        }
        let height = lheight + 1;
        self.do_store_single_atom(h, height)?;
        self.store_atom_values(h)?;
        Ok(height)
    }

    /// Store just this one atom and its truth value; outgoing atoms are
    /// not stored. First store INSERTs the immutable columns; every later
    /// store UPDATEs only the truth value.
    pub(crate) fn do_store_single_atom(&self, h: &Handle, height: u64) -> Result<()> {
        self.setup_typemap()?;

        let uuid = self.tlb.add_atom(h, INVALID_UUID);
        let guard = self.maybe_create_id(uuid.as_u64())?;
        let update = guard.is_none();

        if h.is_node() {
            if update {
                self.num_node_updates.fetch_add(1, Ordering::Relaxed);
            } else {
                self.num_node_inserts.fetch_add(1, Ordering::Relaxed);
            }
        } else if update {
            self.num_link_updates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.num_link_inserts.fetch_add(1, Ordering::Relaxed);
        }

        let outcome = (|| -> Result<()> {
            let mut stmt = if update {
                StmtBuilder::update("Atoms")
            } else {
                StmtBuilder::insert("Atoms")
            };

            if !update {
                stmt.col("uuid", uuid.as_u64());
                stmt.col("space", self.space_id());
                let db_type = self.typemap.lock().db_code(h.type_id())?;
                stmt.col("type", db_type);

                if let Some(name) = h.name() {
                    // The unique index on (type, name) rejects oversized
                    // rows; refuse rather than truncate.
                    if name.len() > MAX_NODE_NAME_BYTES {
                        return Err(StoreError::NameTooLong(name.len()));
                    }
                    stmt.col("name", dollar_quote(name));
                    stmt.col("height", 0);
                } else {
                    self.max_height.fetch_max(height, Ordering::Relaxed);
                    stmt.col("height", height);
                    // Same story for the unique index on (type, outgoing).
                    if h.arity() > MAX_LINK_ARITY {
                        return Err(StoreError::ArityTooLarge(h.arity()));
                    }
                    stmt.col("outgoing", self.oset_to_string(h.outgoing())?);
                }
            }

            let tv = h.tv();
            stmt.col("tv_type", tv.kind.wire_code());
            stmt.col("stv_mean", tv.mean);
            stmt.col("stv_confidence", tv.confidence);
            stmt.col("stv_count", tv.count);

            let sql = stmt.finish(update.then_some(uuid.as_u64()));
            let mut rp = Response::new(&self.pool);
            if let Err(e) = rp.exec(&sql) {
                if !e.is_driver() {
                    return Err(e);
                }
                // The likely cause is an unknown space id: store the
                // space chain and retry once.
                let table = self.registered_table.lock().clone();
                if let Some(table) = table {
                    self.store_space_chain(&table)?;
                }
                rp.exec(&sql)?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                self.add_id_to_cache(uuid.as_u64());
                self.store_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                if !update {
                    self.abort_create(uuid.as_u64());
                }
                Err(e)
            }
        }
    }

    /// Render an outgoing set as an array literal of uuids
    pub(crate) fn oset_to_string(&self, outgoing: &[Handle]) -> Result<String> {
        let mut s = String::from("'{");
        for (i, h) in outgoing.iter().enumerate() {
            if i > 0 {
                s.push_str(", ");
            }
            s.push_str(&self.get_uuid_for(h)?.to_string());
        }
        s.push_str("}'");
        Ok(s)
    }

    /// UUID for an atom: the TLB's answer, else the database's, else a
    /// freshly issued one.
    fn get_uuid_for(&self, h: &Handle) -> Result<Uuid> {
        let uuid = self.tlb.get_uuid(h);
        if uuid.is_valid() {
            return Ok(uuid);
        }
        let found = match h.name() {
            Some(name) => self.do_get_node(h.type_id(), name)?,
            None => self.do_get_link(h.type_id(), h.outgoing())?,
        };
        if found.is_some() {
            // The lookup registered the atom in the TLB.
            return Ok(self.tlb.get_uuid(h));
        }
        Ok(self.tlb.add_atom(h, INVALID_UUID))
    }

    // -----------------------------------------------------------------
    // Load path

    /// Reassemble a pseudo atom from a filled scratch record
    pub(crate) fn make_atom(&self, row: &Scratch, uuid: u64) -> Result<PseudoAtom> {
        let type_id = self.typemap.lock().runtime_type(row.itype);
        if type_id == NOTYPE {
            let name = self
                .typemap
                .lock()
                .typename(row.itype)
                .unwrap_or("?")
                .to_string();
            return Err(StoreError::UnknownAtomType(name));
        }

        let kind = TvKind::from_wire_code(row.tv_type)
            .ok_or(StoreError::UnknownTruthType(row.tv_type))?;
        let tv = TruthValue {
            kind,
            mean: row.mean,
            confidence: row.confidence,
            count: row.count,
        };

        let mut pseudo = PseudoAtom {
            uuid,
            type_id,
            name: None,
            oset: Vec::new(),
            tv,
        };
        if self.registry.is_node(type_id) {
            pseudo.name = Some(row.name.clone().unwrap_or_default());
        } else {
            pseudo.oset = crate::values::parse_id_array(row.outlist.as_deref().unwrap_or("{}"));
        }

        let loaded = self.load_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.bulk_load.load(Ordering::Relaxed) && loaded % 10000 == 0 {
            log::info!("loaded {} atoms", loaded);
        }
        self.add_id_to_cache(uuid);
        Ok(pseudo)
    }

    /// Fetch one atom row by the given query; None when there is no row
    fn do_get_atom(&self, sql: &str) -> Result<Option<PseudoAtom>> {
        let mut found: Option<Scratch> = None;
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each(sql, |row| {
                found = Some(row.clone());
                true
            })?;
        }
        match found {
            None => Ok(None),
            Some(row) => Ok(Some(self.make_atom(&row, row.uuid)?)),
        }
    }

    /// Fetch a row by uuid; errors when the row does not exist
    pub(crate) fn pet_atom(&self, uuid: u64) -> Result<PseudoAtom> {
        self.setup_typemap()?;
        let sql = format!("SELECT * FROM Atoms WHERE uuid = {};", uuid);
        self.do_get_atom(&sql)?
            .ok_or_else(|| StoreError::EmptyResult(sql))
    }

    /// Turn a pseudo atom into a live handle. Links of unknown provenance
    /// may arrive before their children; unresolved outgoing uuids are
    /// fetched recursively.
    pub(crate) fn get_recursive_if_not_exists(
        &self,
        pseudo: PseudoAtom,
        depth: usize,
    ) -> Result<Handle> {
        if depth > RECURSION_LIMIT {
            return Err(StoreError::RecursionDepth(RECURSION_LIMIT));
        }
        if self.registry.is_node(pseudo.type_id) {
            let node = Atom::node_with_tv(
                pseudo.type_id,
                pseudo.name.unwrap_or_default(),
                pseudo.tv,
            );
            let uuid = self.tlb.add_atom(&node, Uuid::new(pseudo.uuid));
            return Ok(self.tlb.get_atom(uuid).unwrap_or(node));
        }
        let mut resolved = Vec::with_capacity(pseudo.oset.len());
        for idu in &pseudo.oset {
            if let Some(h) = self.tlb.get_atom(Uuid::new(*idu)) {
                resolved.push(h);
                continue;
            }
            let child = self.pet_atom(*idu)?;
            resolved.push(self.get_recursive_if_not_exists(child, depth + 1)?);
        }
        let link = Atom::link_with_tv(pseudo.type_id, resolved, pseudo.tv);
        let uuid = self.tlb.add_atom(&link, Uuid::new(pseudo.uuid));
        Ok(self.tlb.get_atom(uuid).unwrap_or(link))
    }

    /// Node lookup by (type, name); registers the handle in the TLB
    pub(crate) fn do_get_node(&self, t: TypeId, name: &str) -> Result<Option<Handle>> {
        let db_type = self.storing_code(t)?;
        let sql = format!(
            "SELECT * FROM Atoms WHERE type = {} AND name = {};",
            db_type,
            dollar_quote(name)
        );
        self.num_get_nodes.fetch_add(1, Ordering::Relaxed);
        let pseudo = match self.do_get_atom(&sql)? {
            None => return Ok(None),
            Some(p) => p,
        };
        self.num_got_nodes.fetch_add(1, Ordering::Relaxed);

        let node = Atom::node_with_tv(t, name, pseudo.tv);
        let uuid = self.tlb.add_atom(&node, Uuid::new(pseudo.uuid));
        let canonical = self.tlb.get_atom(uuid).unwrap_or(node);
        canonical.set_tv(pseudo.tv);
        Ok(Some(canonical))
    }

    /// Link lookup by (type, outgoing); registers the handle in the TLB
    pub(crate) fn do_get_link(&self, t: TypeId, outgoing: &[Handle]) -> Result<Option<Handle>> {
        let db_type = self.storing_code(t)?;
        let sql = format!(
            "SELECT * FROM Atoms WHERE type = {} AND outgoing = {};",
            db_type,
            self.oset_to_string(outgoing)?
        );
        self.num_get_links.fetch_add(1, Ordering::Relaxed);
        let pseudo = match self.do_get_atom(&sql)? {
            None => return Ok(None),
            Some(p) => p,
        };
        self.num_got_links.fetch_add(1, Ordering::Relaxed);

        let link = Atom::link_with_tv(t, outgoing.to_vec(), pseudo.tv);
        let uuid = self.tlb.add_atom(&link, Uuid::new(pseudo.uuid));
        let canonical = self.tlb.get_atom(uuid).unwrap_or(link);
        canonical.set_tv(pseudo.tv);
        Ok(Some(canonical))
    }

    /// All links that reference the given atom in their outgoing set
    pub(crate) fn get_incoming_set(&self, h: &Handle) -> Result<Vec<Handle>> {
        self.setup_typemap()?;
        let uuid = self.tlb.add_atom(h, INVALID_UUID);
        // The cast matters: without it the backend refuses to match a
        // bigint[] column against an integer array.
        let sql = format!(
            "SELECT * FROM Atoms WHERE outgoing @> ARRAY[CAST({} AS BIGINT)];",
            uuid.as_u64()
        );
        self.num_get_insets.fetch_add(1, Ordering::Relaxed);

        let mut rows = Vec::new();
        {
            let mut rp = Response::new(&self.pool);
            rp.exec_each(&sql, |row| {
                rows.push(row.clone());
                false
            })?;
        }
        let mut iset = Vec::with_capacity(rows.len());
        for row in rows {
            let pseudo = self.make_atom(&row, row.uuid)?;
            iset.push(self.get_recursive_if_not_exists(pseudo, 0)?);
        }
        self.num_get_inatoms
            .fetch_add(iset.len() as u64, Ordering::Relaxed);
        Ok(iset)
    }

    // -----------------------------------------------------------------
    // Bulk operations

    /// Load every atom in storage into the table. Iterates heights from
    /// the bottom up, so an atom's outgoing set is always present before
    /// the atom itself; within each height, scans uuid windows.
    pub(crate) fn load_all(&self, table: &AtomTable) -> Result<()> {
        let max_nrec = self.get_max_observed_uuid()?;
        self.tlb.reserve_upto(max_nrec);
        log::info!("max observed uuid is {}", max_nrec);
        self.load_count.store(0, Ordering::Relaxed);
        let max_height = self.get_max_observed_height()?;
        log::info!("max height is {}", max_height);
        self.bulk_load.store(true, Ordering::Relaxed);
        self.setup_typemap()?;

        let mut rp = Response::new(&self.pool);
        for hei in 0..=max_height {
            let before = self.load_count.load(Ordering::Relaxed);
            let mut rec = 0;
            while rec <= max_nrec {
                let sql = format!(
                    "SELECT * FROM Atoms WHERE height = {} AND uuid > {} AND uuid <= {};",
                    hei,
                    rec,
                    rec + UUID_STEP
                );
                let mut rows = Vec::new();
                rp.exec_each(&sql, |row| {
                    rows.push(row.clone());
                    false
                })?;
                for row in rows {
                    let pseudo = self.make_atom(&row, row.uuid)?;
                    let atom = self.get_recursive_if_not_exists(pseudo, 0)?;
                    let h = table.add(atom);
                    // Force TLB resolution so later removes work.
                    self.tlb.add_atom(&h, INVALID_UUID);
                }
                rec += UUID_STEP;
            }
            log::info!(
                "loaded {} atoms at height {}",
                self.load_count.load(Ordering::Relaxed) - before,
                hei
            );
        }
        self.bulk_load.store(false, Ordering::Relaxed);
        log::info!(
            "finished loading {} atoms in total",
            self.load_count.load(Ordering::Relaxed)
        );
        table.barrier();
        Ok(())
    }

    /// Load all atoms of one type, skipping atoms the TLB already knows,
    /// so the truth values already in the table are not clobbered.
    pub(crate) fn load_type(&self, table: &AtomTable, t: TypeId) -> Result<()> {
        let max_nrec = self.get_max_observed_uuid()?;
        self.tlb.reserve_upto(max_nrec);
        log::debug!("load_type: max observed uuid is {}", max_nrec);
        self.load_count.store(0, Ordering::Relaxed);

        // Nodes all sit at height zero; links need the full sweep.
        let max_height = if self.registry.is_node(t) {
            0
        } else {
            self.get_max_observed_height()?
        };
        log::debug!("load_type: max height is {}", max_height);
        let db_type = self.storing_code(t)?;

        let mut rp = Response::new(&self.pool);
        for hei in 0..=max_height {
            let before = self.load_count.load(Ordering::Relaxed);
            let mut rec = 0;
            while rec <= max_nrec {
                let sql = format!(
                    "SELECT * FROM Atoms WHERE type = {} AND height = {} AND uuid > {} AND uuid <= {};",
                    db_type,
                    hei,
                    rec,
                    rec + UUID_STEP
                );
                let mut rows = Vec::new();
                rp.exec_each(&sql, |row| {
                    rows.push(row.clone());
                    false
                })?;
                for row in rows {
                    if self.tlb.get_atom(Uuid::new(row.uuid)).is_some() {
                        continue;
                    }
                    let pseudo = self.make_atom(&row, row.uuid)?;
                    let atom = self.get_recursive_if_not_exists(pseudo, 0)?;
                    if table.get_handle(&atom).is_none() {
                        table.add(atom);
                    }
                }
                rec += UUID_STEP;
            }
            log::debug!(
                "load_type: loaded {} atoms of db type {} at height {}",
                self.load_count.load(Ordering::Relaxed) - before,
                db_type,
                hei
            );
        }
        log::debug!(
            "load_type: finished loading {} atoms in total",
            self.load_count.load(Ordering::Relaxed)
        );
        table.barrier();
        Ok(())
    }

    /// Store every atom in the table, values included
    pub(crate) fn store_all(&self, table: &AtomTable) -> Result<()> {
        self.max_height.store(0, Ordering::Relaxed);
        self.store_count.store(0, Ordering::Relaxed);

        self.get_ids()?;
        log::info!("max uuid is {}", self.tlb.max_uuid());
        self.setup_typemap()?;
        self.store_space_chain(table)?;

        let mut handles = Vec::new();
        table.foreach_handle_by_type(|h| handles.push(h.clone()), typeinfo::ATOM, true);
        for h in handles {
            let height = self.get_height(&h, 0)?;
            self.do_store_single_atom(&h, height)?;
            self.store_atom_values(&h)?;
            let stored = self.store_count.load(Ordering::Relaxed);
            if stored % 1000 == 0 {
                log::info!("stored {} atoms", stored);
            }
        }

        let mut rp = Response::new(&self.pool);
        rp.exec("VACUUM ANALYZE Atoms;")?;
        log::info!(
            "finished storing {} atoms total",
            self.store_count.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

/// Snapshot of the engine's counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    pub load_count: u64,
    pub store_count: u64,
    pub num_get_nodes: u64,
    pub num_got_nodes: u64,
    pub num_get_links: u64,
    pub num_got_links: u64,
    pub num_get_insets: u64,
    pub num_get_inatoms: u64,
    pub num_node_inserts: u64,
    pub num_node_updates: u64,
    pub num_link_inserts: u64,
    pub num_link_updates: u64,
    pub queue: QueueStats,
    pub pool_free: usize,
    pub pool_capacity: usize,
    pub tlb_size: usize,
}

/// SQL-backed persistence engine for a typed hypergraph
///
/// The public faces of the four subsystems: UUID assignment through the
/// TLB, recursive content-addressed atom storage, the typed value store,
/// and the asynchronous write-back queue.
pub struct AtomStorage {
    inner: Arc<StorageInner>,
    queue: WriteQueue,
}

impl AtomStorage {
    /// Open a store for the given connection URI. `postgres://…` (or a
    /// leading `/`) selects the native driver, `odbc://…` the ODBC one,
    /// `mem://…` the in-memory driver; anything else is a config error.
    pub fn open(uri: &str, registry: Arc<TypeRegistry>) -> Result<AtomStorage> {
        let pool = ConnectionPool::open(uri, pool::default_pool_size())?;
        let inner = Arc::new(StorageInner::new(pool, registry));

        if inner.connected() {
            // A fresh database may not have its schema yet; these are
            // best-effort until create_tables() runs.
            match inner.get_max_observed_uuid() {
                Ok(max) => inner.tlb.reserve_upto(max),
                Err(e) => log::debug!("uuid reservation deferred: {}", e),
            }
            match inner.get_max_observed_vuid() {
                Ok(max) => inner.next_vuid.store(max + 1, Ordering::Relaxed),
                Err(e) => log::debug!("vuid reservation deferred: {}", e),
            }
        }

        let queue = WriteQueue::new(inner.clone(), N_WRITERS);
        Ok(AtomStorage { inner, queue })
    }

    /// True if a usable connection to the database exists. May block while
    /// all pooled connections are in use.
    pub fn connected(&self) -> bool {
        self.inner.connected()
    }

    /// Attach to an atomspace: its table becomes the TLB resolver and the
    /// space id recorded on new rows.
    pub fn register_with(&self, table: &Arc<AtomTable>) {
        self.inner.tlb.set_resolver(table.clone());
        self.inner.set_registered_table(Some(table.clone()));
    }

    pub fn unregister_with(&self, table: &Arc<AtomTable>) {
        self.inner.tlb.clear_resolver(table);
        self.inner.set_registered_table(None);
    }

    /// Store an atom, recursively, values included. Synchronous stores
    /// complete (and surface errors) before returning; asynchronous ones
    /// acknowledge at enqueue time and require [`flush_store_queue`] for
    /// client-side durability.
    ///
    /// [`flush_store_queue`]: AtomStorage::flush_store_queue
    pub fn store_atom(&self, h: &Handle, synchronous: bool) -> Result<()> {
        self.inner.get_ids()?;
        if synchronous {
            self.inner.do_store_atom(h)?;
            return Ok(());
        }
        self.queue.enqueue(h.clone());
        Ok(())
    }

    /// Drain the write queue: returns once every previously enqueued atom
    /// has been processed. This is a client-side fence only; see [`sync`]
    /// for a round-trip fence.
    ///
    /// [`sync`]: AtomStorage::sync
    pub fn flush_store_queue(&self) {
        self.queue.barrier();
    }

    /// Drain the write queue, then complete one server round-trip, so
    /// everything the queue acknowledged has been applied by the backend.
    pub fn sync(&self) -> Result<()> {
        self.queue.barrier();
        let mut rp = Response::new(&self.inner.pool);
        rp.exec("BEGIN;")?;
        rp.exec("COMMIT;")
    }

    /// Fetch the node with the given type and name, or None
    pub fn get_node(&self, t: TypeId, name: &str) -> Result<Option<Handle>> {
        let h = self.inner.do_get_node(t, name)?;
        if let Some(h) = &h {
            self.inner.get_atom_values(h)?;
        }
        Ok(h)
    }

    /// Fetch the link with the given type and outgoing set, or None
    pub fn get_link(&self, t: TypeId, outgoing: &[Handle]) -> Result<Option<Handle>> {
        let h = self.inner.do_get_link(t, outgoing)?;
        if let Some(h) = &h {
            self.inner.get_atom_values(h)?;
        }
        Ok(h)
    }

    /// Fetch an atom by uuid, or None
    pub fn get_atom(&self, uuid: Uuid) -> Result<Option<Handle>> {
        match self.inner.pet_atom(uuid.as_u64()) {
            Ok(pseudo) => {
                let h = self.inner.get_recursive_if_not_exists(pseudo, 0)?;
                self.inner.get_atom_values(&h)?;
                Ok(Some(h))
            }
            Err(StoreError::EmptyResult(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every link referencing the given atom in its outgoing set
    pub fn get_incoming_set(&self, h: &Handle) -> Result<Vec<Handle>> {
        self.inner.get_incoming_set(h)
    }

    /// Load the whole database into the table
    pub fn load(&self, table: &AtomTable) -> Result<()> {
        self.inner.load_all(table)
    }

    /// Load all atoms of one type into the table, skipping those present
    pub fn load_type(&self, table: &AtomTable, t: TypeId) -> Result<()> {
        self.inner.load_type(table, t)
    }

    /// Store every atom in the table
    pub fn store(&self, table: &AtomTable) -> Result<()> {
        self.inner.store_all(table)
    }

    /// Re-read the largest uuid in storage and fence the allocator past it
    pub fn reserve(&self) -> Result<()> {
        self.inner.reserve()
    }

    /// Largest uuid any row in storage carries
    pub fn get_max_observed_uuid(&self) -> Result<Uuid> {
        self.inner.get_max_observed_uuid().map(Uuid::new)
    }

    /// The translation buffer, for callers that manage registration
    pub fn tlb(&self) -> &Tlb {
        &self.inner.tlb
    }

    pub fn stats(&self) -> StorageStats {
        let inner = &self.inner;
        StorageStats {
            load_count: inner.load_count.load(Ordering::Relaxed),
            store_count: inner.store_count.load(Ordering::Relaxed),
            num_get_nodes: inner.num_get_nodes.load(Ordering::Relaxed),
            num_got_nodes: inner.num_got_nodes.load(Ordering::Relaxed),
            num_get_links: inner.num_get_links.load(Ordering::Relaxed),
            num_got_links: inner.num_got_links.load(Ordering::Relaxed),
            num_get_insets: inner.num_get_insets.load(Ordering::Relaxed),
            num_get_inatoms: inner.num_get_inatoms.load(Ordering::Relaxed),
            num_node_inserts: inner.num_node_inserts.load(Ordering::Relaxed),
            num_node_updates: inner.num_node_updates.load(Ordering::Relaxed),
            num_link_inserts: inner.num_link_inserts.load(Ordering::Relaxed),
            num_link_updates: inner.num_link_updates.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            pool_free: inner.pool.free(),
            pool_capacity: inner.pool.capacity(),
            tlb_size: inner.tlb.len(),
        }
    }

    /// Log the engine's counters
    pub fn print_stats(&self) {
        let s = self.stats();
        log::info!(
            "sql-stats: total loads = {} total stores = {}",
            s.load_count,
            s.store_count
        );
        log::info!(
            "num_get_nodes={} num_got_nodes={} num_get_links={} num_got_links={}",
            s.num_get_nodes,
            s.num_got_nodes,
            s.num_get_links,
            s.num_got_links
        );
        log::info!(
            "num_get_insets={} num_get_inatoms={}",
            s.num_get_insets,
            s.num_get_inatoms
        );
        log::info!(
            "node inserts={} updates={}; link inserts={} updates={}",
            s.num_node_inserts,
            s.num_node_updates,
            s.num_link_inserts,
            s.num_link_updates
        );
        log::info!(
            "write items={} flushes={} drains={} drain_msec={} slowest={} concurrent={}",
            s.queue.items,
            s.queue.flushes,
            s.queue.drains,
            s.queue.drain_msec,
            s.queue.drain_slowest_msec,
            s.queue.drain_concurrent
        );
        log::info!(
            "currently pending={} busy_writers={}",
            s.queue.pending,
            s.queue.busy_writers
        );
        log::info!(
            "conn_pool free={} of {}; tlb holds {} atoms",
            s.pool_free,
            s.pool_capacity,
            s.tlb_size
        );
    }

    pub(crate) fn inner(&self) -> &Arc<StorageInner> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dollar_quote_avoids_payload_collision() {
        assert_eq!(dollar_quote("cat"), "$ocp$cat$ocp$");
        let tricky = "end$ocp$start";
        let quoted = dollar_quote(tricky);
        assert!(quoted.starts_with("$ocp1$"));
        assert!(quoted.ends_with("$ocp1$"));
        assert_eq!(&quoted[6..quoted.len() - 6], tricky);
    }

    #[test]
    fn test_stmt_builder_insert() {
        let mut stmt = StmtBuilder::insert("Atoms");
        stmt.col("uuid", 5);
        stmt.col("type", 3);
        assert_eq!(
            stmt.finish(None),
            "INSERT INTO Atoms (uuid, type) VALUES (5, 3);"
        );
    }

    #[test]
    fn test_stmt_builder_update() {
        let mut stmt = StmtBuilder::update("Atoms");
        stmt.col("tv_type", 1);
        stmt.col("stv_mean", 0.5);
        assert_eq!(
            stmt.finish(Some(9)),
            "UPDATE Atoms SET tv_type = 1, stv_mean = 0.5 WHERE uuid = 9;"
        );
    }
}
