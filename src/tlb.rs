//! Translation buffer
//!
//! Bidirectional map between in-memory atom identity and persistent UUID,
//! plus the monotonic UUID allocator. This is the only place where the two
//! identity domains are reconciled; the storage engine owns one instance
//! and the owning atomspace may attach its table as a resolver so that the
//! buffer always holds table-canonical handles.

use crate::atomtable::{AtomTable, Handle};
use crate::types::{Uuid, INVALID_UUID};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Tlb {
    /// Next UUID to issue; 0 is the invalid sentinel, so allocation starts at 1
    next: AtomicU64,
    uuid_to_atom: DashMap<u64, Handle>,
    atom_to_uuid: DashMap<Handle, u64>,
    resolver: RwLock<Option<Arc<AtomTable>>>,
}

impl Tlb {
    pub fn new() -> Self {
        Tlb {
            next: AtomicU64::new(1),
            uuid_to_atom: DashMap::new(),
            atom_to_uuid: DashMap::new(),
            resolver: RwLock::new(None),
        }
    }

    /// Attach the atom table whose handles are canonical
    pub fn set_resolver(&self, table: Arc<AtomTable>) {
        *self.resolver.write() = Some(table);
    }

    /// Detach the resolver if it is the given table
    pub fn clear_resolver(&self, table: &Arc<AtomTable>) {
        let mut guard = self.resolver.write();
        if let Some(cur) = guard.as_ref() {
            if Arc::ptr_eq(cur, table) {
                *guard = None;
            }
        }
    }

    fn canonical(&self, h: &Handle) -> Handle {
        if let Some(table) = self.resolver.read().as_ref() {
            if let Some(c) = table.get_handle(h) {
                return c;
            }
        }
        h.clone()
    }

    /// Register an atom. With the invalid sentinel as `hint` a fresh UUID
    /// is allocated; otherwise the given UUID is recorded (and the
    /// allocator advanced past it, so it can never be reissued).
    /// Idempotent: an already-registered atom keeps its UUID.
    pub fn add_atom(&self, h: &Handle, hint: Uuid) -> Uuid {
        use dashmap::mapref::entry::Entry;
        let canonical = self.canonical(h);
        match self.atom_to_uuid.entry(canonical.clone()) {
            Entry::Occupied(e) => Uuid::new(*e.get()),
            Entry::Vacant(v) => {
                let uuid = if hint.is_valid() {
                    self.reserve_upto(hint.as_u64());
                    hint.as_u64()
                } else {
                    self.next.fetch_add(1, Ordering::SeqCst)
                };
                v.insert(uuid);
                self.uuid_to_atom.insert(uuid, canonical);
                Uuid::new(uuid)
            }
        }
    }

    /// The mapped atom, or None
    pub fn get_atom(&self, uuid: Uuid) -> Option<Handle> {
        self.uuid_to_atom.get(&uuid.as_u64()).map(|e| e.value().clone())
    }

    /// The mapped UUID, or the invalid sentinel
    pub fn get_uuid(&self, h: &Handle) -> Uuid {
        self.atom_to_uuid
            .get(h)
            .map(|e| Uuid::new(*e.value()))
            .unwrap_or(INVALID_UUID)
    }

    /// Unlink both directions
    pub fn remove_atom(&self, h: &Handle) {
        if let Some((_, uuid)) = self.atom_to_uuid.remove(h) {
            self.uuid_to_atom.remove(&uuid);
        }
    }

    /// Ensure the allocator's next value exceeds `n`
    pub fn reserve_upto(&self, n: u64) {
        let mut cur = self.next.load(Ordering::SeqCst);
        while cur <= n {
            match self.next.compare_exchange(
                cur,
                n + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Largest UUID the allocator has handed out or reserved past
    pub fn max_uuid(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - 1
    }

    /// Number of atoms currently mapped
    pub fn len(&self) -> usize {
        self.atom_to_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atom_to_uuid.is_empty()
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Tlb::new()
    }
}
