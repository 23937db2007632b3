//! Atoms and the in-memory atom table
//!
//! An atom is either a Node (typed, named) or a Link (typed, ordered
//! outgoing set of atoms). The AtomTable interns atoms so that there is
//! exactly one live handle per (type, name) or (type, outgoing) identity,
//! and indexes them by type for bulk traversal.

use crate::typeinfo::TypeRegistry;
use crate::types::{TruthValue, TypeId, Value};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Shared reference to an interned atom
pub type Handle = Arc<Atom>;

/// Node name or link outgoing set
#[derive(Debug)]
enum Payload {
    Name(String),
    Outgoing(Vec<Handle>),
}

/// A hypergraph atom
///
/// Identity is structural: two atoms are equal when they have the same type
/// and the same name (nodes) or element-wise equal outgoing sets (links).
/// The truth value and the attached values never participate in identity.
#[derive(Debug)]
pub struct Atom {
    type_id: TypeId,
    payload: Payload,
    tv: RwLock<TruthValue>,
    values: RwLock<HashMap<Handle, Value>>,
}

impl Atom {
    pub fn node(type_id: TypeId, name: impl Into<String>) -> Handle {
        Arc::new(Atom {
            type_id,
            payload: Payload::Name(name.into()),
            tv: RwLock::new(TruthValue::default()),
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn link(type_id: TypeId, outgoing: Vec<Handle>) -> Handle {
        Arc::new(Atom {
            type_id,
            payload: Payload::Outgoing(outgoing),
            tv: RwLock::new(TruthValue::default()),
            values: RwLock::new(HashMap::new()),
        })
    }

    pub fn node_with_tv(type_id: TypeId, name: impl Into<String>, tv: TruthValue) -> Handle {
        let h = Atom::node(type_id, name);
        h.set_tv(tv);
        h
    }

    pub fn link_with_tv(type_id: TypeId, outgoing: Vec<Handle>, tv: TruthValue) -> Handle {
        let h = Atom::link(type_id, outgoing);
        h.set_tv(tv);
        h
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn is_node(&self) -> bool {
        matches!(self.payload, Payload::Name(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.payload, Payload::Outgoing(_))
    }

    pub fn name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Name(n) => Some(n),
            Payload::Outgoing(_) => None,
        }
    }

    pub fn outgoing(&self) -> &[Handle] {
        match &self.payload {
            Payload::Name(_) => &[],
            Payload::Outgoing(o) => o,
        }
    }

    pub fn arity(&self) -> usize {
        self.outgoing().len()
    }

    pub fn tv(&self) -> TruthValue {
        *self.tv.read()
    }

    pub fn set_tv(&self, tv: TruthValue) {
        *self.tv.write() = tv;
    }

    /// Attach a value under a key atom, replacing any previous binding
    pub fn set_value(&self, key: Handle, value: Value) {
        self.values.write().insert(key, value);
    }

    pub fn get_value(&self, key: &Handle) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// Snapshot of all key/value bindings on this atom
    pub fn value_entries(&self) -> Vec<(Handle, Value)> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        if self.type_id != other.type_id {
            return false;
        }
        match (&self.payload, &other.payload) {
            (Payload::Name(a), Payload::Name(b)) => a == b,
            (Payload::Outgoing(a), Payload::Outgoing(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Atom {}

impl Hash for Atom {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        match &self.payload {
            Payload::Name(n) => {
                0u8.hash(state);
                n.hash(state);
            }
            Payload::Outgoing(o) => {
                1u8.hash(state);
                for h in o {
                    h.hash(state);
                }
            }
        }
    }
}

/// In-memory container of interned atoms
///
/// Uniqueness by (type, name) for nodes and (type, outgoing) for links
/// falls out of the structural atom identity. Each table carries a space
/// id and an optional parent table.
pub struct AtomTable {
    uuid: u64,
    parent: Option<Arc<AtomTable>>,
    atoms: DashMap<Handle, Handle>,
    by_type: DashMap<TypeId, Vec<Handle>>,
    registry: Arc<TypeRegistry>,
}

impl AtomTable {
    /// A root table; space id 1 matches the default Spaces row
    pub fn new(registry: Arc<TypeRegistry>) -> Arc<AtomTable> {
        AtomTable::with_uuid(registry, 1, None)
    }

    pub fn with_uuid(
        registry: Arc<TypeRegistry>,
        uuid: u64,
        parent: Option<Arc<AtomTable>>,
    ) -> Arc<AtomTable> {
        Arc::new(AtomTable {
            uuid,
            parent,
            atoms: DashMap::new(),
            by_type: DashMap::new(),
            registry,
        })
    }

    /// Space id of this table
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    /// Parent table, if this table was layered over another
    pub fn environ(&self) -> Option<Arc<AtomTable>> {
        self.parent.clone()
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Intern an atom. If an equal atom is already present, the stored
    /// atom's truth value is replaced by the incoming one and the stored
    /// handle is returned.
    pub fn add(&self, h: Handle) -> Handle {
        use dashmap::mapref::entry::Entry;
        match self.atoms.entry(h.clone()) {
            Entry::Occupied(e) => {
                let canonical = e.get().clone();
                canonical.set_tv(h.tv());
                canonical
            }
            Entry::Vacant(v) => {
                v.insert(h.clone());
                self.by_type.entry(h.type_id()).or_default().push(h.clone());
                h
            }
        }
    }

    /// Find the interned handle equal to the given atom, if any
    pub fn get_handle(&self, h: &Handle) -> Option<Handle> {
        self.atoms.get(h).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// Visit every atom of the given type; with `subtypes`, of any type
    /// inheriting from it. The handle set is snapshotted first, so the
    /// callback may re-enter the table.
    pub fn foreach_handle_by_type<F: FnMut(&Handle)>(
        &self,
        mut f: F,
        type_id: TypeId,
        subtypes: bool,
    ) {
        let mut snapshot: Vec<Handle> = Vec::new();
        for entry in self.by_type.iter() {
            let t = *entry.key();
            if t == type_id || (subtypes && self.registry.is_a(t, type_id)) {
                snapshot.extend(entry.value().iter().cloned());
            }
        }
        for h in &snapshot {
            f(h);
        }
    }

    /// Fence for pending table mutations. The in-memory table applies
    /// mutations synchronously, so this is immediate.
    pub fn barrier(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeinfo::{CONCEPT_NODE, LIST_LINK, LINK};

    fn table() -> Arc<AtomTable> {
        AtomTable::new(Arc::new(TypeRegistry::new()))
    }

    #[test]
    fn test_structural_identity() {
        let a = Atom::node(CONCEPT_NODE, "cat");
        let b = Atom::node(CONCEPT_NODE, "cat");
        assert_eq!(a, b);

        let l1 = Atom::link(LIST_LINK, vec![a.clone(), b.clone()]);
        let l2 = Atom::link(
            LIST_LINK,
            vec![
                Atom::node(CONCEPT_NODE, "cat"),
                Atom::node(CONCEPT_NODE, "cat"),
            ],
        );
        assert_eq!(l1, l2);
    }

    #[test]
    fn test_interning_replaces_tv() {
        let tab = table();
        let first = tab.add(Atom::node_with_tv(
            CONCEPT_NODE,
            "cat",
            TruthValue::simple(0.5, 0.5),
        ));
        let again = tab.add(Atom::node_with_tv(
            CONCEPT_NODE,
            "cat",
            TruthValue::simple(0.9, 0.1),
        ));
        assert!(Arc::ptr_eq(&first, &again), "duplicate add must intern");
        assert_eq!(tab.len(), 1);
        assert_eq!(first.tv().mean, 0.9, "incoming TV replaces the stored one");
    }

    #[test]
    fn test_foreach_by_type_subtypes() {
        let tab = table();
        tab.add(Atom::node(CONCEPT_NODE, "a"));
        let n = tab.add(Atom::node(CONCEPT_NODE, "b"));
        tab.add(Atom::link(LIST_LINK, vec![n]));

        let mut links = 0;
        tab.foreach_handle_by_type(|_| links += 1, LINK, true);
        assert_eq!(links, 1);

        let mut all = 0;
        tab.foreach_handle_by_type(|_| all += 1, crate::typeinfo::ATOM, true);
        assert_eq!(all, 3);
    }

    #[test]
    fn test_values_do_not_affect_identity() {
        let key = Atom::node(crate::typeinfo::PREDICATE_NODE, "weight");
        let a = Atom::node(CONCEPT_NODE, "cat");
        a.set_value(key.clone(), Value::Float(vec![1.0]));
        let b = Atom::node(CONCEPT_NODE, "cat");
        assert_eq!(*a, *b);
        assert_eq!(a.get_value(&key), Some(Value::Float(vec![1.0])));
    }
}
