//! Runtime type registry
//!
//! The hypergraph core hands out dense runtime type codes for named atom
//! types. Codes are process-local: a different build (or a different
//! process) may assign different numbers to the same names, which is
//! exactly why the persisted type map reconciles by name.

use crate::types::{TypeId, NOTYPE};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Root of the type hierarchy
pub const ATOM: TypeId = 0;
/// Base type of all named atoms
pub const NODE: TypeId = 1;
/// Base type of all atoms with an outgoing set
pub const LINK: TypeId = 2;
pub const CONCEPT_NODE: TypeId = 3;
pub const PREDICATE_NODE: TypeId = 4;
pub const NUMBER_NODE: TypeId = 5;
pub const LIST_LINK: TypeId = 6;
pub const SET_LINK: TypeId = 7;
pub const MEMBER_LINK: TypeId = 8;
pub const INHERITANCE_LINK: TypeId = 9;
pub const EVALUATION_LINK: TypeId = 10;

struct TypeDef {
    name: String,
    parent: TypeId,
}

/// Registry of runtime atom types with a single-parent hierarchy
pub struct TypeRegistry {
    defs: RwLock<Vec<TypeDef>>,
    by_name: RwLock<HashMap<String, TypeId>>,
}

impl TypeRegistry {
    /// Build a registry holding the standard type inventory
    pub fn new() -> Self {
        let reg = TypeRegistry {
            defs: RwLock::new(Vec::new()),
            by_name: RwLock::new(HashMap::new()),
        };
        reg.register("Atom", ATOM);
        reg.register("Node", ATOM);
        reg.register("Link", ATOM);
        reg.register("ConceptNode", NODE);
        reg.register("PredicateNode", NODE);
        reg.register("NumberNode", NODE);
        reg.register("ListLink", LINK);
        reg.register("SetLink", LINK);
        reg.register("MemberLink", LINK);
        reg.register("InheritanceLink", LINK);
        reg.register("EvaluationLink", LINK);
        reg
    }

    /// Declare a type under the given parent; returns its code.
    /// Re-declaring an existing name returns the existing code.
    pub fn register(&self, name: &str, parent: TypeId) -> TypeId {
        let mut by_name = self.by_name.write();
        if let Some(&t) = by_name.get(name) {
            return t;
        }
        let mut defs = self.defs.write();
        let t = defs.len() as TypeId;
        defs.push(TypeDef {
            name: name.to_string(),
            parent,
        });
        by_name.insert(name.to_string(), t);
        t
    }

    /// Number of declared types; codes are dense in `0..len()`
    pub fn len(&self) -> usize {
        self.defs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.read().is_empty()
    }

    /// Runtime code for a type name, or NOTYPE if this runtime lacks it
    pub fn type_of(&self, name: &str) -> TypeId {
        *self.by_name.read().get(name).unwrap_or(&NOTYPE)
    }

    /// Name of a runtime type code
    pub fn name_of(&self, t: TypeId) -> Option<String> {
        self.defs.read().get(t as usize).map(|d| d.name.clone())
    }

    /// Walk the parent chain: is `t` equal to, or a descendant of, `ancestor`?
    pub fn is_a(&self, t: TypeId, ancestor: TypeId) -> bool {
        let defs = self.defs.read();
        let mut cur = t;
        loop {
            if cur == ancestor {
                return true;
            }
            match defs.get(cur as usize) {
                Some(d) if d.parent != cur => cur = d.parent,
                _ => return false,
            }
        }
    }

    pub fn is_node(&self, t: TypeId) -> bool {
        self.is_a(t, NODE)
    }

    pub fn is_link(&self, t: TypeId) -> bool {
        self.is_a(t, LINK)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        TypeRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_inventory() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.type_of("ConceptNode"), CONCEPT_NODE);
        assert_eq!(reg.name_of(LIST_LINK).as_deref(), Some("ListLink"));
        assert_eq!(reg.type_of("NoSuchType"), NOTYPE);
        assert_eq!(reg.len(), 11);
    }

    #[test]
    fn test_is_a() {
        let reg = TypeRegistry::new();
        assert!(reg.is_node(CONCEPT_NODE));
        assert!(!reg.is_node(LIST_LINK));
        assert!(reg.is_link(EVALUATION_LINK));
        assert!(reg.is_a(CONCEPT_NODE, ATOM));
        assert!(!reg.is_a(NODE, LINK));
    }

    #[test]
    fn test_register_idempotent() {
        let reg = TypeRegistry::new();
        let a = reg.register("FooNode", NODE);
        let b = reg.register("FooNode", NODE);
        assert_eq!(a, b);
        assert!(reg.is_node(a));
    }
}
