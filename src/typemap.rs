//! Persisted type map
//!
//! Runtime type codes are process-local; the database stores its own codes
//! in the TypeCodes table, keyed by type *name*. These maps reconcile the
//! two code spaces in both directions. The storing map is total over all
//! runtime types once bootstrapped; the loading map carries NOTYPE at
//! holes (types the database knows but this runtime does not).

use crate::error::{Result, StoreError};
use crate::typeinfo::TypeRegistry;
use crate::types::{TypeId, NOTYPE};

/// Hard cap on distinct type codes, runtime or persisted
pub const TYPEMAP_SZ: usize = 1 << 16;

pub(crate) struct TypeMap {
    /// runtime type -> db code, -1 at holes
    storing: Vec<i32>,
    /// db code -> runtime type, NOTYPE at holes
    loading: Vec<TypeId>,
    /// db code -> persisted type name
    db_typename: Vec<Option<String>>,
}

impl TypeMap {
    pub fn new() -> TypeMap {
        TypeMap {
            storing: vec![-1; TYPEMAP_SZ],
            loading: vec![NOTYPE; TYPEMAP_SZ],
            db_typename: vec![None; TYPEMAP_SZ],
        }
    }

    /// Record one (db code, type name) pair, wiring both directions if the
    /// runtime knows the name.
    pub fn set_mapping(&mut self, db_code: usize, tname: &str, registry: &TypeRegistry) {
        if db_code >= TYPEMAP_SZ {
            return;
        }
        let runtime = registry.type_of(tname);
        self.loading[db_code] = runtime;
        if runtime != NOTYPE {
            self.storing[runtime as usize] = db_code as i32;
        }
        self.db_typename[db_code] = Some(tname.to_string());
    }

    /// db code for a runtime type; total after bootstrap
    pub fn db_code(&self, t: TypeId) -> Result<i32> {
        match self.storing.get(t as usize) {
            Some(&code) if code >= 0 => Ok(code),
            _ => Err(StoreError::UnknownAtomType(format!("runtime type {}", t))),
        }
    }

    /// runtime type for a db code, NOTYPE when this runtime lacks it
    pub fn runtime_type(&self, db_code: i32) -> TypeId {
        if db_code < 0 {
            return NOTYPE;
        }
        self.loading
            .get(db_code as usize)
            .copied()
            .unwrap_or(NOTYPE)
    }

    pub fn typename(&self, db_code: i32) -> Option<&str> {
        if db_code < 0 {
            return None;
        }
        self.db_typename
            .get(db_code as usize)
            .and_then(|n| n.as_deref())
    }

    /// Whether a db code is already claimed by some type name
    pub fn db_code_in_use(&self, db_code: usize) -> bool {
        self.db_typename
            .get(db_code)
            .map(|n| n.is_some())
            .unwrap_or(true)
    }

    /// Smallest unused db code, or an overflow error
    pub fn lowest_unused_code(&self) -> Result<usize> {
        self.db_typename
            .iter()
            .position(|n| n.is_none())
            .ok_or(StoreError::TypemapOverflow(TYPEMAP_SZ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeinfo::{CONCEPT_NODE, LIST_LINK};

    #[test]
    fn test_bidirectional_mapping() {
        let registry = TypeRegistry::new();
        let mut map = TypeMap::new();
        // The db assigned a different code to ConceptNode than the runtime.
        map.set_mapping(40, "ConceptNode", &registry);
        assert_eq!(map.db_code(CONCEPT_NODE).unwrap(), 40);
        assert_eq!(map.runtime_type(40), CONCEPT_NODE);
        assert_eq!(map.typename(40), Some("ConceptNode"));
    }

    #[test]
    fn test_unknown_name_leaves_hole() {
        let registry = TypeRegistry::new();
        let mut map = TypeMap::new();
        map.set_mapping(9, "TypeFromTheFuture", &registry);
        assert_eq!(map.runtime_type(9), NOTYPE);
        assert!(map.db_code_in_use(9));
    }

    #[test]
    fn test_lowest_unused_skips_claimed() {
        let registry = TypeRegistry::new();
        let mut map = TypeMap::new();
        map.set_mapping(0, "Atom", &registry);
        map.set_mapping(1, "Node", &registry);
        assert_eq!(map.lowest_unused_code().unwrap(), 2);
    }

    #[test]
    fn test_db_code_missing_is_error() {
        let map = TypeMap::new();
        assert!(map.db_code(LIST_LINK).is_err());
    }
}
