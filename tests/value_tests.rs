//! Value and valuation round-trips
//!
//! Covers the Values/Valuations tables: recursive composites, the
//! delete-then-insert update discipline, and storage reclamation.

use atomstore::driver::RecordSet;
use atomstore::typeinfo::{CONCEPT_NODE, PREDICATE_NODE};
use atomstore::{Atom, AtomStorage, AtomTable, StoreError, TypeRegistry, Value, Vuid};
use std::sync::Arc;

fn open_store(name: &str) -> (Arc<AtomTable>, AtomStorage) {
    atomstore::driver_mem::MemDb::forget(name);
    let registry = Arc::new(TypeRegistry::new());
    let table = AtomTable::new(registry.clone());
    let storage = AtomStorage::open(&format!("mem://{}", name), registry.clone())
        .expect("open storage");
    storage.create_tables().expect("create tables");
    storage.register_with(&table);
    (table, storage)
}

/// Rows currently in the Values table, counted through a raw connection
fn values_rows(name: &str) -> usize {
    let mut conn = atomstore::driver::connect(&format!("mem://{}", name)).unwrap();
    let rs: Box<dyn RecordSet> = conn.exec("SELECT vuid FROM Values;").unwrap();
    rs.row_count()
}

#[test]
fn test_float_value_roundtrip() {
    let (_, storage) = open_store("value_float");
    let v = Value::Float(vec![1.0, 2.5, -3.75]);
    let vuid = storage.store_value(&v).unwrap();
    assert_eq!(storage.get_value(vuid).unwrap(), v);
}

#[test]
fn test_string_value_roundtrip_with_awkward_payloads() {
    let (_, storage) = open_store("value_string");
    let v = Value::Str(vec![
        "plain".to_string(),
        "has, comma".to_string(),
        "has \"quotes\"".to_string(),
        "has 'apostrophe'".to_string(),
        "back\\slash".to_string(),
    ]);
    let vuid = storage.store_value(&v).unwrap();
    assert_eq!(storage.get_value(vuid).unwrap(), v);
}

#[test]
fn test_link_value_roundtrip_recursive() {
    let (_, storage) = open_store("value_link");
    let v = Value::Link(vec![
        Value::Float(vec![1.0, 2.0]),
        Value::Str(vec!["x".to_string()]),
        Value::Link(vec![Value::Float(vec![9.0])]),
    ]);
    let vuid = storage.store_value(&v).unwrap();
    assert_eq!(storage.get_value(vuid).unwrap(), v);
}

#[test]
fn test_get_missing_value_is_empty_result() {
    let (_, storage) = open_store("value_missing");
    match storage.get_value(Vuid::new(12345)) {
        Err(StoreError::EmptyResult(_)) => {}
        other => panic!("expected EmptyResult, got {:?}", other),
    }
}

#[test]
fn test_delete_value_cascades_through_composites() {
    let name = "value_delete_cascade";
    let (_, storage) = open_store(name);

    let v = Value::Link(vec![
        Value::Float(vec![1.0]),
        Value::Link(vec![Value::Str(vec!["deep".to_string()])]),
    ]);
    let vuid = storage.store_value(&v).unwrap();
    assert_eq!(values_rows(name), 4, "parent, two children, one grandchild");

    storage.delete_value(vuid).unwrap();
    assert_eq!(values_rows(name), 0, "the whole tree must be reclaimed");
}

#[test]
fn test_valuation_roundtrip_and_overwrite_reclaims() {
    let name = "value_valuation_overwrite";
    let (_, storage) = open_store(name);

    let key = Atom::node(PREDICATE_NODE, "weight");
    let host = Atom::node(CONCEPT_NODE, "cat");
    storage.store_atom(&key, true).unwrap();
    storage.store_atom(&host, true).unwrap();

    let nested = Value::Link(vec![
        Value::Float(vec![1.0, 2.0]),
        Value::Str(vec!["x".to_string()]),
    ]);
    storage.store_valuation(&key, &host, &nested).unwrap();
    assert_eq!(storage.get_valuation(&key, &host).unwrap(), nested);
    assert_eq!(values_rows(name), 2, "two child rows back the composite");

    // Overwrite: the old child rows must be reclaimed, and the new value
    // (inline in the Valuations row) must win.
    let flat = Value::Float(vec![9.0]);
    storage.store_valuation(&key, &host, &flat).unwrap();
    assert_eq!(storage.get_valuation(&key, &host).unwrap(), flat);
    assert_eq!(values_rows(name), 0, "old composite children must be gone");
}

#[test]
fn test_delete_valuation_removes_binding() {
    let (_, storage) = open_store("value_delete_valuation");

    let key = Atom::node(PREDICATE_NODE, "k");
    let host = Atom::node(CONCEPT_NODE, "a");
    storage.store_atom(&key, true).unwrap();
    storage.store_atom(&host, true).unwrap();

    storage
        .store_valuation(&key, &host, &Value::Float(vec![1.0]))
        .unwrap();
    storage.delete_valuation(&key, &host).unwrap();
    match storage.get_valuation(&key, &host) {
        Err(StoreError::EmptyResult(_)) => {}
        other => panic!("expected EmptyResult, got {:?}", other),
    }
}

#[test]
fn test_valuation_with_unstored_key_is_refused() {
    let (_, storage) = open_store("value_fk");

    let key = Atom::node(PREDICATE_NODE, "ghost");
    let host = Atom::node(CONCEPT_NODE, "cat");
    storage.store_atom(&host, true).unwrap();

    // The key atom was never stored; the backend's foreign-key check
    // rejects the row and the error surfaces.
    match storage.store_valuation(&key, &host, &Value::Float(vec![1.0])) {
        Err(StoreError::Driver(msg)) => {
            assert!(msg.contains("foreign key"), "unexpected message: {}", msg)
        }
        other => panic!("expected Driver error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_values_attached_to_atom_travel_with_it() {
    let (_, storage) = open_store("value_attached");

    let key = Atom::node(PREDICATE_NODE, "weight");
    storage.store_atom(&key, true).unwrap();

    let host = Atom::node(CONCEPT_NODE, "cat");
    host.set_value(key.clone(), Value::Float(vec![3.25]));
    storage.store_atom(&host, true).unwrap();

    assert_eq!(
        storage.get_valuation(&key, &host).unwrap(),
        Value::Float(vec![3.25]),
        "store_atom must persist the attached values"
    );
}

#[test]
fn test_missing_key_on_load_is_hard_error() {
    let name = "value_missing_key";
    let (_, storage) = open_store(name);

    let key = Atom::node(PREDICATE_NODE, "weight");
    let host = Atom::node(CONCEPT_NODE, "cat");
    storage.store_atom(&key, true).unwrap();
    storage.store_atom(&host, true).unwrap();
    storage
        .store_valuation(&key, &host, &Value::Float(vec![1.5]))
        .unwrap();

    // A second process with an empty TLB: fetching the host atom finds a
    // valuation whose key it cannot resolve. That is a hard error, not a
    // silent drop.
    let registry = Arc::new(TypeRegistry::new());
    let storage2 = AtomStorage::open(&format!("mem://{}", name), registry).unwrap();
    match storage2.get_node(CONCEPT_NODE, "cat") {
        Err(StoreError::MissingValueKey(_)) => {}
        other => panic!("expected MissingValueKey, got {:?}", other.map(|_| ())),
    }

    // Resolving the key first makes the fetch work and carries the value.
    let key2 = storage2
        .get_node(PREDICATE_NODE, "weight")
        .unwrap()
        .expect("key node exists");
    let host2 = storage2
        .get_node(CONCEPT_NODE, "cat")
        .unwrap()
        .expect("host node exists");
    assert_eq!(host2.get_value(&key2), Some(Value::Float(vec![1.5])));
}
