//! Concurrency stress tests
//!
//! The insert-once discipline under racing writers, and the write queue's
//! drain barrier.

use atomstore::typeinfo::CONCEPT_NODE;
use atomstore::{Atom, AtomStorage, AtomTable, TypeRegistry};
use std::sync::Arc;
use std::thread;

fn open_store(name: &str) -> (Arc<AtomTable>, Arc<AtomStorage>) {
    atomstore::driver_mem::MemDb::forget(name);
    let registry = Arc::new(TypeRegistry::new());
    let table = AtomTable::new(registry.clone());
    let storage = Arc::new(
        AtomStorage::open(&format!("mem://{}", name), registry.clone()).expect("open storage"),
    );
    storage.create_tables().expect("create tables");
    storage.register_with(&table);
    (table, storage)
}

#[test]
fn test_parallel_distinct_stores_insert_once_each() {
    const THREADS: usize = 16;
    const PER_THREAD: usize = 250;
    let (_, storage) = open_store("conc_distinct");

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let storage = storage.clone();
        handles.push(thread::spawn(move || {
            for i in 0..PER_THREAD {
                let node = Atom::node(CONCEPT_NODE, format!("n{}-{}", t, i));
                storage.store_atom(&node, false).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    storage.flush_store_queue();

    let stats = storage.stats();
    assert_eq!(
        stats.num_node_inserts,
        (THREADS * PER_THREAD) as u64,
        "every distinct atom must INSERT exactly once"
    );
    assert_eq!(stats.num_node_updates, 0, "no UPDATE may be observed");
    assert_eq!(stats.queue.pending, 0, "barrier must drain the queue");

    // Spot-check presence across the whole range.
    for t in 0..THREADS {
        let found = storage
            .get_node(CONCEPT_NODE, &format!("n{}-{}", t, PER_THREAD - 1))
            .unwrap();
        assert!(found.is_some(), "atom from thread {} missing", t);
    }
}

#[test]
fn test_racing_stores_of_same_atom_insert_once() {
    const THREADS: usize = 16;
    let (_, storage) = open_store("conc_same_atom");

    let shared = Atom::node(CONCEPT_NODE, "contested");
    let mut handles = Vec::new();
    for _ in 0..THREADS {
        let storage = storage.clone();
        let atom = shared.clone();
        handles.push(thread::spawn(move || {
            storage.store_atom(&atom, true).unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let stats = storage.stats();
    assert_eq!(
        stats.num_node_inserts, 1,
        "exactly one thread may win the INSERT"
    );
    assert_eq!(
        stats.num_node_updates,
        (THREADS - 1) as u64,
        "everyone else must UPDATE"
    );

    let fetched = storage.get_node(CONCEPT_NODE, "contested").unwrap();
    assert!(fetched.is_some(), "the row must not be corrupted by the race");
}

#[test]
fn test_barrier_orders_store_before_read() {
    let (_, storage) = open_store("conc_barrier");

    for i in 0..500 {
        storage
            .store_atom(&Atom::node(CONCEPT_NODE, format!("b{}", i)), false)
            .unwrap();
    }
    storage.flush_store_queue();

    // After the barrier, a reader on another thread sees everything.
    let reader = {
        let storage = storage.clone();
        thread::spawn(move || {
            for i in (0..500).step_by(97) {
                assert!(
                    storage
                        .get_node(CONCEPT_NODE, &format!("b{}", i))
                        .unwrap()
                        .is_some(),
                    "atom b{} missing after barrier",
                    i
                );
            }
        })
    };
    reader.join().unwrap();

    let stats = storage.stats();
    assert!(stats.queue.drains >= 1);
    assert_eq!(stats.queue.pending, 0);
}

#[test]
fn test_concurrent_valuation_updates_settle_on_one_binding() {
    use atomstore::typeinfo::PREDICATE_NODE;
    use atomstore::Value;

    const THREADS: usize = 8;
    let (_, storage) = open_store("conc_valuation");

    let key = Atom::node(PREDICATE_NODE, "score");
    let host = Atom::node(CONCEPT_NODE, "cat");
    storage.store_atom(&key, true).unwrap();
    storage.store_atom(&host, true).unwrap();

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let storage = storage.clone();
        let key = key.clone();
        let host = host.clone();
        handles.push(thread::spawn(move || {
            storage
                .store_valuation(&key, &host, &Value::Float(vec![t as f64]))
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Some writer's value won; it must be exactly one of them.
    match storage.get_valuation(&key, &host).unwrap() {
        Value::Float(vals) => {
            assert_eq!(vals.len(), 1);
            assert!(vals[0] >= 0.0 && vals[0] < THREADS as f64);
        }
        other => panic!("unexpected valuation: {:?}", other),
    }
}
