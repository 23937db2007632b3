//! Store-path benchmarks against the in-memory driver

use atomstore::typeinfo::{CONCEPT_NODE, LIST_LINK};
use atomstore::{Atom, AtomStorage, TypeRegistry};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn open(name: &str) -> AtomStorage {
    atomstore::driver_mem::MemDb::forget(name);
    let registry = Arc::new(TypeRegistry::new());
    let storage = AtomStorage::open(&format!("mem://{}", name), registry).unwrap();
    storage.create_tables().unwrap();
    storage
}

fn bench_store_nodes(c: &mut Criterion) {
    let storage = open("bench_store_nodes");
    let mut i = 0u64;
    c.bench_function("store_node_sync", |b| {
        b.iter(|| {
            i += 1;
            let node = Atom::node(CONCEPT_NODE, format!("node-{}", i));
            storage.store_atom(black_box(&node), true).unwrap();
        })
    });
}

fn bench_restore_node(c: &mut Criterion) {
    let storage = open("bench_restore_node");
    let node = Atom::node(CONCEPT_NODE, "steady");
    storage.store_atom(&node, true).unwrap();
    c.bench_function("restore_node_sync", |b| {
        b.iter(|| {
            storage.store_atom(black_box(&node), true).unwrap();
        })
    });
}

fn bench_store_links(c: &mut Criterion) {
    let storage = open("bench_store_links");
    let a = Atom::node(CONCEPT_NODE, "left");
    let b_node = Atom::node(CONCEPT_NODE, "right");
    storage.store_atom(&a, true).unwrap();
    storage.store_atom(&b_node, true).unwrap();
    let mut i = 0u64;
    c.bench_function("store_fresh_link_sync", |b| {
        b.iter(|| {
            i += 1;
            let tip = Atom::node(CONCEPT_NODE, format!("tip-{}", i));
            let link = Atom::link(LIST_LINK, vec![a.clone(), b_node.clone(), tip]);
            storage.store_atom(black_box(&link), true).unwrap();
        })
    });
}

fn bench_get_node(c: &mut Criterion) {
    let storage = open("bench_get_node");
    storage
        .store_atom(&Atom::node(CONCEPT_NODE, "needle"), true)
        .unwrap();
    c.bench_function("get_node", |b| {
        b.iter(|| {
            let found = storage.get_node(CONCEPT_NODE, black_box("needle")).unwrap();
            assert!(found.is_some());
        })
    });
}

criterion_group!(
    benches,
    bench_store_nodes,
    bench_restore_node,
    bench_store_links,
    bench_get_node
);
criterion_main!(benches);
