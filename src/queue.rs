//! Asynchronous write-back queue
//!
//! Multi-producer multi-consumer queue feeding a fixed pool of writer
//! threads, each of which runs the synchronous store path. `enqueue`
//! acknowledges at submit time; durability requires draining the queue
//! with `barrier`, which waits until every previously enqueued item has
//! been fully processed -- a client-side fence only, not a server commit.
//!
//! Errors on this path are logged and the offending item is dropped; the
//! queue's lost-ordering contract makes asynchronous failures best-effort
//! by design.

use crate::atomtable::Handle;
use crate::storage::StorageInner;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Depth of the submit buffer; `enqueue` blocks only when this is full
const QUEUE_DEPTH: usize = 1024;

#[derive(Default)]
struct DrainState {
    /// Items enqueued but not yet fully processed
    pending: u64,
    /// Barriers currently waiting
    drains_waiting: u64,
}

struct QueueShared {
    state: Mutex<DrainState>,
    drained: Condvar,
    item_count: AtomicU64,
    flush_count: AtomicU64,
    drain_count: AtomicU64,
    drain_msec: AtomicU64,
    drain_slowest_msec: AtomicU64,
    drain_concurrent: AtomicU64,
    busy_writers: AtomicU64,
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub items: u64,
    pub flushes: u64,
    pub drains: u64,
    pub drain_msec: u64,
    pub drain_slowest_msec: u64,
    pub drain_concurrent: u64,
    pub pending: u64,
    pub busy_writers: u64,
}

pub(crate) struct WriteQueue {
    tx: Option<Sender<Handle>>,
    workers: Vec<JoinHandle<()>>,
    shared: Arc<QueueShared>,
}

impl WriteQueue {
    pub fn new(store: Arc<StorageInner>, n_writers: usize) -> WriteQueue {
        let (tx, rx) = bounded::<Handle>(QUEUE_DEPTH);
        let shared = Arc::new(QueueShared {
            state: Mutex::new(DrainState::default()),
            drained: Condvar::new(),
            item_count: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            drain_count: AtomicU64::new(0),
            drain_msec: AtomicU64::new(0),
            drain_slowest_msec: AtomicU64::new(0),
            drain_concurrent: AtomicU64::new(0),
            busy_writers: AtomicU64::new(0),
        });

        let mut workers = Vec::with_capacity(n_writers);
        for i in 0..n_writers {
            let rx = rx.clone();
            let store = store.clone();
            let shared = shared.clone();
            let worker = std::thread::Builder::new()
                .name(format!("atom-writer-{}", i))
                .spawn(move || {
                    while let Ok(atom) = rx.recv() {
                        shared.busy_writers.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = store.do_store_atom(&atom) {
                            log::error!("asynchronous store failed, atom dropped: {}", e);
                        }
                        shared.busy_writers.fetch_sub(1, Ordering::Relaxed);

                        let mut state = shared.state.lock();
                        state.pending -= 1;
                        if state.pending == 0 {
                            shared.drained.notify_all();
                        }
                    }
                })
                .expect("spawn writer thread");
            workers.push(worker);
        }

        WriteQueue {
            tx: Some(tx),
            workers,
            shared,
        }
    }

    /// Submit an atom for asynchronous storage. Non-blocking unless the
    /// bounded submit buffer is full.
    pub fn enqueue(&self, atom: Handle) {
        let tx = self.tx.as_ref().expect("queue closed");
        self.shared.item_count.fetch_add(1, Ordering::Relaxed);
        if tx.is_full() {
            self.shared.flush_count.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.state.lock().pending += 1;
        // Writers only die when the queue is dropped, so this cannot fail
        // while `self` is alive.
        let _ = tx.send(atom);
    }

    /// Drain fence: returns once every item enqueued before the call has
    /// been popped and processed by a writer. Does not wait for the SQL
    /// server to commit.
    pub fn barrier(&self) {
        let start = Instant::now();
        let mut state = self.shared.state.lock();
        if state.drains_waiting > 0 {
            self.shared.drain_concurrent.fetch_add(1, Ordering::Relaxed);
        }
        state.drains_waiting += 1;
        while state.pending > 0 {
            self.shared.drained.wait(&mut state);
        }
        state.drains_waiting -= 1;
        drop(state);

        let msec = start.elapsed().as_millis() as u64;
        self.shared.drain_count.fetch_add(1, Ordering::Relaxed);
        self.shared.drain_msec.fetch_add(msec, Ordering::Relaxed);
        self.shared
            .drain_slowest_msec
            .fetch_max(msec, Ordering::Relaxed);
    }

    pub fn stats(&self) -> QueueStats {
        let pending = self.shared.state.lock().pending;
        QueueStats {
            items: self.shared.item_count.load(Ordering::Relaxed),
            flushes: self.shared.flush_count.load(Ordering::Relaxed),
            drains: self.shared.drain_count.load(Ordering::Relaxed),
            drain_msec: self.shared.drain_msec.load(Ordering::Relaxed),
            drain_slowest_msec: self.shared.drain_slowest_msec.load(Ordering::Relaxed),
            drain_concurrent: self.shared.drain_concurrent.load(Ordering::Relaxed),
            pending,
            busy_writers: self.shared.busy_writers.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        // Closing the channel lets each writer finish its backlog and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
