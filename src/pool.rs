//! Connection pool
//!
//! A blocking bounded stack of live connections. `pop` blocks when the
//! stack is empty, so the pool size is the admission-control knob: it caps
//! how many SQL requests can be outstanding at once. Every consumer must
//! return its connection on all exit paths; the query cursor does this
//! from its Drop impl.

use crate::driver::{self, Connection};
use crate::error::Result;
use parking_lot::{Condvar, Mutex};

/// Number of asynchronous writer threads; the pool holds one connection
/// for each writer plus one per hardware thread for readers.
pub const N_WRITERS: usize = 8;

/// Pool size for this host: readers must not starve writers, so there are
/// always more connections than writers.
pub fn default_pool_size() -> usize {
    let readers = match num_cpus::get() {
        0 => 8,
        n => n,
    };
    readers + N_WRITERS
}

/// Blocking bounded stack of live connections
pub struct ConnectionPool {
    stack: Mutex<Vec<Box<dyn Connection>>>,
    available: Condvar,
    capacity: usize,
}

impl ConnectionPool {
    /// Open `size` connections for the given URI
    pub fn open(uri: &str, size: usize) -> Result<ConnectionPool> {
        let mut stack = Vec::with_capacity(size);
        for _ in 0..size {
            stack.push(driver::connect(uri)?);
        }
        Ok(ConnectionPool {
            stack: Mutex::new(stack),
            available: Condvar::new(),
            capacity: size,
        })
    }

    /// Take a connection, blocking until one is free
    pub fn pop(&self) -> Box<dyn Connection> {
        let mut stack = self.stack.lock();
        loop {
            if let Some(conn) = stack.pop() {
                return conn;
            }
            self.available.wait(&mut stack);
        }
    }

    /// Return a connection and wake one waiter
    pub fn push(&self, conn: Box<dyn Connection>) {
        self.stack.lock().push(conn);
        self.available.notify_one();
    }

    /// Connections currently free
    pub fn free(&self) -> usize {
        self.stack.lock().len()
    }

    /// Total connections the pool was built with
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
