//! atomstore - SQL-backed persistence for typed hypergraphs
//!
//! Stores atoms (typed nodes and links) and their attached typed values
//! into a relational database and reconstitutes them on demand, bridging
//! an in-memory atom table and a SQL backend.
//!
//! # Architecture
//!
//! - Driver Layer: text-oriented Connection/RecordSet contract over the
//!   native PostgreSQL client, ODBC, and an in-memory test driver
//! - Pool Layer: blocking bounded stack of connections; caps outstanding
//!   SQL requests
//! - TLB: bidirectional in-memory-identity/persistent-UUID map with a
//!   monotonic allocator
//! - Type Map: reconciles runtime type codes with persisted ones by name
//! - Storage Layer: recursive content-addressed atom store and load,
//!   incoming sets, bulk load by height
//! - Value Layer: float/string/composite values and per-atom valuations
//! - Write Queue: eight writer threads behind a bounded MPMC queue with
//!   a drain barrier

pub mod atomtable;
pub mod error;
pub mod typeinfo;
pub mod types;

// Driver and connection layers
pub mod driver;
pub mod driver_mem;
pub mod driver_pg;
#[cfg(feature = "odbc")]
pub mod driver_odbc;
pub mod pool;

// Identity and type reconciliation
pub mod tlb;
pub mod typemap;

// The storage engine
mod response;
pub mod queue;
pub mod schema;
pub mod storage;
pub mod values;

pub use atomtable::{Atom, AtomTable, Handle};
pub use error::{Result, StoreError};
pub use queue::QueueStats;
pub use storage::{AtomStorage, StorageStats};
pub use tlb::Tlb;
pub use typeinfo::TypeRegistry;
pub use types::{TruthValue, TvKind, TypeId, Uuid, Value, Vuid, INVALID_UUID, NOTYPE};
