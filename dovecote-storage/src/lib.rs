//! Dovecote Storage - Queue Store
//!
//! The shared queue every node reads and writes. [`QueueStore`] is the
//! contract the messaging loop relies on; two backends ship with it:
//!
//! - [`InMemoryQueueStore`]: HashMap behind an RwLock, shared by cloning.
//! - [`LmdbQueueStore`]: memory-mapped LMDB file, shared across processes.

pub mod lmdb;
pub mod memory;
pub mod queue;

pub use lmdb::{LmdbQueueError, LmdbQueueStore};
pub use memory::InMemoryQueueStore;
pub use queue::{fifo_key, ClaimLimit, IndexSpec, QueueStore, REQUIRED_INDEXES};
