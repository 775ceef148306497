//! Dovecote Cache - Cache Synchronization
//!
//! Keeps per-node entity caches consistent after writes by broadcasting
//! invalidation directives over dovecote messaging.
//!
//! ```text
//! write on node A ─→ LifecycleListener ─→ policy check ─→ pre-send hooks
//!                                                            │
//!                      outbox ─→ outbound buffer ─→ queue store
//!                                                            │
//! node B loop ─→ CacheSynchronizer::on_message ─→ pre-clear hooks ─→ LocalCache
//!                              └──→ clear_cache_answer to node A
//! ```

pub mod directive;
pub mod hooks;
pub mod local;
pub mod mapping;
pub mod strategy;
pub mod synchronizer;

pub use directive::{
    CacheDirective, ALL_TYPES, CACHE_SYNC_RECORD, CACHE_SYNC_TYPE, CLEAR_CACHE_ANSWER,
    DEFAULT_DIRECTIVE_TTL_MS, DIRECTIVE_NAMES,
};
pub use hooks::{CacheSyncListener, HookOutcome, SyncHooks, SyncListenerRef};
pub use local::LocalCache;
pub use mapping::{EntityMapping, LifecycleListener, Record};
pub use strategy::{CachePolicy, CacheStrategy, CacheStrategyParseError};
pub use synchronizer::{CacheSynchronizer, SendOutcome, SyncConfig, SyncMetrics, SyncSnapshot};
