//! Dovecote Messaging - Store-Backed Delivery
//!
//! Nodes that share nothing but a [`QueueStore`] exchange envelopes through
//! it. Each node buffers outgoing envelopes, flushes them in batches, and
//! runs a claim/dispatch loop that hands incoming envelopes to registered
//! listeners.
//!
//! ```ignore
//! use dovecote_messaging::{Messaging, MessagingConfig};
//! use dovecote_storage::InMemoryQueueStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryQueueStore::new());
//! let node = Arc::new(Messaging::new(store, MessagingConfig::from_env())?);
//! node.register_for("job", Arc::new(JobListener));
//! let handle = node.start().await?;
//! node.queue_message(Envelope::exclusive("job", "run", "42"));
//! ```

pub mod buffer;
pub mod listener;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod telemetry;

pub use buffer::{spawn_flush_task, OutboundBuffer};
pub use listener::{MessageListener, Outbox};
pub use metrics::{MessagingMetrics, MessagingSnapshot};
pub use node::{CycleReport, Messaging, MessagingHandle, AUTO_ANSWER_MSG};
pub use registry::{ListenerRef, ListenerRegistry};
pub use telemetry::{init_tracing, TracingConfig};

pub use dovecote_core::MessagingConfig;
pub use dovecote_storage::QueueStore;
