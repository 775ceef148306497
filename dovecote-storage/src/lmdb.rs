//! LMDB-backed queue store.
//!
//! Uses the heed crate to keep the queue in a memory-mapped file that every
//! process on the host can open. Two named databases are kept:
//!
//! - `envelopes`: `[id: 16 bytes]` → JSON-encoded envelope
//! - `by_timestamp`: `[timestamp: 8 bytes BE][id: 16 bytes]` → empty
//!
//! The timestamp index gives FIFO order for fetch and claim and lets the
//! expiry pass walk envelopes oldest first.
//!
//! # Claim atomicity
//!
//! LMDB allows one write transaction at a time across all processes. Claim
//! reads, re-checks and writes every envelope inside a single write
//! transaction, so a competing node observes either none or all of a claim.

use std::path::Path;

use async_trait::async_trait;
use dovecote_core::{
    DovecoteError, DovecoteResult, Envelope, EnvelopeId, MsgId, NodeId, StoreError, Timestamp,
};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use uuid::Uuid;

use crate::queue::{ClaimLimit, IndexSpec, QueueStore};

const ENVELOPES_DB: &str = "envelopes";
const TIMESTAMP_DB: &str = "by_timestamp";
const INDEXES_DB: &str = "indexes";

/// Error type for LMDB queue operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbQueueError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbQueueError> for StoreError {
    fn from(e: LmdbQueueError) -> Self {
        match e {
            LmdbQueueError::Serialization(reason) | LmdbQueueError::Deserialization(reason) => {
                StoreError::Serialization { reason }
            }
            LmdbQueueError::EnvOpen(reason) | LmdbQueueError::DbOpen(reason) => {
                StoreError::Unavailable { reason }
            }
            other => StoreError::TransactionFailed {
                reason: other.to_string(),
            },
        }
    }
}

impl From<LmdbQueueError> for DovecoteError {
    fn from(e: LmdbQueueError) -> Self {
        DovecoteError::Storage(e.into())
    }
}

fn txn_err(e: heed::Error) -> LmdbQueueError {
    LmdbQueueError::Transaction(e.to_string())
}

/// Encode a timestamp-index key. The sign bit is flipped so that big-endian
/// byte order matches chronological order, including pre-epoch times.
fn timestamp_key(timestamp: Timestamp, id: EnvelopeId) -> [u8; 24] {
    let millis = (timestamp.timestamp_millis() as u64) ^ (1 << 63);
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&millis.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn id_from_timestamp_key(key: &[u8]) -> Option<EnvelopeId> {
    let bytes: [u8; 16] = key.get(8..24)?.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

/// LMDB-backed queue store.
///
/// Cloning is cheap and shares the underlying environment, so each node in a
/// process can hold its own handle.
///
/// ```ignore
/// use dovecote_storage::{LmdbQueueStore, QueueStore, REQUIRED_INDEXES};
///
/// let store = LmdbQueueStore::new("/var/lib/dovecote/queue", 64)?;
/// store.ensure_indexes(REQUIRED_INDEXES).await?;
/// ```
#[derive(Clone)]
pub struct LmdbQueueStore {
    env: Env,
    envelopes: Database<Bytes, Bytes>,
    by_timestamp: Database<Bytes, Bytes>,
    indexes: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbQueueStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbQueueStore {
    /// Open (or create) a queue store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the map in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbQueueError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(3)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbQueueError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let envelopes: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(ENVELOPES_DB))
            .map_err(|e| LmdbQueueError::DbOpen(e.to_string()))?;
        let by_timestamp: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(TIMESTAMP_DB))
            .map_err(|e| LmdbQueueError::DbOpen(e.to_string()))?;
        let indexes: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(INDEXES_DB))
            .map_err(|e| LmdbQueueError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), "Opened LMDB queue store");

        Ok(Self {
            env,
            envelopes,
            by_timestamp,
            indexes,
        })
    }

    /// Names of the indexes recorded by [`QueueStore::ensure_indexes`].
    pub fn recorded_indexes(&self) -> Result<Vec<String>, LmdbQueueError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut names = Vec::new();
        for entry in self.indexes.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = entry.map_err(txn_err)?;
            names.push(String::from_utf8_lossy(key).into_owned());
        }
        Ok(names)
    }

    fn decode(bytes: &[u8]) -> Result<Envelope, LmdbQueueError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbQueueError::Deserialization(e.to_string()))
    }

    fn read(&self, txn: &RoTxn<'_>, id: EnvelopeId) -> Result<Option<Envelope>, LmdbQueueError> {
        match self.envelopes.get(txn, id.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(Self::decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrite an envelope. The timestamp index is unaffected because
    /// timestamps never change after insert.
    fn write(&self, txn: &mut RwTxn<'_>, envelope: &Envelope) -> Result<(), LmdbQueueError> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|e| LmdbQueueError::Serialization(e.to_string()))?;
        self.envelopes
            .put(txn, envelope.id.as_bytes(), &bytes)
            .map_err(txn_err)
    }

    fn remove(&self, txn: &mut RwTxn<'_>, envelope: &Envelope) -> Result<(), LmdbQueueError> {
        self.envelopes
            .delete(txn, envelope.id.as_bytes())
            .map_err(txn_err)?;
        self.by_timestamp
            .delete(txn, &timestamp_key(envelope.timestamp, envelope.id))
            .map_err(txn_err)?;
        Ok(())
    }

    /// All envelopes in timestamp order, read through `txn`.
    fn scan(&self, txn: &RoTxn<'_>) -> Result<Vec<Envelope>, LmdbQueueError> {
        let mut ids = Vec::new();
        for entry in self.by_timestamp.iter(txn).map_err(txn_err)? {
            let (key, _) = entry.map_err(txn_err)?;
            if let Some(id) = id_from_timestamp_key(key) {
                ids.push(id);
            }
        }

        let mut envelopes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(envelope) = self.read(txn, id)? {
                envelopes.push(envelope);
            }
        }
        Ok(envelopes)
    }
}

#[async_trait]
impl QueueStore for LmdbQueueStore {
    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> DovecoteResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        for index in indexes {
            let fields = serde_json::to_vec(index.fields)
                .map_err(|e| LmdbQueueError::Serialization(e.to_string()))?;
            self.indexes
                .put(&mut wtxn, index.name.as_bytes(), &fields)
                .map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn insert_many(&self, envelopes: Vec<Envelope>) -> DovecoteResult<Vec<EnvelopeId>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut ids = Vec::with_capacity(envelopes.len());

        for mut envelope in envelopes {
            if envelope.id.is_nil() {
                envelope.id = Uuid::now_v7();
            }
            if self
                .envelopes
                .get(&wtxn, envelope.id.as_bytes())
                .map_err(txn_err)?
                .is_some()
            {
                // Dropping the transaction aborts the whole batch.
                return Err(StoreError::InsertFailed {
                    reason: format!("duplicate envelope id {}", envelope.id),
                }
                .into());
            }
            self.write(&mut wtxn, &envelope)?;
            self.by_timestamp
                .put(&mut wtxn, &timestamp_key(envelope.timestamp, envelope.id), &[])
                .map_err(txn_err)?;
            ids.push(envelope.id);
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(ids)
    }

    async fn delete_expired(&self, now: Timestamp) -> DovecoteResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let expired: Vec<Envelope> = self
            .scan(&wtxn)?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .collect();

        for envelope in &expired {
            self.remove(&mut wtxn, envelope)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(expired.len() as u64)
    }

    async fn claim(&self, node: &NodeId, now: Timestamp, limit: ClaimLimit) -> DovecoteResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        // Scan is already in FIFO order.
        let mut eligible: Vec<Envelope> = self
            .scan(&wtxn)?
            .into_iter()
            .filter(|e| e.is_claimable_by(node))
            .collect();
        if limit == ClaimLimit::One {
            eligible.truncate(1);
        }

        for envelope in &mut eligible {
            envelope.lock_for(node, now);
            self.write(&mut wtxn, envelope)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(eligible.len() as u64)
    }

    async fn fetch_for(&self, node: &NodeId) -> DovecoteResult<Vec<Envelope>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self
            .scan(&rtxn)?
            .into_iter()
            .filter(|e| e.is_fetchable_by(node))
            .collect())
    }

    async fn get(&self, id: EnvelopeId) -> DovecoteResult<Option<Envelope>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self.read(&rtxn, id)?)
    }

    async fn delete(&self, id: EnvelopeId) -> DovecoteResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let existed = match self.read(&wtxn, id)? {
            Some(envelope) => {
                self.remove(&mut wtxn, &envelope)?;
                true
            }
            None => false,
        };
        wtxn.commit().map_err(txn_err)?;
        Ok(existed)
    }

    async fn add_processed_by(&self, msg_id: MsgId, node: &NodeId) -> DovecoteResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let targets: Vec<Envelope> = self
            .scan(&wtxn)?
            .into_iter()
            .filter(|e| e.msg_id == msg_id && !e.is_processed_by(node))
            .collect();

        for mut envelope in targets.iter().cloned() {
            envelope.mark_processed_by(node);
            self.write(&mut wtxn, &envelope)?;
        }
        wtxn.commit().map_err(txn_err)?;
        Ok(targets.len() as u64)
    }

    async fn release(&self, id: EnvelopeId, node: &NodeId) -> DovecoteResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let released = match self.read(&wtxn, id)? {
            Some(mut envelope) if envelope.is_locked_by(node) => {
                envelope.release_by(node);
                self.write(&mut wtxn, &envelope)?;
                true
            }
            _ => false,
        };
        wtxn.commit().map_err(txn_err)?;
        Ok(released)
    }

    async fn count(&self) -> DovecoteResult<usize> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let len = self.envelopes.len(&rtxn).map_err(txn_err)?;
        Ok(len as usize)
    }

    async fn list(&self) -> DovecoteResult<Vec<Envelope>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self.scan(&rtxn)?)
    }
}
