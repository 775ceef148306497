//! Cache synchronizer: keeps per-node caches consistent after writes.
//!
//! # Send path
//!
//! The mapping layer fires [`LifecycleListener`] hooks after writes. The
//! synchronizer looks up the type's [`CachePolicy`], builds a
//! [`CacheDirective`] and queues it as a broadcast through the node's outbox.
//! Nothing here fails the caller: every send ends in a [`SendOutcome`].
//!
//! # Receive path
//!
//! Registered on a [`Messaging`] node for both directive names, it applies
//! received directives to the [`LocalCache`] and always answers the sender
//! with a `clear_cache_answer` envelope describing what happened.

use crate::directive::{CacheDirective, CLEAR_CACHE_ANSWER, DEFAULT_DIRECTIVE_TTL_MS, DIRECTIVE_NAMES};
use crate::hooks::{HookOutcome, SyncHooks};
use crate::local::LocalCache;
use crate::mapping::{EntityMapping, LifecycleListener, Record};
use crate::strategy::CacheStrategy;
use async_trait::async_trait;
use dovecote_core::{
    CacheSyncError, ConfigError, DovecoteResult, DurationMs, EntityType, Envelope,
};
use dovecote_messaging::{ListenerRef, MessageListener, Messaging, Outbox};
use dovecote_storage::QueueStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the cache synchronizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// TTL of queued directives in milliseconds (default: 30 seconds)
    pub directive_ttl_ms: DurationMs,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            directive_ttl_ms: DEFAULT_DIRECTIVE_TTL_MS,
        }
    }
}

impl SyncConfig {
    /// Load from `DOVECOTE_CACHE_SYNC_TTL_MS`, falling back to the default.
    pub fn from_env() -> Self {
        let directive_ttl_ms = std::env::var("DOVECOTE_CACHE_SYNC_TTL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DIRECTIVE_TTL_MS);
        Self { directive_ttl_ms }
    }

    pub fn with_directive_ttl_ms(mut self, ttl: DurationMs) -> Self {
        self.directive_ttl_ms = ttl;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.directive_ttl_ms <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "directive_ttl_ms".to_string(),
                value: self.directive_ttl_ms.to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for one synchronizer.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Directives queued for other nodes
    pub queued: AtomicU64,

    /// Sends and clears stopped by a hook
    pub vetoed: AtomicU64,

    /// Lifecycle events that needed no directive
    pub skipped: AtomicU64,

    /// Received directives applied to the local cache
    pub clears_applied: AtomicU64,

    /// Received directives that failed
    pub receive_errors: AtomicU64,
}

impl SyncMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            vetoed: self.vetoed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            clears_applied: self.clears_applied.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of synchronizer metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    pub queued: u64,
    pub vetoed: u64,
    pub skipped: u64,
    pub clears_applied: u64,
    pub receive_errors: u64,
}

// ============================================================================
// SEND OUTCOME
// ============================================================================

/// What happened to one send request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// A directive was queued.
    Queued,
    /// A pre-send hook vetoed the directive.
    Vetoed(String),
    /// No directive was needed, or the synchronizer is not attached.
    Skipped,
}

// ============================================================================
// SYNCHRONIZER
// ============================================================================

/// Cache synchronizer of one node.
pub struct CacheSynchronizer<M: EntityMapping, C: LocalCache> {
    mapping: Arc<M>,
    cache: Arc<C>,
    hooks: SyncHooks,
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
    outbox: RwLock<Option<Outbox>>,
}

impl<M: EntityMapping, C: LocalCache> std::fmt::Debug for CacheSynchronizer<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSynchronizer")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl<M: EntityMapping, C: LocalCache> CacheSynchronizer<M, C> {
    pub fn new(mapping: Arc<M>, cache: Arc<C>, config: SyncConfig) -> DovecoteResult<Self> {
        config.validate()?;
        Ok(Self {
            mapping,
            cache,
            hooks: SyncHooks::new(),
            config,
            metrics: Arc::new(SyncMetrics::default()),
            outbox: RwLock::new(None),
        })
    }

    pub fn hooks(&self) -> &SyncHooks {
        &self.hooks
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_attached(&self) -> bool {
        self.current_outbox().is_some()
    }

    fn current_outbox(&self) -> Option<Outbox> {
        self.outbox
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ------------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------------

    /// Announce a stored record.
    pub fn send_for_record(&self, record: &dyn Record, is_new: bool, reason: &str) -> SendOutcome {
        let entity_type = record.entity_type();
        if entity_type.is_envelope() {
            return self.skip();
        }
        if entity_type.is_config() {
            return self.send(CacheDirective::ConfigReload {
                reason: reason.to_string(),
            });
        }

        let Some(policy) = self
            .mapping
            .cache_policy(&entity_type)
            .filter(|p| p.propagates_writes())
        else {
            return self.skip();
        };

        match policy.strategy {
            CacheStrategy::UpdateEntry | CacheStrategy::RemoveEntryFromTypeCache => {
                // Nobody can have a new record cached yet.
                if is_new {
                    return self.skip();
                }
                self.send(CacheDirective::RecordEvent {
                    entity_type,
                    entity_ids: record.identity().into_iter().collect(),
                    reason: reason.to_string(),
                })
            }
            CacheStrategy::ClearTypeCache => self.send(CacheDirective::TypeClear {
                entity_type,
                reason: reason.to_string(),
            }),
            CacheStrategy::None => self.skip(),
        }
    }

    /// Announce a change affecting a whole type.
    pub fn send_type_clear(&self, entity_type: &EntityType, reason: &str) -> SendOutcome {
        if entity_type.is_envelope() {
            return self.skip();
        }
        if entity_type.is_config() {
            return self.send(CacheDirective::ConfigReload {
                reason: reason.to_string(),
            });
        }

        match self.mapping.cache_policy(entity_type) {
            Some(policy) if policy.propagates_writes() && policy.strategy != CacheStrategy::None => {
                self.send(CacheDirective::TypeClear {
                    entity_type: entity_type.clone(),
                    reason: reason.to_string(),
                })
            }
            _ => self.skip(),
        }
    }

    /// Ask every node to drop all of its caches.
    pub fn send_clear_all(&self, reason: &str) -> SendOutcome {
        self.send(CacheDirective::AllClear {
            reason: reason.to_string(),
        })
    }

    fn skip(&self) -> SendOutcome {
        SyncMetrics::incr(&self.metrics.skipped);
        SendOutcome::Skipped
    }

    fn send(&self, directive: CacheDirective) -> SendOutcome {
        let Some(outbox) = self.current_outbox() else {
            tracing::warn!(
                reason = directive.reason(),
                "Cache synchronizer not attached; directive dropped"
            );
            return self.skip();
        };

        let envelope = directive.to_envelope(self.config.directive_ttl_ms);
        let entity_type = directive.entity_type();

        if let HookOutcome::Veto(veto) = self.hooks.fire_pre_send(entity_type.as_ref(), &envelope) {
            SyncMetrics::incr(&self.metrics.vetoed);
            tracing::error!(
                node_id = %outbox.node_id(),
                entity_type = ?entity_type,
                veto = %veto,
                "Could not send cache directive: vetoed by listener"
            );
            return SendOutcome::Vetoed(veto);
        }

        outbox.queue(envelope.clone());
        self.hooks.fire_post_send(entity_type.as_ref(), &envelope);
        SyncMetrics::incr(&self.metrics.queued);
        tracing::debug!(
            node_id = %outbox.node_id(),
            name = %envelope.name,
            value = %envelope.value,
            "Queued cache directive"
        );
        SendOutcome::Queued
    }

    // ------------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------------

    /// Apply a received directive and describe the result.
    pub async fn handle(&self, envelope: &Envelope) -> String {
        tracing::debug!(
            name = %envelope.name,
            sender = ?envelope.sender,
            reason = %envelope.msg,
            value = %envelope.value,
            "Received cache directive"
        );

        match self.apply(envelope).await {
            Ok(text) => text,
            Err(e) => {
                SyncMetrics::incr(&self.metrics.receive_errors);
                tracing::error!(
                    envelope_id = %envelope.id,
                    error = %e,
                    "Could not process cache directive"
                );
                format!("Error processing message: {}", e)
            }
        }
    }

    async fn apply(&self, envelope: &Envelope) -> DovecoteResult<String> {
        let directive = CacheDirective::from_envelope(envelope)?;

        match directive {
            CacheDirective::AllClear { .. } => {
                if let Some(vetoed) = self.pre_clear(None, envelope) {
                    return Ok(vetoed);
                }
                self.cache.clear_all().await?;
                self.post_clear(None, envelope);
                tracing::info!("Cache completely cleared");
                Ok("cache completely cleared".to_string())
            }

            CacheDirective::ConfigReload { .. } => {
                let config_type = EntityType::config();
                if let Some(vetoed) = self.pre_clear(Some(&config_type), envelope) {
                    return Ok(vetoed);
                }
                self.mapping.reload_config().await.map_err(|e| {
                    CacheSyncError::ConfigReloadFailed {
                        reason: e.to_string(),
                    }
                })?;
                self.post_clear(Some(&config_type), envelope);
                Ok("config reread".to_string())
            }

            CacheDirective::TypeClear { entity_type, .. } => {
                let resolved = match self.resolve_cached(&entity_type) {
                    Ok((resolved, _)) => resolved,
                    Err(text) => return Ok(text),
                };
                if let Some(vetoed) = self.pre_clear(Some(&resolved), envelope) {
                    return Ok(vetoed);
                }
                self.cache.clear_type(&resolved).await?;
                self.post_clear(Some(&resolved), envelope);
                Ok(format!("cache cleared for type: {}", entity_type))
            }

            CacheDirective::RecordEvent {
                entity_type,
                entity_ids,
                ..
            } => {
                let (resolved, strategy) = match self.resolve_cached(&entity_type) {
                    Ok(found) => found,
                    Err(text) => return Ok(text),
                };
                if let Some(vetoed) = self.pre_clear(Some(&resolved), envelope) {
                    return Ok(vetoed);
                }
                for id in &entity_ids {
                    if !self.cache.contains(&resolved, id).await? {
                        continue;
                    }
                    if strategy == CacheStrategy::RemoveEntryFromTypeCache {
                        self.cache.remove_entry(&resolved, id).await?;
                    } else {
                        self.cache.refresh_entry(&resolved, id).await.map_err(|e| {
                            CacheSyncError::RefreshFailed {
                                entity_type: resolved.clone(),
                                id: id.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                    }
                }
                self.post_clear(Some(&resolved), envelope);
                Ok(format!("cache cleared for type: {}", entity_type))
            }
        }
    }

    /// Resolve a received type name to a locally read-cached type.
    /// `Err` carries the reply text when the directive does not apply here.
    fn resolve_cached(&self, entity_type: &EntityType) -> Result<(EntityType, CacheStrategy), String> {
        let Some(resolved) = self.mapping.resolve_type(entity_type.as_str()) else {
            let err = CacheSyncError::TypeNotResolved {
                type_name: entity_type.to_string(),
            };
            tracing::warn!(error = %err, "Could not process cache directive");
            return Err(err.to_string());
        };

        match self.mapping.cache_policy(&resolved) {
            Some(policy) if policy.read_cache_enabled => Ok((resolved, policy.strategy)),
            _ => {
                tracing::warn!(entity_type = %entity_type, "Cache directive for uncached type");
                Err(format!("type is uncached: {}", entity_type))
            }
        }
    }

    /// Run the pre-clear chain; `Some` carries the reply text on veto.
    fn pre_clear(&self, entity_type: Option<&EntityType>, envelope: &Envelope) -> Option<String> {
        match self.hooks.fire_pre_clear(entity_type, envelope) {
            HookOutcome::Proceed => None,
            HookOutcome::Veto(reason) => {
                SyncMetrics::incr(&self.metrics.vetoed);
                tracing::error!(
                    entity_type = ?entity_type,
                    veto = %reason,
                    "Could not clear cache: vetoed by listener"
                );
                Some(format!("clear vetoed: {}", reason))
            }
        }
    }

    fn post_clear(&self, entity_type: Option<&EntityType>, envelope: &Envelope) {
        SyncMetrics::incr(&self.metrics.clears_applied);
        self.hooks.fire_post_clear(entity_type, envelope);
    }
}

// ============================================================================
// ATTACHMENT
// ============================================================================

impl<M: EntityMapping + 'static, C: LocalCache + 'static> CacheSynchronizer<M, C> {
    /// Listen for directives on `node` and send through its outbox.
    pub fn attach<S: QueueStore>(self: &Arc<Self>, node: &Messaging<S>) {
        for name in DIRECTIVE_NAMES {
            node.register_for(name, self.clone() as ListenerRef);
        }
        tracing::info!(node_id = %node.node_id(), "Cache synchronizer attached");
    }

    /// Stop listening on `node`. Sends are skipped until attached again.
    pub fn detach<S: QueueStore>(self: &Arc<Self>, node: &Messaging<S>) {
        let listener = self.clone() as ListenerRef;
        for name in DIRECTIVE_NAMES {
            node.unregister_for(name, &listener);
        }
        tracing::info!(node_id = %node.node_id(), "Cache synchronizer detached");
    }
}

// ============================================================================
// TRAIT IMPLS
// ============================================================================

impl<M: EntityMapping, C: LocalCache> LifecycleListener for CacheSynchronizer<M, C> {
    fn post_store(&self, record: &dyn Record, is_new: bool) {
        self.send_for_record(record, is_new, "store");
    }

    fn post_remove(&self, record: &dyn Record) {
        self.send_type_clear(&record.entity_type(), "remove");
    }

    fn post_remove_type(&self, entity_type: &EntityType) {
        self.send_type_clear(entity_type, "remove");
    }

    fn post_update(&self, entity_type: &EntityType, kind: &str) {
        self.send_type_clear(entity_type, &format!("Update: {}", kind));
    }

    fn post_drop(&self, entity_type: &EntityType) {
        self.send_type_clear(entity_type, "drop");
    }
}

#[async_trait]
impl<M: EntityMapping, C: LocalCache> MessageListener for CacheSynchronizer<M, C> {
    fn name(&self) -> &str {
        "cache_synchronizer"
    }

    async fn on_message(&self, envelope: &Envelope) -> DovecoteResult<Option<Envelope>> {
        let text = self.handle(envelope).await;
        let node_id = self
            .current_outbox()
            .map(|outbox| outbox.node_id().to_string())
            .unwrap_or_default();
        Ok(Some(Envelope::exclusive(CLEAR_CACHE_ANSWER, text, node_id)))
    }

    fn bind(&self, outbox: Option<Outbox>) {
        *self.outbox.write().unwrap_or_else(PoisonError::into_inner) = outbox;
    }
}
