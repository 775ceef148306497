//! Vetoable hooks around directive sends and local clears.
//!
//! Listeners registered globally run before listeners registered for the
//! directive's entity type. The first veto stops the chain and aborts the
//! wrapped operation; post hooks only observe.

use dovecote_core::{EntityType, Envelope};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Result of a pre hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Proceed,
    Veto(String),
}

impl HookOutcome {
    pub fn veto(reason: impl Into<String>) -> Self {
        HookOutcome::Veto(reason.into())
    }

    pub fn is_veto(&self) -> bool {
        matches!(self, HookOutcome::Veto(_))
    }
}

/// Observer of cache synchronization. `entity_type` is `None` for
/// clear-everything directives.
pub trait CacheSyncListener: Send + Sync {
    /// Before a directive is queued on this node.
    fn pre_send(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        HookOutcome::Proceed
    }

    /// After a directive was queued on this node.
    fn post_send(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) {}

    /// Before a received directive touches the local cache.
    fn pre_clear(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) -> HookOutcome {
        HookOutcome::Proceed
    }

    /// After a received directive was applied.
    fn post_clear(&self, _entity_type: Option<&EntityType>, _envelope: &Envelope) {}
}

pub type SyncListenerRef = Arc<dyn CacheSyncListener>;

/// Registered cache sync listeners.
#[derive(Default)]
pub struct SyncHooks {
    global: RwLock<Vec<SyncListenerRef>>,
    by_type: RwLock<HashMap<EntityType, Vec<SyncListenerRef>>>,
}

impl std::fmt::Debug for SyncHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let global = self.global.read().unwrap_or_else(PoisonError::into_inner).len();
        let types = self.by_type.read().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("SyncHooks")
            .field("global", &global)
            .field("types", &types)
            .finish()
    }
}

impl SyncHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: SyncListenerRef) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn remove_listener(&self, listener: &SyncListenerRef) -> bool {
        let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
        let before = global.len();
        global.retain(|l| !Arc::ptr_eq(l, listener));
        global.len() != before
    }

    pub fn add_listener_for_type(&self, entity_type: EntityType, listener: SyncListenerRef) {
        self.by_type
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity_type)
            .or_default()
            .push(listener);
    }

    pub fn remove_listener_for_type(
        &self,
        entity_type: &EntityType,
        listener: &SyncListenerRef,
    ) -> bool {
        let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = by_type.get_mut(entity_type) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Global listeners, then those scoped to `entity_type`.
    fn chain(&self, entity_type: Option<&EntityType>) -> Vec<SyncListenerRef> {
        let mut chain = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(entity_type) = entity_type {
            if let Some(scoped) = self
                .by_type
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(entity_type)
            {
                chain.extend(scoped.iter().cloned());
            }
        }
        chain
    }

    fn first_veto<F>(&self, entity_type: Option<&EntityType>, hook: F) -> HookOutcome
    where
        F: Fn(&dyn CacheSyncListener) -> HookOutcome,
    {
        self.chain(entity_type)
            .iter()
            .map(|l| hook(l.as_ref()))
            .find(HookOutcome::is_veto)
            .unwrap_or(HookOutcome::Proceed)
    }

    pub fn fire_pre_send(&self, entity_type: Option<&EntityType>, envelope: &Envelope) -> HookOutcome {
        self.first_veto(entity_type, |l| l.pre_send(entity_type, envelope))
    }

    pub fn fire_post_send(&self, entity_type: Option<&EntityType>, envelope: &Envelope) {
        for listener in self.chain(entity_type) {
            listener.post_send(entity_type, envelope);
        }
    }

    pub fn fire_pre_clear(&self, entity_type: Option<&EntityType>, envelope: &Envelope) -> HookOutcome {
        self.first_veto(entity_type, |l| l.pre_clear(entity_type, envelope))
    }

    pub fn fire_post_clear(&self, entity_type: Option<&EntityType>, envelope: &Envelope) {
        for listener in self.chain(entity_type) {
            listener.post_clear(entity_type, envelope);
        }
    }
}
