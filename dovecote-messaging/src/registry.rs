//! Listener registry: message name → ordered listeners, plus a catch-all set.

use crate::listener::MessageListener;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Shared listener handle.
pub type ListenerRef = Arc<dyn MessageListener>;

/// Registered listeners of one node.
///
/// Registration order is preserved. Dispatch visits global listeners before
/// name-scoped ones.
#[derive(Default)]
pub struct ListenerRegistry {
    global: RwLock<Vec<ListenerRef>>,
    by_name: RwLock<HashMap<String, Vec<ListenerRef>>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("global", &self.global_count())
            .field("names", &self.names())
            .finish()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for every message.
    pub fn register_global(&self, listener: ListenerRef) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Register a listener for messages named `name`.
    pub fn register_for(&self, name: &str, listener: ListenerRef) {
        self.by_name
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove a global listener. Returns whether it was registered.
    pub fn unregister_global(&self, listener: &ListenerRef) -> bool {
        let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
        let before = global.len();
        global.retain(|l| !Arc::ptr_eq(l, listener));
        global.len() != before
    }

    /// Remove a listener registered for `name`. Returns whether it was registered.
    pub fn unregister_for(&self, name: &str, listener: &ListenerRef) -> bool {
        let mut by_name = self.by_name.write().unwrap_or_else(PoisonError::into_inner);
        let Some(listeners) = by_name.get_mut(name) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            by_name.remove(name);
        }
        removed
    }

    /// Listeners to invoke for a message named `name`, in dispatch order.
    pub fn listeners_for(&self, name: &str) -> Vec<ListenerRef> {
        let mut listeners = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(named) = self
            .by_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            listeners.extend(named.iter().cloned());
        }
        listeners
    }

    /// Remove every listener, returning them in dispatch order.
    pub fn clear(&self) -> Vec<ListenerRef> {
        let mut removed =
            std::mem::take(&mut *self.global.write().unwrap_or_else(PoisonError::into_inner));
        let by_name =
            std::mem::take(&mut *self.by_name.write().unwrap_or_else(PoisonError::into_inner));
        removed.extend(by_name.into_values().flatten());
        removed
    }

    pub fn global_count(&self) -> usize {
        self.global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Names that have at least one listener.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .by_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.global_count() == 0 && self.names().is_empty()
    }
}
