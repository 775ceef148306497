//! Per-entity-type cache strategies.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// CACHE STRATEGY
// ============================================================================

/// How a write to one entity type propagates to other nodes' caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CacheStrategy {
    /// Never propagate.
    #[default]
    None,
    /// Re-read the changed record on every node that caches it.
    UpdateEntry,
    /// Evict the changed record, leave the rest of the type cache alone.
    RemoveEntryFromTypeCache,
    /// Drop the whole type cache.
    ClearTypeCache,
}

impl CacheStrategy {
    /// Convert to string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            CacheStrategy::None => "None",
            CacheStrategy::UpdateEntry => "UpdateEntry",
            CacheStrategy::RemoveEntryFromTypeCache => "RemoveEntryFromTypeCache",
            CacheStrategy::ClearTypeCache => "ClearTypeCache",
        }
    }

    /// Parse from string representation.
    pub fn from_db_str(s: &str) -> Result<Self, CacheStrategyParseError> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CacheStrategy::None),
            "updateentry" | "update_entry" => Ok(CacheStrategy::UpdateEntry),
            "removeentryfromtypecache" | "remove_entry_from_type_cache" => {
                Ok(CacheStrategy::RemoveEntryFromTypeCache)
            }
            "cleartypecache" | "clear_type_cache" => Ok(CacheStrategy::ClearTypeCache),
            _ => Err(CacheStrategyParseError(s.to_string())),
        }
    }

    /// Whether writes are propagated per record rather than per type.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            CacheStrategy::UpdateEntry | CacheStrategy::RemoveEntryFromTypeCache
        )
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for CacheStrategy {
    type Err = CacheStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error when parsing an invalid cache strategy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStrategyParseError(pub String);

impl fmt::Display for CacheStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid cache strategy: {}", self.0)
    }
}

impl std::error::Error for CacheStrategyParseError {}

// ============================================================================
// CACHE POLICY
// ============================================================================

/// Cache settings of one entity type, as supplied by the mapping layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    pub strategy: CacheStrategy,
    /// Reads are served from the local cache
    pub read_cache_enabled: bool,
    /// Writes invalidate caches
    pub clear_on_write: bool,
}

impl CachePolicy {
    /// A read-cached, clear-on-write policy with the given strategy.
    pub fn cached(strategy: CacheStrategy) -> Self {
        Self {
            strategy,
            read_cache_enabled: true,
            clear_on_write: true,
        }
    }

    pub fn with_read_cache(mut self, enabled: bool) -> Self {
        self.read_cache_enabled = enabled;
        self
    }

    pub fn with_clear_on_write(mut self, enabled: bool) -> Self {
        self.clear_on_write = enabled;
        self
    }

    /// Whether local writes should be announced to other nodes.
    pub fn propagates_writes(&self) -> bool {
        self.read_cache_enabled && self.clear_on_write
    }
}
