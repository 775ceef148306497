//! Node and entity identities.

use crate::error::MessagingError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity of a stored record as carried in envelope `additional` tokens.
pub type RecordId = String;

// ============================================================================
// NODE ID
// ============================================================================

/// Identity of one participating node.
///
/// Defaults to a freshly generated UUIDv7 token per process. The lock sentinel
/// [`crate::LOCK_ALL`] is reserved and cannot be used as a node id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a new unique node id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Create a node id from an operator-supplied value.
    pub fn new(id: impl Into<String>) -> Result<Self, MessagingError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(MessagingError::InvalidNodeId {
                value: id,
                reason: "node id cannot be empty".to_string(),
            });
        }
        if id == crate::LOCK_ALL {
            return Err(MessagingError::InvalidNodeId {
                value: id,
                reason: "node id collides with the broadcast lock sentinel".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// Wrap a value read back from the store without re-validating it.
    pub(crate) fn from_stored(id: String) -> Self {
        Self(id)
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// ENTITY TYPE
// ============================================================================

/// Name of a cached entity type as understood by the entity-mapping layer.
///
/// Directives carry the type by name; the receiving node resolves it back
/// through its own mapping, which may not know the type at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Type name of the process-wide configuration entity.
    pub const CONFIG: &'static str = "config_element";

    /// Type name envelopes themselves are stored under.
    pub const ENVELOPE: &'static str = "envelope";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The configuration entity type.
    pub fn config() -> Self {
        Self::new(Self::CONFIG)
    }

    /// The envelope entity type.
    pub fn envelope() -> Self {
        Self::new(Self::ENVELOPE)
    }

    pub fn is_config(&self) -> bool {
        self.0 == Self::CONFIG
    }

    pub fn is_envelope(&self) -> bool {
        self.0 == Self::ENVELOPE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
