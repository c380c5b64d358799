//! Synchronized state types
//!
//! A [`StateRecord`] is the unit of shared state: one payload per
//! `(entity id, namespace)` key, versioned by a per-key [`Revision`].
//! The durable store is authoritative; [`CacheEntry`] is the shared cache's
//! copy and [`InvalidationMessage`] is what processes broadcast to each
//! other after a mutation.

use crate::error::{CacheError, ValidationError};
use crate::{EntityId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Longest namespace the store column accepts.
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Identifier of the process that published a message (e.g. "survival-1").
pub type NodeId = String;

// ============================================================================
// KEY
// ============================================================================

/// Key of a state record: entity id plus attribute namespace.
///
/// Renders as `namespace:entity_id`, which is also the durable row key and
/// the shared cache key suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StateKey {
    namespace: String,
    entity_id: EntityId,
}

impl StateKey {
    /// Build a key, validating the namespace.
    pub fn new(entity_id: EntityId, namespace: impl Into<String>) -> Result<Self, ValidationError> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self {
            namespace,
            entity_id,
        })
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    let reason = if namespace.is_empty() {
        Some("namespace must not be empty")
    } else if namespace.len() > MAX_NAMESPACE_LEN {
        Some("namespace longer than 64 bytes")
    } else if namespace.contains(':') {
        Some("namespace must not contain ':'")
    } else if namespace.chars().any(char::is_whitespace) {
        Some("namespace must not contain whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ValidationError::InvalidKey {
            raw: namespace.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.entity_id)
    }
}

impl FromStr for StateKey {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (namespace, id) = raw.rsplit_once(':').ok_or_else(|| ValidationError::InvalidKey {
            raw: raw.to_string(),
            reason: "expected namespace:entity_id".to_string(),
        })?;
        let entity_id = id.parse::<EntityId>().map_err(|e| ValidationError::InvalidKey {
            raw: raw.to_string(),
            reason: format!("bad entity id: {}", e),
        })?;
        Self::new(entity_id, namespace)
    }
}

impl TryFrom<String> for StateKey {
    type Error = ValidationError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<StateKey> for String {
    fn from(key: StateKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// REVISION
// ============================================================================

/// Monotonic per-key revision counter.
///
/// `Revision::ZERO` means "no live record". The first write produces 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(i64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Revision {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// Authoritative, versioned unit of synchronized state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub key: StateKey,
    pub payload: Value,
    pub revision: Revision,
    pub updated_at: Timestamp,
}

/// Result of a compare-and-increment write.
///
/// A conflict is an expected branch for optimistic writers, not a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The store accepted the write at `record.revision`.
    Applied(StateRecord),
    /// The expected revision did not match; the store is unchanged.
    RevisionConflict { key: StateKey, expected: Revision },
}

impl WriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied(_))
    }

    pub fn applied(&self) -> Option<&StateRecord> {
        match self {
            WriteOutcome::Applied(record) => Some(record),
            WriteOutcome::RevisionConflict { .. } => None,
        }
    }

    pub fn into_applied(self) -> Option<StateRecord> {
        match self {
            WriteOutcome::Applied(record) => Some(record),
            WriteOutcome::RevisionConflict { .. } => None,
        }
    }
}

/// The shared cache's view of a record.
///
/// A `None` payload is a tombstone: the key was deleted at `revision` and any
/// value at or below that revision must be treated as unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: StateKey,
    pub payload: Option<Value>,
    pub revision: Revision,
    pub updated_at: Timestamp,
    pub cached_at: Timestamp,
}

impl CacheEntry {
    pub fn from_record(record: &StateRecord) -> Self {
        Self {
            key: record.key.clone(),
            payload: Some(record.payload.clone()),
            revision: record.revision,
            updated_at: record.updated_at,
            cached_at: Utc::now(),
        }
    }

    pub fn tombstone(key: StateKey, revision: Revision) -> Self {
        let now = Utc::now();
        Self {
            key,
            payload: None,
            revision,
            updated_at: now,
            cached_at: now,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }

    /// The live record this entry describes, `None` for tombstones.
    pub fn into_record(self) -> Option<StateRecord> {
        let payload = self.payload?;
        Some(StateRecord {
            key: self.key,
            payload,
            revision: self.revision,
            updated_at: self.updated_at,
        })
    }

    pub fn encode(&self) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|e| CacheError::Encode {
            reason: e.to_string(),
        })
    }

    pub fn decode(raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::Decode {
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// INVALIDATION
// ============================================================================

/// What happened to the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationKind {
    Updated,
    Deleted,
}

/// Broadcast after every committed write or delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub key: StateKey,
    pub revision: Revision,
    pub kind: InvalidationKind,
    pub origin: NodeId,
}

impl InvalidationMessage {
    pub fn updated(key: StateKey, revision: Revision, origin: impl Into<NodeId>) -> Self {
        Self {
            key,
            revision,
            kind: InvalidationKind::Updated,
            origin: origin.into(),
        }
    }

    pub fn deleted(key: StateKey, revision: Revision, origin: impl Into<NodeId>) -> Self {
        Self {
            key,
            revision,
            kind: InvalidationKind::Deleted,
            origin: origin.into(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind == InvalidationKind::Deleted
    }

    pub fn to_wire(&self) -> Result<String, CacheError> {
        serde_json::to_string(self).map_err(|e| CacheError::Encode {
            reason: e.to_string(),
        })
    }

    pub fn from_wire(raw: &str) -> Result<Self, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::Decode {
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
