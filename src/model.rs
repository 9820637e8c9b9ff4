//! Core data model: entities, identities, snapshots and field-groups.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable unique key of an entity within one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<u64> for Identity {
    fn from(key: u64) -> Self {
        Self(key.to_string())
    }
}

/// How an [`Identity`] is derived from a raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKey {
    /// A single field, e.g. `id`.
    Field(String),
    /// Several fields joined with `:`, e.g. `pid` + `name` for process nodes.
    Composite(Vec<String>),
}

impl IdentityKey {
    /// Separator between the parts of a composite key.
    pub const SEPARATOR: &'static str = ":";

    /// Build a key from a list of field paths. Returns `None` if empty.
    pub fn from_fields(fields: &[String]) -> Option<Self> {
        match fields {
            [] => None,
            [single] => Some(Self::Field(single.clone())),
            many => Some(Self::Composite(many.to_vec())),
        }
    }

    /// Extract the identity of `record`.
    ///
    /// Fails with [`SyncError::MalformedResponse`] when a key field is
    /// missing or is not a scalar.
    pub fn extract(&self, record: &Value) -> Result<Identity, SyncError> {
        match self {
            Self::Field(field) => key_part(record, field).map(Identity),
            Self::Composite(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    parts.push(key_part(record, field)?);
                }
                Ok(Identity(parts.join(Self::SEPARATOR)))
            }
        }
    }
}

impl Default for IdentityKey {
    fn default() -> Self {
        Self::Field("id".to_string())
    }
}

fn key_part(record: &Value, field: &str) -> Result<String, SyncError> {
    lookup(record, field)
        .and_then(scalar_text)
        .ok_or_else(|| {
            SyncError::MalformedResponse(format!("record is missing identity field '{field}'"))
        })
}

/// Resolve a dotted field path (`details.port`) inside a JSON record.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Render a scalar JSON value as text. Null and compound values yield `None`.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A record synchronized from the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub identity: Identity,
    /// Opaque domain fields exactly as the backend sent them.
    pub payload: Value,
    /// Local wall-clock time this identity was first sighted in an
    /// unbroken run of snapshots.
    pub observed_at: DateTime<Utc>,
}

impl Entity {
    /// Look up a dotted field path in the payload.
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.payload, path)
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One complete, timestamped read of the remote collection.
///
/// Snapshots are shared behind `Arc` and never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Monotonic counter per poller, starting at 1.
    pub sequence: u64,
    pub fetched_at: DateTime<Utc>,
    pub success: bool,
    pub entities: Arc<Vec<Entity>>,
    /// Why the fetch failed, when `success` is false.
    #[serde(skip)]
    pub error: Option<SyncError>,
}

impl Snapshot {
    /// Build a successful snapshot from raw records.
    ///
    /// Entities whose identity was present in `previous` keep their
    /// `observed_at`; all others are stamped with `now`.
    pub fn from_records(
        sequence: u64,
        records: Vec<Value>,
        key: &IdentityKey,
        previous: Option<&Snapshot>,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let seen: HashMap<&Identity, DateTime<Utc>> = previous
            .map(|p| p.entities.iter().map(|e| (&e.identity, e.observed_at)).collect())
            .unwrap_or_default();

        let mut entities = Vec::with_capacity(records.len());
        for payload in records {
            let identity = key.extract(&payload)?;
            let observed_at = seen.get(&identity).copied().unwrap_or(now);
            entities.push(Entity {
                identity,
                payload,
                observed_at,
            });
        }

        Ok(Self {
            sequence,
            fetched_at: now,
            success: true,
            entities: Arc::new(entities),
            error: None,
        })
    }

    /// Build a failed snapshot that shows `retained` entities.
    pub fn failed(
        sequence: u64,
        error: SyncError,
        retained: Arc<Vec<Entity>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence,
            fetched_at: now,
            success: false,
            entities: retained,
            error: Some(error),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.entities.iter().map(|e| &e.identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.identity == identity)
    }
}

// ---------------------------------------------------------------------------
// FieldGroup
// ---------------------------------------------------------------------------

/// A named unit of independently writable settings state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldGroup(String);

impl FieldGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FieldGroup {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
