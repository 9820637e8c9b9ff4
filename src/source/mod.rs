//! Backend collaborators: the read endpoint feeding a poller and the write
//! endpoint behind the optimistic write coordinator.

pub mod http;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::SyncError;
use crate::model::FieldGroup;

/// Source of raw records for a [`SnapshotPoller`](crate::poller::SnapshotPoller).
///
/// Implementations must report failure unambiguously so an empty result is
/// never confused with a failed request.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the current collection as a list of raw JSON records.
    async fn fetch(&self) -> Result<Vec<Value>, SyncError>;
}

/// A single write sent to the backend for one field-group.
#[derive(Debug, Clone, Serialize)]
pub struct WriteRequest {
    /// Correlation id, also sent to the backend.
    pub id: Uuid,
    pub group: FieldGroup,
    /// Partial update for the group.
    pub fields: Value,
    pub issued_at: DateTime<Utc>,
}

/// Write endpoint for remotely persisted settings.
#[async_trait::async_trait]
pub trait WriteEndpoint: Send + Sync {
    /// Apply a partial update and return the authoritative value of the
    /// whole group as confirmed by the backend.
    async fn write(&self, request: &WriteRequest) -> Result<Value, SyncError>;

    /// Read the current authoritative value of a group.
    ///
    /// `Ok(None)` means the backend answered but did not include the group,
    /// which callers must treat as "unknown", never as "empty".
    async fn read(&self, group: &FieldGroup) -> Result<Option<Value>, SyncError>;
}
