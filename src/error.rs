//! Error taxonomy for the read and write paths.

use thiserror::Error;
use uuid::Uuid;

/// Longest server error body kept in a [`SyncError::ServerRejected`] message.
const MAX_BODY_EXCERPT: usize = 512;

/// Failures observed while talking to the backend.
///
/// Read-path errors never escape the poller; they are recorded on the
/// failed [`Snapshot`](crate::model::Snapshot). Write-path errors roll the
/// field-group back to its last known good value and surface as a notice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The request could not be completed (connect error, timeout, reset).
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The backend answered with a non-2xx status or an explicit error body.
    #[error("server rejected request{}: {message}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
    ServerRejected {
        status: Option<u16>,
        message: String,
    },

    /// The backend answered 2xx but the body does not match expectations.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A write result arrived after a newer local edit to the same group.
    #[error("write {write_id} superseded by a newer edit")]
    StaleWriteSuperseded { write_id: Uuid },
}

impl SyncError {
    /// Build a `ServerRejected` from a status code and a (possibly long) body.
    pub fn rejected(status: u16, body: &str) -> Self {
        let mut message: String = body.trim().chars().take(MAX_BODY_EXCERPT).collect();
        if message.is_empty() {
            message = "empty response body".to_string();
        }
        Self::ServerRejected {
            status: Some(status),
            message,
        }
    }

    /// Classify a reqwest error into the taxonomy.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::ServerRejected {
                status: Some(status.as_u16()),
                message: err.to_string(),
            }
        } else {
            Self::NetworkFailure(err.to_string())
        }
    }

    /// Whether this error should reach the user as a visible notice.
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::StaleWriteSuperseded { .. })
    }

    /// `MalformedResponse` follows the `ServerRejected` control flow.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::ServerRejected { .. } | Self::MalformedResponse(_))
    }
}
