//! Error types for the feed engine and its collaborators.

use thiserror::Error;

use crate::inflight::InFlightKey;

/// Errors from the storage/auth collaborator itself.
#[derive(Debug, Error)]
pub enum BackendError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The service answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Authentication failed or the session was rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl BackendError {
    /// Whether a read may be retried after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(e) => e.is_timeout() || e.is_connect(),
            BackendError::Api { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

/// Errors surfaced by feed actions and reconciliation.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The action needs a signed-in session.
    #[error("sign in first")]
    AuthRequired,

    /// Malformed input (display name length, empty comment).
    #[error("invalid input: {0}")]
    Validation(String),

    /// Commenting requires a display name on the author's profile.
    #[error("set a display name before commenting")]
    DisplayNameRequired,

    /// The same action is already in flight; the repeat was dropped.
    #[error("{key} already in flight")]
    InFlightConflict { key: InFlightKey },

    /// The collaborator call failed.
    #[error("remote call failed: {0}")]
    RemoteFailure(#[from] BackendError),

    /// A reconciliation lookup found nothing.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

impl FeedError {
    /// Whether the error should be shown to the user.
    ///
    /// Dropped duplicates and reconciliation misses are benign races.
    pub fn is_user_visible(&self) -> bool {
        !matches!(
            self,
            FeedError::InFlightConflict { .. } | FeedError::NotFound { .. }
        )
    }
}
