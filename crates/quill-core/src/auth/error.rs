use thiserror::Error;

use crate::api::ApiError;

use super::storage::StorageError;

/// Message shown whenever the session has been invalidated
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please log in again.";

/// Message shown for connectivity failures
pub const NETWORK_ERROR_MESSAGE: &str =
    "Unable to reach the server. Please check your connection and try again.";

/// Errors surfaced by [`SessionManager`](super::SessionManager).
///
/// Only `SessionExpired` and `AuthenticationRequired` mean the user has to
/// sign in again; everything else leaves the stored credential alone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{}", SESSION_EXPIRED_MESSAGE)]
    SessionExpired,

    #[error("Authentication required. Please log in.")]
    AuthenticationRequired,

    #[error("{0}")]
    Network(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unexpected(String),
}

impl SessionError {
    /// True when the session is gone and the user must sign in again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::SessionExpired | SessionError::AuthenticationRequired)
    }

    /// Classify a failed `/auth/refresh` call.
    ///
    /// 401/403 and messages about a dead token are terminal; connectivity
    /// failures are transient; anything else keeps the raw message.
    pub fn from_refresh_failure(err: &ApiError) -> Self {
        if err.is_network() {
            return SessionError::Network(NETWORK_ERROR_MESSAGE.to_string());
        }
        if matches!(err.status(), Some(401) | Some(403)) || mentions_dead_token(&err.message()) {
            return SessionError::SessionExpired;
        }
        SessionError::Unexpected(err.to_string())
    }
}

fn mentions_dead_token(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("token")
        && ["invalid", "expired", "revoked", "malformed"]
            .iter()
            .any(|word| message.contains(word))
}

impl From<ApiError> for SessionError {
    fn from(err: ApiError) -> Self {
        if err.is_network() {
            return SessionError::Network(NETWORK_ERROR_MESSAGE.to_string());
        }
        match err {
            ApiError::Unauthorized(m) | ApiError::AccessDenied(m) if !m.is_empty() => SessionError::Validation(m),
            ApiError::Unauthorized(_) => SessionError::Validation("Invalid credentials".to_string()),
            ApiError::AccessDenied(_) => SessionError::Validation("Access denied".to_string()),
            ApiError::Rejected { message, status } => {
                if message.is_empty() {
                    SessionError::Validation(format!("Request rejected with status {}", status))
                } else {
                    SessionError::Validation(message)
                }
            }
            other => SessionError::Unexpected(other.to_string()),
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Unexpected(format!("Credential storage failed: {}", err))
    }
}
