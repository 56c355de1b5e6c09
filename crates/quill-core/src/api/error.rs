use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull a human-readable message out of a JSON error body.
    ///
    /// The API is not consistent about where it puts the message, so the
    /// common field names are tried in order before falling back to the
    /// raw (truncated) body.
    fn extract_message(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for field in ["message", "error", "detail", "msg"] {
                if let Some(msg) = value.get(field).and_then(|v| v.as_str()) {
                    if !msg.is_empty() {
                        return Self::truncate_body(msg);
                    }
                }
            }
        }
        Self::truncate_body(body.trim())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::extract_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(message),
            code @ 400..=499 => ApiError::Rejected { status: code, message },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    /// HTTP status carried by this error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized(_) => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::Rejected { status, .. } => Some(*status),
            ApiError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True for connectivity failures (connect, timeout, dropped body).
    ///
    /// Decode failures also surface as `reqwest::Error` but mean the server
    /// answered with something unexpected, so they are not network errors.
    pub fn is_network(&self) -> bool {
        match self {
            ApiError::NetworkError(e) => !e.is_decode() && !e.is_status(),
            _ => false,
        }
    }

    /// The server-provided message, without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            ApiError::AccessDenied(m)
            | ApiError::Unauthorized(m)
            | ApiError::NotFound(m)
            | ApiError::ServerError(m)
            | ApiError::InvalidResponse(m) => m.clone(),
            ApiError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
