use serde::Deserialize;
use serde_json::Value;

/// Longest token lifetime accepted from a server (one year)
pub const MAX_EXPIRES_IN_SECS: u64 = 365 * 24 * 60 * 60;

/// Token payload returned by `/auth/login` and `/auth/refresh`.
///
/// Older servers answer login with a bare `{"token": "..."}`; newer ones
/// send the full bundle. Every field is optional here and normalized when
/// the bundle is turned into a [`Credential`](crate::auth::Credential).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenBundle {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Legacy single-token field
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<Value>,
}

impl TokenBundle {
    /// The access token, preferring the current field over the legacy one
    pub fn access_token(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.as_deref().filter(|t| !t.is_empty()))
    }

    /// Lifetime in seconds, if the server sent a usable positive value.
    /// Some deployments send it as a string. Capped at
    /// [`MAX_EXPIRES_IN_SECS`].
    pub fn expires_in_secs(&self) -> Option<u64> {
        let secs = match self.expires_in.as_ref()? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        (secs >= 1.0).then(|| (secs as u64).min(MAX_EXPIRES_IN_SECS))
    }

    #[cfg(test)]
    pub(crate) fn with_expires_in(mut self, value: Value) -> Self {
        self.expires_in = Some(value);
        self
    }
}
