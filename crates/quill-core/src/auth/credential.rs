use std::time::Duration;

use tracing::{debug, warn};

use crate::api::ApiError;
use crate::models::token::MAX_EXPIRES_IN_SECS;
use crate::models::TokenBundle;

use super::storage::{CredentialStorage, StorageError};

/// Storage keys for the persisted credential.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const TOKEN_TYPE: &str = "token_type";
    pub const EXPIRES_IN: &str = "expires_in";
    /// Deprecated single-key format. Read and migrated, never written.
    pub const LEGACY_TOKEN: &str = "token";

    pub const CREDENTIAL: [&str; 4] = [ACCESS_TOKEN, REFRESH_TOKEN, TOKEN_TYPE, EXPIRES_IN];
    pub const ALL: [&str; 5] = [ACCESS_TOKEN, REFRESH_TOKEN, TOKEN_TYPE, EXPIRES_IN, LEGACY_TOKEN];
}

/// Lifetime assumed when the server or storage gives no usable expiry (15 minutes).
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 900;

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Delay before proactively refreshing a token that lives `expires_in_secs`.
///
/// Refreshing at 75% of the lifetime scales with the token and leaves room
/// for one retry before the token actually expires.
pub fn refresh_delay(expires_in_secs: u64) -> Duration {
    Duration::from_millis(expires_in_secs.saturating_mul(750))
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.has_refresh_token())
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl Credential {
    /// Normalize a login/refresh response into a credential.
    ///
    /// `previous_refresh` is kept when the server does not rotate the
    /// refresh token.
    pub fn from_bundle(bundle: TokenBundle, previous_refresh: Option<&str>) -> Result<Self, ApiError> {
        let access_token = bundle
            .access_token()
            .ok_or_else(|| ApiError::InvalidResponse("Token response has no access token".to_string()))?
            .to_string();

        let refresh_token = bundle
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))
            .unwrap_or_default();

        let token_type = bundle
            .token_type
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        let expires_in = bundle.expires_in_secs().unwrap_or_else(|| {
            debug!(default = DEFAULT_EXPIRES_IN_SECS, "Token response has no usable expiry");
            DEFAULT_EXPIRES_IN_SECS
        });

        Ok(Self {
            access_token,
            refresh_token,
            token_type,
            expires_in,
        })
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        authorization_header(&self.token_type, &self.access_token)
    }

    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    pub fn refresh_delay(&self) -> Duration {
        refresh_delay(self.expires_in)
    }

    /// Write all four fields in one storage operation. The legacy key is
    /// dropped in the same pass.
    pub fn persist(&self, storage: &dyn CredentialStorage) -> Result<(), StorageError> {
        let expires_in = self.expires_in.to_string();
        storage.set_many(&[
            (keys::ACCESS_TOKEN, self.access_token.as_str()),
            (keys::REFRESH_TOKEN, self.refresh_token.as_str()),
            (keys::TOKEN_TYPE, self.token_type.as_str()),
            (keys::EXPIRES_IN, expires_in.as_str()),
        ])?;
        storage.remove(keys::LEGACY_TOKEN)
    }

    /// Remove every credential key, legacy included
    pub fn clear(storage: &dyn CredentialStorage) -> Result<(), StorageError> {
        storage.remove_many(&keys::ALL)
    }
}

pub fn authorization_header(token_type: &str, access_token: &str) -> String {
    format!("{} {}", token_type, access_token)
}

/// A credential read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCredential {
    Current(Credential),
    /// Only the deprecated `token` key was present
    Legacy(Credential),
}

impl StoredCredential {
    pub fn credential(&self) -> &Credential {
        match self {
            StoredCredential::Current(c) | StoredCredential::Legacy(c) => c,
        }
    }

    pub fn into_credential(self) -> Credential {
        match self {
            StoredCredential::Current(c) | StoredCredential::Legacy(c) => c,
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredCredential::Legacy(_))
    }
}

fn non_empty(storage: &dyn CredentialStorage, key: &str) -> Result<Option<String>, StorageError> {
    Ok(storage.get(key)?.filter(|v| !v.trim().is_empty()))
}

/// Read the persisted credential.
///
/// A missing, non-positive or unparseable `expires_in` is replaced with the
/// default, one above a year is capped, and the correction is written back.
pub fn load(storage: &dyn CredentialStorage) -> Result<Option<StoredCredential>, StorageError> {
    if let Some(access_token) = non_empty(storage, keys::ACCESS_TOKEN)? {
        let refresh_token = non_empty(storage, keys::REFRESH_TOKEN)?.unwrap_or_default();
        let token_type =
            non_empty(storage, keys::TOKEN_TYPE)?.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());

        let stored_expiry = non_empty(storage, keys::EXPIRES_IN)?;
        let expires_in = match stored_expiry.as_deref().and_then(|v| v.trim().parse::<i64>().ok()) {
            Some(secs) if secs > 0 && secs as u64 > MAX_EXPIRES_IN_SECS => {
                warn!(stored = secs, max = MAX_EXPIRES_IN_SECS, "Stored expiry too large, capping");
                storage.set(keys::EXPIRES_IN, &MAX_EXPIRES_IN_SECS.to_string())?;
                MAX_EXPIRES_IN_SECS
            }
            Some(secs) if secs > 0 => secs as u64,
            _ => {
                warn!(stored = ?stored_expiry, default = DEFAULT_EXPIRES_IN_SECS, "Invalid stored expiry, using default");
                storage.set(keys::EXPIRES_IN, &DEFAULT_EXPIRES_IN_SECS.to_string())?;
                DEFAULT_EXPIRES_IN_SECS
            }
        };

        return Ok(Some(StoredCredential::Current(Credential {
            access_token,
            refresh_token,
            token_type,
            expires_in,
        })));
    }

    if let Some(token) = non_empty(storage, keys::LEGACY_TOKEN)? {
        debug!("Found legacy single-token credential");
        return Ok(Some(StoredCredential::Legacy(Credential {
            access_token: token,
            refresh_token: String::new(),
            token_type: DEFAULT_TOKEN_TYPE.to_string(),
            expires_in: DEFAULT_EXPIRES_IN_SECS,
        })));
    }

    Ok(None)
}

/// `Authorization` header built from whatever token storage holds right now
pub fn stored_authorization(storage: &dyn CredentialStorage) -> Result<Option<String>, StorageError> {
    if let Some(access_token) = non_empty(storage, keys::ACCESS_TOKEN)? {
        let token_type =
            non_empty(storage, keys::TOKEN_TYPE)?.unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_string());
        return Ok(Some(authorization_header(&token_type, &access_token)));
    }
    Ok(non_empty(storage, keys::LEGACY_TOKEN)?
        .map(|token| authorization_header(DEFAULT_TOKEN_TYPE, &token)))
}

pub fn stored_refresh_token(storage: &dyn CredentialStorage) -> Result<Option<String>, StorageError> {
    non_empty(storage, keys::REFRESH_TOKEN)
}
