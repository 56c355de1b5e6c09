//! HTTP client for the blog's REST API.
//!
//! `ApiClient` knows the auth and profile endpoints and how to send a raw
//! request with an `Authorization` header. It holds no credentials itself;
//! token handling lives in [`SessionManager`](crate::auth::SessionManager).

use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, Method, Response};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{ProfileUpdate, RegisterRequest, TokenBundle, UserProfile};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";
const PROFILE_PATH: &str = "/profile";

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// API client for the blog backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiClient {
    /// Create a new API client rooted at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for an API path. Absolute URLs are passed through.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Like `check_response`, but returns Ok(None) for a 429 so the caller can back off.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            Self::check_response(response).await.map(Some)
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.client.post(&url).json(body).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response.json().await?),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    // ===== Auth Endpoints =====

    /// Exchange email and password for a token bundle
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenBundle, ApiError> {
        debug!(email = email, "Sending login request");
        let body = serde_json::json!({ "email": email, "password": password });
        self.post(LOGIN_PATH, &body).await
    }

    /// Create an account. Returns the server's acknowledgment as-is.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Value, ApiError> {
        debug!(username = %request.username, "Sending registration request");
        self.post(REGISTER_PATH, request).await
    }

    /// Exchange a refresh token for a new token bundle
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenBundle, ApiError> {
        let body = serde_json::json!({ "refresh_token": refresh_token });
        self.post(REFRESH_PATH, &body).await
    }

    /// Ask the server to invalidate the access token behind `authorization`
    pub async fn logout(&self, authorization: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url(LOGOUT_PATH))
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await?;
        Self::check_response(response).await?;
        Ok(())
    }

    // ===== Profile Endpoints =====

    /// Fetch the profile belonging to `authorization`
    pub async fn fetch_profile(&self, authorization: &str) -> Result<UserProfile, ApiError> {
        let response = self
            .client
            .get(self.url(PROFILE_PATH))
            .header(header::AUTHORIZATION, authorization)
            .send()
            .await?;
        let response = Self::check_response(response).await?;
        let body: Value = response.json().await?;
        UserProfile::from_response(&body)
    }

    /// Path used for profile updates, for callers going through the
    /// session's authenticated request wrapper.
    pub fn profile_path() -> &'static str {
        PROFILE_PATH
    }

    pub fn profile_update_body(update: &ProfileUpdate) -> Result<Value, ApiError> {
        serde_json::to_value(update).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    // ===== Raw Requests =====

    /// Send a request with the given `Authorization` header value.
    ///
    /// The response is returned whatever its status; only transport
    /// failures become errors.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        authorization: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        let url = self.url(path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(header::AUTHORIZATION, authorization);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        debug!(method = %method, url = %url, status = response.status().as_u16(), "Request complete");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Duration::from_secs(5)).expect("client should build")
    }

    #[test]
    fn test_url_joining() {
        let api = client("https://blog.example.com/api/");
        assert_eq!(api.base_url(), "https://blog.example.com/api");
        assert_eq!(api.url("/profile"), "https://blog.example.com/api/profile");
        assert_eq!(api.url("posts/1"), "https://blog.example.com/api/posts/1");
        assert_eq!(api.url("https://cdn.example.com/x"), "https://cdn.example.com/x");
    }

    #[test]
    fn test_profile_update_body() {
        let update = ProfileUpdate {
            first_name: Some("Ada".to_string()),
            ..Default::default()
        };
        let body = ApiClient::profile_update_body(&update).expect("serialize");
        assert_eq!(body, serde_json::json!({"first_name": "Ada"}));
    }
}
