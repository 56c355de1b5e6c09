//! Session manager: credential lifecycle for the signed-in user.
//!
//! `SessionManager` owns the access/refresh token pair, keeps it in durable
//! storage, refreshes it ahead of expiry and again whenever the API answers
//! 401, and wraps outgoing requests with the current `Authorization` header.
//!
//! Concurrent callers that all discover an expired token share a single
//! `/auth/refresh` call: the first one installs a shared future in
//! `pending_refresh`, the rest await a clone of it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::models::{ProfileUpdate, RegisterRequest, UserProfile};

use super::credential::{self, Credential};
use super::error::SessionError;
use super::storage::CredentialStorage;
use super::timer::{RefreshTimer, ScheduledRefresh};

/// Delay before retrying a failed proactive refresh.
pub const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

type RefreshFuture = Shared<BoxFuture<'static, Result<String, SessionError>>>;

#[derive(Debug, Default)]
struct SessionState {
    credential: Option<Credential>,
    user: Option<UserProfile>,
    /// Number of in-progress loading operations
    loading: usize,
    last_error: Option<String>,
    /// Bumped every time the session is cleared. Work started under an
    /// older epoch must not write its result back.
    epoch: u64,
}

struct Inner {
    api: ApiClient,
    storage: Arc<dyn CredentialStorage>,
    state: Mutex<SessionState>,
    pending_refresh: Mutex<Option<RefreshFuture>>,
    timer: RefreshTimer,
}

/// Handle to the current user's session.
/// Clone is cheap; all clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Marks the session as loading for as long as it is alive
struct LoadingGuard<'a> {
    session: &'a SessionManager,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.session.state();
        state.loading = state.loading.saturating_sub(1);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(api: ApiClient, storage: Arc<dyn CredentialStorage>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                storage,
                state: Mutex::new(SessionState::default()),
                pending_refresh: Mutex::new(None),
                timer: RefreshTimer::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        lock(&self.inner.state)
    }

    fn storage(&self) -> &dyn CredentialStorage {
        self.inner.storage.as_ref()
    }

    fn begin_loading(&self) -> LoadingGuard<'_> {
        self.state().loading += 1;
        LoadingGuard { session: self }
    }

    // ===== Accessors =====

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.state().user.clone()
    }

    /// True once a profile has been fetched for the current credential
    pub fn is_authenticated(&self) -> bool {
        self.state().user.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading > 0
    }

    pub fn credential(&self) -> Option<Credential> {
        self.state().credential.clone()
    }

    /// The most recent user-facing error message
    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.state().last_error = None;
    }

    fn epoch(&self) -> u64 {
        self.state().epoch
    }

    fn set_error(&self, err: &SessionError) {
        self.state().last_error = Some(err.to_string());
    }

    /// The pending proactive refresh, if one is scheduled
    pub fn scheduled_refresh(&self) -> Option<ScheduledRefresh> {
        self.inner.timer.scheduled()
    }

    /// Stop background work. Call when the owner of the session goes away.
    pub fn shutdown(&self) {
        self.inner.timer.cancel();
    }

    // ===== Lifecycle =====

    /// Restore the session persisted by a previous run.
    ///
    /// Returns whether the user ended up signed in. A stored token the API
    /// rejects gets one refresh attempt; if that fails too, the stored
    /// credential is wiped.
    pub async fn initialize(&self) -> Result<bool, SessionError> {
        let _loading = self.begin_loading();

        let stored = match credential::load(self.storage()) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                let err = SessionError::from(e);
                self.set_error(&err);
                return Err(err);
            }
        };

        let Some(stored) = stored else {
            debug!("No stored session");
            return Ok(false);
        };

        let legacy = stored.is_legacy();
        let cred = stored.into_credential();
        let epoch = {
            let mut state = self.state();
            state.credential = Some(cred.clone());
            state.epoch
        };

        match self.inner.api.fetch_profile(&cred.authorization()).await {
            Ok(user) => {
                if legacy {
                    info!("Migrating legacy token to current storage layout");
                    if !self.install_credential(&cred, epoch)? {
                        return Ok(false);
                    }
                }
                info!(user = %user.username, "Restored session");
                if !self.set_user(user, epoch) {
                    debug!("Session cleared during restore");
                    return Ok(false);
                }
                if !legacy {
                    self.schedule_refresh(cred.refresh_delay());
                }
                Ok(true)
            }
            Err(e) => {
                debug!(error = %e, "Stored token rejected, attempting refresh");
                if self.refresh_shared().await.is_err() {
                    self.clear_session();
                    return Ok(false);
                }
                if self.is_authenticated() {
                    return Ok(true);
                }

                let authorization = self.credential().map(|c| c.authorization());
                let Some(authorization) = authorization else {
                    self.clear_session();
                    return Ok(false);
                };
                match self.inner.api.fetch_profile(&authorization).await {
                    Ok(user) => {
                        info!(user = %user.username, "Restored session after refresh");
                        Ok(self.set_user(user, epoch))
                    }
                    Err(e) => {
                        warn!(error = %e, "Profile fetch failed after refresh, clearing session");
                        self.clear_session();
                        Ok(false)
                    }
                }
            }
        }
    }

    /// Sign in and load the user's profile.
    ///
    /// Any failure leaves the session signed out with the error recorded.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, SessionError> {
        let _loading = self.begin_loading();
        self.clear_error();

        match self.login_inner(email, password).await {
            Ok(user) => {
                info!(user = %user.username, "Logged in");
                Ok(user)
            }
            Err(err) => {
                warn!(error = %err, "Login failed");
                self.clear_session();
                self.set_error(&err);
                Err(err)
            }
        }
    }

    async fn login_inner(&self, email: &str, password: &str) -> Result<UserProfile, SessionError> {
        let epoch = self.epoch();
        let bundle = self.inner.api.login(email, password).await?;
        let cred = Credential::from_bundle(bundle, None)?;
        if !self.install_credential(&cred, epoch)? {
            return Err(SessionError::AuthenticationRequired);
        }

        let user = self.inner.api.fetch_profile(&cred.authorization()).await?;
        if !self.set_user(user.clone(), epoch) {
            return Err(SessionError::AuthenticationRequired);
        }
        Ok(user)
    }

    /// Create an account. Does not sign the new user in.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Value, SessionError> {
        let _loading = self.begin_loading();
        self.clear_error();

        self.inner.api.register(request).await.map_err(|e| {
            let err = SessionError::from(e);
            warn!(error = %err, "Registration failed");
            self.set_error(&err);
            err
        })
    }

    /// Sign out. The server is told on a best-effort basis; local state is
    /// cleared regardless.
    pub async fn logout(&self) {
        self.inner.timer.cancel();

        let authorization = credential::stored_authorization(self.storage())
            .ok()
            .flatten()
            .or_else(|| self.credential().map(|c| c.authorization()));

        if let Some(authorization) = authorization {
            if let Err(e) = self.inner.api.logout(&authorization).await {
                warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }

        self.clear_session();
        self.clear_error();
        info!("Logged out");
    }

    /// Persist `cred`, make it current and schedule its refresh.
    ///
    /// Returns `false` without touching anything if the session was cleared
    /// after `epoch` was read. The state lock is held throughout so a
    /// concurrent clear either sees this write or makes it a no-op.
    fn install_credential(&self, cred: &Credential, epoch: u64) -> Result<bool, SessionError> {
        let mut state = self.state();
        if state.epoch != epoch {
            debug!("Session cleared while a credential was pending, discarding it");
            return Ok(false);
        }
        cred.persist(self.storage())?;
        state.credential = Some(cred.clone());
        self.schedule_refresh(cred.refresh_delay());
        Ok(true)
    }

    /// Set the current user unless the session was cleared since `epoch`
    fn set_user(&self, user: UserProfile, epoch: u64) -> bool {
        let mut state = self.state();
        if state.epoch != epoch {
            return false;
        }
        state.user = Some(user);
        true
    }

    /// Drop every trace of the credential, in memory and in storage.
    /// In-flight refreshes and logins see the new epoch and discard their
    /// results.
    fn clear_session(&self) {
        {
            let mut state = self.state();
            state.epoch += 1;
            state.credential = None;
            state.user = None;
        }
        self.inner.timer.cancel();
        if let Err(e) = Credential::clear(self.storage()) {
            warn!(error = %e, "Failed to clear stored credential");
        }
    }

    fn expire_session(&self) -> SessionError {
        self.clear_session();
        let err = SessionError::SessionExpired;
        self.set_error(&err);
        err
    }

    // ===== Refresh =====

    /// Exchange the stored refresh token for a new access token.
    ///
    /// Returns the new access token, or `None` if the refresh failed. The
    /// failure is recorded in [`last_error`](Self::last_error).
    pub async fn refresh(&self) -> Option<String> {
        self.refresh_shared().await.ok()
    }

    async fn refresh_shared(&self) -> Result<String, SessionError> {
        let shared = {
            let mut pending = lock(&self.inner.pending_refresh);
            match pending.as_ref() {
                Some(in_flight) => {
                    debug!("Joining in-flight token refresh");
                    in_flight.clone()
                }
                None => {
                    let session = self.clone();
                    let refresh = async move {
                        let result = session.perform_refresh().await;
                        *lock(&session.inner.pending_refresh) = None;
                        result
                    }
                    .boxed()
                    .shared();
                    *pending = Some(refresh.clone());
                    refresh
                }
            }
        };
        shared.await
    }

    async fn perform_refresh(&self) -> Result<String, SessionError> {
        let epoch = self.epoch();
        // Always read from storage: another caller may have rotated the token
        let refresh_token = match credential::stored_refresh_token(self.storage()) {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!("No refresh token stored, ending session");
                return Err(self.expire_session());
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.set_error(&err);
                return Err(err);
            }
        };

        debug!("Refreshing access token");
        let response = self.inner.api.refresh(&refresh_token).await;
        if self.epoch() != epoch {
            debug!("Session ended during refresh, discarding result");
            return Err(SessionError::AuthenticationRequired);
        }
        let cred = match response.and_then(|bundle| Credential::from_bundle(bundle, Some(&refresh_token))) {
            Ok(cred) => cred,
            Err(e) => return Err(self.handle_refresh_failure(e)),
        };

        match self.install_credential(&cred, epoch) {
            Ok(true) => {}
            Ok(false) => return Err(SessionError::AuthenticationRequired),
            Err(err) => {
                self.set_error(&err);
                return Err(err);
            }
        }

        match self.inner.api.fetch_profile(&cred.authorization()).await {
            Ok(user) => {
                if !self.set_user(user, epoch) {
                    debug!("Session ended during profile reload, discarding result");
                    return Err(SessionError::AuthenticationRequired);
                }
            }
            Err(e) => warn!(error = %e, "Profile reload after refresh failed"),
        }

        self.clear_error();
        info!(expires_in = cred.expires_in, "Access token refreshed");
        Ok(cred.access_token)
    }

    fn handle_refresh_failure(&self, err: ApiError) -> SessionError {
        match SessionError::from_refresh_failure(&err) {
            SessionError::SessionExpired => {
                warn!(error = %err, "Refresh token rejected, ending session");
                self.expire_session()
            }
            other => {
                warn!(error = %err, "Token refresh failed, keeping session");
                self.set_error(&other);
                other
            }
        }
    }

    fn schedule_refresh(&self, delay: Duration) {
        let session = Arc::downgrade(&self.inner);
        self.inner.timer.schedule(delay, async move {
            if let Some(inner) = session.upgrade() {
                SessionManager { inner }.run_scheduled_refresh().await;
            }
        });
    }

    async fn run_scheduled_refresh(&self) {
        debug!("Proactive refresh timer fired");
        if self.refresh_shared().await.is_ok() {
            return;
        }

        match credential::stored_refresh_token(self.storage()) {
            Ok(Some(_)) => {
                info!(retry_secs = REFRESH_RETRY_DELAY.as_secs(), "Proactive refresh failed, will retry");
                self.schedule_retry();
            }
            _ => debug!("No refresh token left, not retrying"),
        }
    }

    /// One retry of a failed proactive refresh. A failed retry does not
    /// schedule another.
    fn schedule_retry(&self) {
        let session = Arc::downgrade(&self.inner);
        self.inner.timer.schedule(REFRESH_RETRY_DELAY, async move {
            if let Some(inner) = session.upgrade() {
                let session = SessionManager { inner };
                if credential::stored_refresh_token(session.storage()).ok().flatten().is_some() {
                    session.refresh_shared().await.ok();
                }
            }
        });
    }

    // ===== Authenticated Requests =====

    async fn send(
        &self,
        method: Method,
        path: &str,
        authorization: &str,
        body: Option<&Value>,
    ) -> Result<Response, SessionError> {
        self.inner
            .api
            .send(method, path, authorization, body)
            .await
            .map_err(|e| {
                warn!(path = path, error = %e, "Request failed");
                let err = SessionError::from(e);
                self.set_error(&err);
                err
            })
    }

    /// Send a request with the current token, refreshing and retrying once
    /// on 401.
    ///
    /// Only 401 is handled here; every other status is returned to the
    /// caller untouched.
    pub async fn authenticated_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, SessionError> {
        let Some(authorization) = credential::stored_authorization(self.storage())? else {
            let err = SessionError::AuthenticationRequired;
            self.set_error(&err);
            return Err(err);
        };

        let response = self.send(method.clone(), path, &authorization, body).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        debug!(path = path, "Request unauthorized, refreshing token");

        // A concurrent caller may have rotated the token while this request was in flight
        let retry_authorization = match credential::stored_authorization(self.storage())? {
            Some(current) if current != authorization => current,
            _ => {
                if credential::stored_refresh_token(self.storage())?.is_none() {
                    return Err(self.expire_session());
                }
                if self.refresh_shared().await.is_err() {
                    return Err(self.expire_session());
                }
                match self.credential() {
                    Some(cred) => cred.authorization(),
                    None => return Err(self.expire_session()),
                }
            }
        };

        let retry = self.send(method, path, &retry_authorization, body).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(path = path, "Request still unauthorized after refresh");
            return Err(self.expire_session());
        }
        Ok(retry)
    }

    /// Update the signed-in user's profile
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, SessionError> {
        if update.is_empty() {
            return Err(SessionError::Validation("Nothing to update".to_string()));
        }
        let body = ApiClient::profile_update_body(update)?;

        let response = self
            .authenticated_request(Method::PUT, ApiClient::profile_path(), Some(&body))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = SessionError::from(ApiError::from_status(status, &text));
            self.set_error(&err);
            return Err(err);
        }

        let value: Value = response.json().await.map_err(|e| SessionError::from(ApiError::from(e)))?;
        let user = UserProfile::from_response(&value)?;
        self.state().user = Some(user.clone());
        self.clear_error();
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn profile_json() -> Value {
        json!({"id": 1, "username": "ada", "email": "ada@example.com", "role": "author"})
    }

    fn session_with(server: &MockServer, storage: Arc<MemoryStorage>, timeout: Duration) -> SessionManager {
        let api = ApiClient::new(&server.uri(), timeout).expect("client should build");
        SessionManager::new(api, storage)
    }

    #[tokio::test]
    async fn test_failed_timer_refresh_keeps_state_and_schedules_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_json()))
            .mount(&server)
            .await;
        // Slower than the client timeout, so the refresh fails at the transport level
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "NEW"}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::with_entries(&[
            ("access_token", "OLD"),
            ("refresh_token", "R1"),
            ("token_type", "Bearer"),
            ("expires_in", "900"),
        ]));
        let session = session_with(&server, Arc::clone(&storage), Duration::from_millis(300));
        assert!(session.initialize().await.expect("initialize"));
        let before = storage.snapshot();

        session.run_scheduled_refresh().await;

        assert!(session.is_authenticated());
        assert_eq!(storage.snapshot(), before);
        assert_eq!(
            session.last_error().as_deref(),
            Some(crate::auth::error::NETWORK_ERROR_MESSAGE)
        );
        let scheduled = session.scheduled_refresh().expect("retry scheduled");
        assert_eq!(scheduled.delay, REFRESH_RETRY_DELAY);
        session.shutdown();
    }

    async fn refresh_calls(server: &MockServer) -> usize {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/auth/refresh")
            .count()
    }

    #[tokio::test]
    async fn test_failed_retry_does_not_schedule_another() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({"message": "database down"})))
            .mount(&server)
            .await;

        let storage = Arc::new(MemoryStorage::with_entries(&[
            ("access_token", "OLD"),
            ("refresh_token", "R1"),
            ("token_type", "Bearer"),
            ("expires_in", "900"),
        ]));
        let session = session_with(&server, Arc::clone(&storage), Duration::from_secs(5));
        let before = storage.snapshot();

        session.run_scheduled_refresh().await;
        assert_eq!(refresh_calls(&server).await, 1);
        assert_eq!(
            session.scheduled_refresh().map(|s| s.delay),
            Some(REFRESH_RETRY_DELAY)
        );

        // Jump past the retry delay, then let the retry talk to the server in real time
        tokio::time::pause();
        tokio::time::advance(REFRESH_RETRY_DELAY + Duration::from_secs(1)).await;
        tokio::time::resume();
        for _ in 0..100 {
            if refresh_calls(&server).await == 2 && lock(&session.inner.pending_refresh).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(refresh_calls(&server).await, 2);
        assert!(session.scheduled_refresh().is_none());
        assert_eq!(storage.snapshot(), before);
        assert!(session.last_error().is_some_and(|e| e.contains("database down")));

        // Nothing left to fire
        tokio::time::pause();
        tokio::time::advance(REFRESH_RETRY_DELAY * 4).await;
        tokio::time::resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(refresh_calls(&server).await, 2);
    }

    #[tokio::test]
    async fn test_failed_timer_refresh_without_refresh_token_does_not_retry() {
        let server = MockServer::start().await;
        let storage = Arc::new(MemoryStorage::with_entries(&[("access_token", "OLD")]));
        let session = session_with(&server, storage, Duration::from_secs(5));

        session.run_scheduled_refresh().await;

        assert!(session.scheduled_refresh().is_none());
        assert_eq!(
            session.last_error().as_deref(),
            Some(crate::auth::error::SESSION_EXPIRED_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_loading_flag_resets_after_failed_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({"message": "Invalid email or password"})))
            .mount(&server)
            .await;

        let session = session_with(&server, Arc::new(MemoryStorage::new()), Duration::from_secs(5));
        let err = session.login("a@b.com", "wrong").await.unwrap_err();
        assert_eq!(err, SessionError::Validation("Invalid email or password".into()));
        assert!(!session.is_loading());
        assert!(!session.is_authenticated());
        assert_eq!(session.last_error().as_deref(), Some("Invalid email or password"));
    }
}
