//! Authentication module for managing the signed-in user's session.
//!
//! This module provides:
//! - `SessionManager`: login/logout, single-flight token refresh, a
//!   proactive refresh timer and the authenticated request wrapper
//! - `Credential`: the access/refresh token pair and its storage layout
//! - `CredentialStorage`: durable storage backends (file, OS keychain, memory)
//!
//! Access tokens are refreshed at 75% of their lifetime and again whenever
//! the API answers 401.

pub mod credential;
pub mod error;
pub mod session;
pub mod storage;
pub mod timer;

pub use credential::{Credential, StoredCredential, DEFAULT_EXPIRES_IN_SECS};
pub use error::{SessionError, NETWORK_ERROR_MESSAGE, SESSION_EXPIRED_MESSAGE};
pub use session::{SessionManager, REFRESH_RETRY_DELAY};
pub use storage::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage, StorageError};
pub use timer::{RefreshTimer, ScheduledRefresh};
