//! REST API client module for the blog backend.
//!
//! This module provides the `ApiClient` for the auth and profile endpoints
//! plus a raw request method used by the session's authenticated wrapper.
//!
//! The API uses bearer-style token authentication; the header value is
//! always `<token_type> <access_token>`.

pub mod client;
pub mod error;

pub use client::{ApiClient, DEFAULT_REQUEST_TIMEOUT_SECS};
pub use error::ApiError;
