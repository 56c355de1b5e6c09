//! Core library for quill, the command-line client for the blog API.
//!
//! The centre of the crate is [`auth::SessionManager`], which keeps the
//! signed-in user's tokens fresh and wraps authenticated requests. The rest
//! supports it: the REST client, profile models, credential storage and
//! configuration.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;

pub use api::{ApiClient, ApiError};
pub use auth::{SessionError, SessionManager};
pub use config::Config;
pub use models::{ProfileUpdate, RegisterRequest, UserProfile};
pub use reqwest;
