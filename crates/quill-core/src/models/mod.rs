//! Data models for the blog API.
//!
//! - `UserProfile`: the signed-in author, tolerant of the API's several
//!   response shapes
//! - `ProfileUpdate`, `RegisterRequest`: request bodies
//! - `TokenBundle`: login/refresh token payload

pub mod token;
pub mod user;

pub use token::{TokenBundle, MAX_EXPIRES_IN_SECS};
pub use user::{ProfileUpdate, RegisterRequest, UserProfile};
