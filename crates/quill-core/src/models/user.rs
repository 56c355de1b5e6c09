use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::ApiError;

fn default_role() -> String {
    "user".to_string()
}

/// The signed-in author, as returned by `GET /profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    pub profile_image_url: Option<String>,
    pub bio: Option<String>,
}

impl UserProfile {
    /// Parse a profile response body.
    ///
    /// The API has returned the user bare, under `user`, under `data`, and
    /// under `data.user`; field names show up in both snake_case and
    /// camelCase. Each shape is tried in turn.
    pub fn from_response(body: &Value) -> Result<Self, ApiError> {
        let obj = Self::unwrap_envelope(body).ok_or_else(|| {
            ApiError::InvalidResponse("Profile response is not a JSON object".to_string())
        })?;
        Self::from_object(obj).ok_or_else(|| {
            ApiError::InvalidResponse("Profile response has no user id or email".to_string())
        })
    }

    fn unwrap_envelope(body: &Value) -> Option<&Map<String, Value>> {
        let root = body.as_object()?;
        if let Some(user) = root.get("user").and_then(Value::as_object) {
            return Some(user);
        }
        if let Some(data) = root.get("data").and_then(Value::as_object) {
            if let Some(user) = data.get("user").and_then(Value::as_object) {
                return Some(user);
            }
            return Some(data);
        }
        Some(root)
    }

    fn from_object(obj: &Map<String, Value>) -> Option<Self> {
        let id = first_id(obj, &["id", "_id", "user_id", "userId"]);
        let email = first_str(obj, &["email", "emailAddress"]).unwrap_or_default();
        if id.is_none() && email.is_empty() {
            return None;
        }

        // Fall back to the email local part when the API omits a username
        let username = first_str(obj, &["username", "userName", "name"]).unwrap_or_else(|| {
            email.split('@').next().unwrap_or_default().to_string()
        });

        Some(Self {
            id: id.unwrap_or_else(|| email.clone()),
            username,
            email,
            first_name: first_str(obj, &["first_name", "firstName"]),
            last_name: first_str(obj, &["last_name", "lastName"]),
            role: first_str(obj, &["role"]).unwrap_or_else(default_role),
            profile_image_url: first_str(
                obj,
                &["profile_image_url", "profileImageUrl", "profile_image", "avatar_url", "avatarUrl", "avatar"],
            ),
            bio: first_str(obj, &["bio"]),
        })
    }

    /// Full name if the profile has one, otherwise the username
    pub fn display_name(&self) -> String {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if full.is_empty() {
            self.username.clone()
        } else {
            full
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.eq_ignore_ascii_case("admin")
    }
}

fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_id(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| obj.get(*k)).find_map(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Fields accepted by `PUT /profile`. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.bio.is_none()
            && self.profile_image_url.is_none()
    }
}

/// Body for `POST /auth/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}
