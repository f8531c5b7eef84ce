//! Account and session shapes shared by the server and the session manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Account role. Restricted accounts may sign in but do not sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[default]
    #[serde(rename = "user")]
    Normal,
    #[serde(rename = "admin")]
    Elevated,
    #[serde(rename = "limited")]
    Restricted,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Normal => "user",
            Role::Elevated => "admin",
            Role::Restricted => "limited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::Normal),
            "admin" => Some(Role::Elevated),
            "limited" => Some(Role::Restricted),
            _ => None,
        }
    }
}

/// Public profile of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
    pub displayname: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub email_confirmed: bool,
    pub role: Role,
}

/// A freshly issued token pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub session_id: i64,
    pub session_token_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

/// `data` of login, register and refresh responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub user: UserInfo,
    pub session: SessionTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Username or email address.
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// An active session line of an account, as listed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// Token pairs of the line that are still usable.
    pub active_tokens: i64,
    /// Whether the listing was requested from this line.
    #[serde(default)]
    pub current: bool,
}
