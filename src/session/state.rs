//! Owned, versioned session value.

use serde::{Deserialize, Serialize};

use crate::models::{now_ms, Role, SessionTokens, UserInfo};

/// Tokens are treated as expired this long before their stated expiry.
pub const EXPIRY_SKEW_MS: i64 = 5_000;

/// Whether the user allows network activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Mode {
    #[default]
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    Reachable,
    Unreachable(String),
}

impl Default for Connectivity {
    fn default() -> Self {
        Connectivity::Unreachable("not connected".to_string())
    }
}

/// Access and refresh tokens with their expiries in wall-clock ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub access_expires_at: i64,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
}

impl TokenPair {
    pub fn access_valid_at(&self, now: i64) -> bool {
        now + EXPIRY_SKEW_MS < self.access_expires_at
    }

    pub fn refresh_valid_at(&self, now: i64) -> bool {
        now + EXPIRY_SKEW_MS < self.refresh_expires_at
    }
}

impl From<SessionTokens> for TokenPair {
    fn from(tokens: SessionTokens) -> Self {
        Self {
            access_token: tokens.access_token,
            access_expires_at: tokens.access_expires_at.timestamp_millis(),
            refresh_token: tokens.refresh_token,
            refresh_expires_at: tokens.refresh_expires_at.timestamp_millis(),
        }
    }
}

/// Authentication state of the device.
///
/// Identity is bound when both a profile and a token pair are present.
/// Every mutation goes through [`SessionState::mutate`], which bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default)]
    pub version: u64,
    pub profile: Option<UserInfo>,
    pub tokens: Option<TokenPair>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(skip)]
    pub connectivity: Connectivity,
    #[serde(default)]
    pub role: Role,
}

impl SessionState {
    pub fn is_bound(&self) -> bool {
        self.profile.is_some() && self.tokens.is_some()
    }

    pub fn is_reachable(&self) -> bool {
        self.connectivity == Connectivity::Reachable
    }

    /// Whether network activity is allowed right now.
    pub fn is_online(&self, require_full_access: bool) -> bool {
        self.is_bound()
            && self.mode == Mode::Online
            && self.is_reachable()
            && (!require_full_access || self.role != Role::Restricted)
    }

    /// Why [`is_online`](Self::is_online) is false, for reports and logs.
    pub fn offline_reason(&self, require_full_access: bool) -> Option<String> {
        if !self.is_bound() {
            Some("not logged in".to_string())
        } else if self.mode == Mode::Offline {
            Some("offline mode".to_string())
        } else if let Connectivity::Unreachable(reason) = &self.connectivity {
            Some(format!("server unreachable: {reason}"))
        } else if require_full_access && self.role == Role::Restricted {
            Some("account is restricted".to_string())
        } else {
            None
        }
    }

    pub fn refresh_expired(&self) -> bool {
        self.tokens
            .as_ref()
            .is_some_and(|t| !t.refresh_valid_at(now_ms()))
    }

    pub(crate) fn mutate(mut self, f: impl FnOnce(&mut Self)) -> Self {
        f(&mut self);
        self.version += 1;
        self
    }

    pub(crate) fn bind(self, user: UserInfo, tokens: TokenPair) -> Self {
        self.mutate(|s| {
            s.role = user.role;
            s.profile = Some(user);
            s.tokens = Some(tokens);
            s.connectivity = Connectivity::Reachable;
        })
    }

    pub(crate) fn clear_tokens(self) -> Self {
        self.mutate(|s| s.tokens = None)
    }

    pub(crate) fn unreachable(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.mutate(|s| s.connectivity = Connectivity::Unreachable(reason))
    }

    pub(crate) fn reachable(self) -> Self {
        if self.is_reachable() {
            return self;
        }
        self.mutate(|s| s.connectivity = Connectivity::Reachable)
    }
}

/// Result of a session operation: the next state and what happened.
#[derive(Debug)]
pub struct Transition<T = ()> {
    pub state: SessionState,
    pub outcome: Result<T, crate::errors::SessionError>,
}

impl<T> Transition<T> {
    pub fn ok(state: SessionState, value: T) -> Self {
        Self {
            state,
            outcome: Ok(value),
        }
    }

    pub fn fail(state: SessionState, error: crate::errors::SessionError) -> Self {
        Self {
            state,
            outcome: Err(error),
        }
    }

    pub fn into_parts(self) -> (SessionState, Result<T, crate::errors::SessionError>) {
        (self.state, self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: Role) -> UserInfo {
        UserInfo {
            id: 1,
            username: "alex".to_string(),
            displayname: "alex".to_string(),
            email: "alex@example.com".to_string(),
            email_confirmed: false,
            role,
        }
    }

    fn tokens() -> TokenPair {
        let now = now_ms();
        TokenPair {
            access_token: "a".to_string(),
            access_expires_at: now + 60_000,
            refresh_token: "r".to_string(),
            refresh_expires_at: now + 3_600_000,
        }
    }

    #[test]
    fn test_online_requires_every_condition() {
        let state = SessionState::default();
        assert!(!state.is_online(false));
        assert_eq!(state.offline_reason(false).as_deref(), Some("not logged in"));

        let state = state.bind(user(Role::Normal), tokens());
        assert!(state.is_online(true));

        let offline = state.clone().mutate(|s| s.mode = Mode::Offline);
        assert!(!offline.is_online(false));

        let unreachable = state.clone().unreachable("timeout");
        assert!(!unreachable.is_online(false));

        let restricted = SessionState::default().bind(user(Role::Restricted), tokens());
        assert!(restricted.is_online(false));
        assert!(!restricted.is_online(true));
        assert_eq!(
            restricted.offline_reason(true).as_deref(),
            Some("account is restricted")
        );
    }

    #[test]
    fn test_mutations_bump_version() {
        let state = SessionState::default();
        let state = state.bind(user(Role::Normal), tokens());
        assert_eq!(state.version, 1);
        let state = state.clear_tokens();
        assert_eq!(state.version, 2);
        assert!(!state.is_bound());
        assert!(state.profile.is_some());
    }

    #[test]
    fn test_connectivity_is_not_persisted() {
        let state = SessionState::default().bind(user(Role::Elevated), tokens());
        let text = serde_json::to_string(&state).unwrap();
        let restored: SessionState = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.connectivity, Connectivity::default());
        assert_eq!(restored.role, Role::Elevated);
        assert_eq!(restored.tokens, state.tokens);
    }

    #[test]
    fn test_state_without_version_loads() {
        let text = r#"{"profile":null,"tokens":{"accessToken":"a","accessExpiresAt":1,"refreshToken":"r","refreshExpiresAt":2}}"#;
        let restored: SessionState = serde_json::from_str(text).unwrap();
        assert_eq!(restored.version, 0);
        assert_eq!(restored.tokens.map(|t| t.refresh_token).as_deref(), Some("r"));
        assert_eq!(restored.mode, Mode::Online);
    }

    #[test]
    fn test_token_expiry_skew() {
        let pair = TokenPair {
            access_expires_at: 10_000,
            refresh_expires_at: 20_000,
            ..tokens()
        };
        assert!(pair.access_valid_at(4_000));
        assert!(!pair.access_valid_at(5_000));
        assert!(pair.refresh_valid_at(14_999));
        assert!(!pair.refresh_valid_at(15_000));
    }
}
