//! Session manager: owns authentication state and gates server access.
//!
//! Operations take the current [`SessionState`] by value and hand back a
//! [`Transition`] with the next state. Refreshes are single-flight per
//! manager: a caller queued behind a rotation of a refresh token it holds
//! adopts the newest pair of that rotation chain instead of presenting a
//! spent token again.

mod state;

pub use state::*;

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::channel::ApiClient;
use crate::errors::{ChannelError, SessionError, StoreError};
use crate::models::{now_ms, LoginRequest, RegisterRequest, Role, SessionInfo, UserInfo};
use crate::store::{keys, LocalStore};

/// Rotations remembered for callers still holding an older pair.
const ROTATION_HISTORY: usize = 16;

/// A successful rotation, keyed by the refresh token it consumed.
struct Rotation {
    from: String,
    tokens: TokenPair,
    user: UserInfo,
}

#[derive(Default)]
struct RotationLog {
    rotations: VecDeque<Rotation>,
}

impl RotationLog {
    fn record(&mut self, rotation: Rotation) {
        if self.rotations.len() == ROTATION_HISTORY {
            self.rotations.pop_front();
        }
        self.rotations.push_back(rotation);
    }

    /// Follow the chain of rotations starting at `refresh_token` to its newest pair.
    fn latest_from(&self, refresh_token: &str) -> Option<&Rotation> {
        let find = |from: &str| self.rotations.iter().find(|r| r.from == from);
        let mut latest = find(refresh_token)?;
        while let Some(next) = find(&latest.tokens.refresh_token) {
            latest = next;
        }
        Some(latest)
    }
}

pub struct SessionManager {
    channel: ApiClient,
    refresh_gate: Mutex<RotationLog>,
}

/// Restore the persisted session. Missing or undecodable state yields the empty state.
pub async fn load_persisted(store: &LocalStore) -> SessionState {
    let raw = match store.get_meta(keys::SESSION).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("Failed to read persisted session: {}", e);
            None
        }
    };

    let state = match raw.map(|text| serde_json::from_str::<SessionState>(&text)) {
        Some(Ok(state)) => state,
        Some(Err(e)) => {
            tracing::warn!("Discarding undecodable persisted session: {}", e);
            SessionState::default()
        }
        None => SessionState::default(),
    };

    if state.refresh_expired() {
        tracing::info!("Persisted refresh token expired, login required");
        return state.clear_tokens();
    }
    state
}

pub async fn persist(store: &LocalStore, state: &SessionState) -> Result<(), StoreError> {
    let text = serde_json::to_string(state)?;
    store.set_meta(keys::SESSION, &text).await
}

impl SessionManager {
    pub fn new(channel: ApiClient) -> Self {
        Self {
            channel,
            refresh_gate: Mutex::new(RotationLog::default()),
        }
    }

    pub fn channel(&self) -> &ApiClient {
        &self.channel
    }

    /// Make sure the access token is usable, refreshing it if needed.
    /// Yields the access token to use.
    pub async fn ensure_fresh_access_token(&self, state: SessionState) -> Transition<String> {
        let Some(tokens) = state.tokens.clone() else {
            return Transition::fail(state, SessionError::NotAuthenticated);
        };

        let now = now_ms();
        if tokens.access_valid_at(now) {
            return Transition::ok(state, tokens.access_token);
        }
        if !tokens.refresh_valid_at(now) {
            tracing::info!("Refresh token expired, logging out");
            return Transition::fail(state.clear_tokens(), SessionError::SessionExpired);
        }

        let mut gate = self.refresh_gate.lock().await;
        let (state, presented) = match gate.latest_from(&tokens.refresh_token) {
            Some(rotation) => {
                tracing::debug!("Adopting token pair rotated by a concurrent refresh");
                let state = state.bind(rotation.user.clone(), rotation.tokens.clone());
                if rotation.tokens.access_valid_at(now_ms()) {
                    let access = rotation.tokens.access_token.clone();
                    return Transition::ok(state, access);
                }
                (state, rotation.tokens.refresh_token.clone())
            }
            None => (state, tokens.refresh_token),
        };

        match self.channel.refresh(&presented).await {
            Ok(payload) => {
                let pair = TokenPair::from(payload.session);
                let access = pair.access_token.clone();
                gate.record(Rotation {
                    from: presented,
                    tokens: pair.clone(),
                    user: payload.user.clone(),
                });
                tracing::debug!("Access token refreshed");
                Transition::ok(state.bind(payload.user, pair), access)
            }
            Err(ChannelError::Status {
                code: 403 | 404, ..
            }) => Transition::fail(
                self.force_logout(state, "Refresh failed. Could not login"),
                SessionError::CouldNotLogin,
            ),
            Err(ChannelError::Malformed(reason)) => {
                tracing::warn!("Malformed refresh response: {}", reason);
                Transition::fail(
                    state.unreachable(reason.clone()),
                    SessionError::Malformed(reason),
                )
            }
            Err(e) => {
                tracing::warn!("Token refresh failed: {}", e);
                let reason = e.to_string();
                Transition::fail(state.unreachable(reason.clone()), SessionError::Unreachable(reason))
            }
        }
    }

    pub async fn login(
        &self,
        state: SessionState,
        username: &str,
        password: &str,
    ) -> Transition<UserInfo> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let result = self.channel.login(&request).await;
        self.bind_credentials(state, result)
    }

    pub async fn register(
        &self,
        state: SessionState,
        username: &str,
        email: &str,
        password: &str,
    ) -> Transition<UserInfo> {
        let request = RegisterRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let result = self.channel.register(&request).await;
        self.bind_credentials(state, result)
    }

    fn bind_credentials(
        &self,
        state: SessionState,
        result: Result<crate::models::AuthPayload, ChannelError>,
    ) -> Transition<UserInfo> {
        match result {
            Ok(payload) => {
                tracing::info!("Logged in as {}", payload.user.username);
                let user = payload.user.clone();
                Transition::ok(state.bind(payload.user, payload.session.into()), user)
            }
            Err(ChannelError::Status { code, message }) if (400..500).contains(&code) => {
                Transition::fail(state.reachable(), SessionError::Rejected(message))
            }
            Err(ChannelError::Malformed(reason)) => Transition::fail(
                state.unreachable(reason.clone()),
                SessionError::Malformed(reason),
            ),
            Err(e) => {
                let reason = e.to_string();
                Transition::fail(state.unreachable(reason.clone()), SessionError::Unreachable(reason))
            }
        }
    }

    /// Refresh if needed, then reload the profile and role from the server.
    pub async fn connect(&self, state: SessionState) -> Transition<UserInfo> {
        if !state.is_bound() {
            return Transition::fail(state, SessionError::NotAuthenticated);
        }

        let (state, access) = match self.ensure_fresh_access_token(state).await.into_parts() {
            (state, Ok(access)) => (state, access),
            (state, Err(e)) => return Transition::fail(state, e),
        };

        match self.channel.current_user(&access).await {
            Ok(user) => {
                let state = state.mutate(|s| {
                    s.role = user.role;
                    s.profile = Some(user.clone());
                    s.connectivity = Connectivity::Reachable;
                });
                Transition::ok(state, user)
            }
            Err(e) if e.is_auth_rejection() => Transition::fail(
                self.force_logout(state, "Session rejected by server"),
                SessionError::CouldNotLogin,
            ),
            Err(e) => {
                let reason = e.to_string();
                Transition::fail(state.unreachable(reason.clone()), SessionError::Unreachable(reason))
            }
        }
    }

    /// Access token for a call made on the user's behalf, refreshed if needed.
    async fn access_for_call(&self, state: SessionState) -> Transition<String> {
        if !state.is_bound() {
            return Transition::fail(state, SessionError::NotAuthenticated);
        }
        if state.mode == Mode::Offline {
            return Transition::fail(state, SessionError::Offline);
        }
        self.ensure_fresh_access_token(state).await
    }

    fn channel_failure<T>(&self, state: SessionState, error: ChannelError) -> Transition<T> {
        let state = self.observe_channel_failure(state, &error);
        let outcome = match error {
            e if e.is_auth_rejection() => SessionError::CouldNotLogin,
            ChannelError::Status { message, .. } => SessionError::Rejected(message),
            ChannelError::Malformed(reason) => SessionError::Malformed(reason),
            ChannelError::Unreachable(reason) => SessionError::Unreachable(reason),
        };
        Transition::fail(state, outcome)
    }

    /// List the account's active session lines.
    pub async fn sessions(&self, state: SessionState) -> Transition<Vec<SessionInfo>> {
        let (state, access) = match self.access_for_call(state).await.into_parts() {
            (state, Ok(access)) => (state, access),
            (state, Err(e)) => return Transition::fail(state, e),
        };

        match self.channel.sessions(&access).await {
            Ok(sessions) => Transition::ok(state.reachable(), sessions),
            Err(e) => self.channel_failure(state, e),
        }
    }

    /// End another session line of the account, e.g. a lost device.
    ///
    /// Revoking the line this device uses signs it out on its next request.
    pub async fn revoke_session(&self, state: SessionState, session_id: i64) -> Transition {
        let (state, access) = match self.access_for_call(state).await.into_parts() {
            (state, Ok(access)) => (state, access),
            (state, Err(e)) => return Transition::fail(state, e),
        };

        match self.channel.revoke_session(&access, session_id).await {
            Ok(()) => {
                tracing::info!("Revoked session {}", session_id);
                Transition::ok(state.reachable(), ())
            }
            // Unknown or foreign line; the caller's own session is fine.
            Err(ChannelError::Status { code: 404, message }) => {
                Transition::fail(state.reachable(), SessionError::Rejected(message))
            }
            Err(e) => self.channel_failure(state, e),
        }
    }

    /// Notify the server (best effort) and drop tokens, profile and role.
    pub async fn logout(&self, state: SessionState) -> Transition {
        if let Some(tokens) = &state.tokens {
            if let Err(e) = self.channel.logout(&tokens.access_token).await {
                tracing::debug!("Logout notification failed: {}", e);
            }
        }
        let state = state.mutate(|s| {
            s.tokens = None;
            s.profile = None;
            s.role = Role::default();
        });
        Transition::ok(state, ())
    }

    /// Drop the tokens after an auth rejection. The profile is kept for re-login.
    pub fn force_logout(&self, state: SessionState, reason: &str) -> SessionState {
        tracing::warn!("Forced logout: {}", reason);
        state.clear_tokens()
    }

    pub fn set_mode(&self, state: SessionState, mode: Mode) -> SessionState {
        if state.mode == mode {
            return state;
        }
        state.mutate(|s| s.mode = mode)
    }

    /// Fold a failed server call made on behalf of this session into its state.
    pub fn observe_channel_failure(&self, state: SessionState, error: &ChannelError) -> SessionState {
        match error {
            e if e.is_auth_rejection() => self.force_logout(state, &e.to_string()),
            ChannelError::Status { code, .. } if *code < 500 => state,
            e => state.unreachable(e.to_string()),
        }
    }
}
