//! Authenticated request/response channel to the sync server.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::ChannelError;
use crate::models::{
    AuthPayload, LoginRequest, RegisterRequest, ServerResponse, SessionInfo, Status, SyncDownData,
    SyncDownQuery, SyncUpRequest, SyncUpResult, UserInfo,
};

/// Longest server message kept when the body is not an envelope.
const MAX_RAW_MESSAGE: usize = 200;

/// HTTP client for the `/api` endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ChannelError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Unreachable(format!("Failed to build client: {}", e)))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthPayload, ChannelError> {
        let data = self
            .send(self.http.post(self.url("/api/auth/login")).json(request))
            .await?;
        decode_data(data)
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<AuthPayload, ChannelError> {
        let data = self
            .send(self.http.post(self.url("/api/auth/register")).json(request))
            .await?;
        decode_data(data)
    }

    /// Exchange a refresh token for a rotated token pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthPayload, ChannelError> {
        let data = self
            .send(
                self.http
                    .get(self.url("/api/auth/refresh"))
                    .bearer_auth(refresh_token),
            )
            .await?;
        decode_data(data)
    }

    pub async fn logout(&self, access_token: &str) -> Result<(), ChannelError> {
        self.send(
            self.http
                .post(self.url("/api/auth/logout"))
                .bearer_auth(access_token),
        )
        .await?;
        Ok(())
    }

    pub async fn current_user(&self, access_token: &str) -> Result<UserInfo, ChannelError> {
        let data = self
            .send(
                self.http
                    .get(self.url("/api/auth/self"))
                    .bearer_auth(access_token),
            )
            .await?;
        decode_data(data)
    }

    /// Active session lines of the account behind the access token.
    pub async fn sessions(&self, access_token: &str) -> Result<Vec<SessionInfo>, ChannelError> {
        let data = self
            .send(
                self.http
                    .get(self.url("/api/user/sessions"))
                    .bearer_auth(access_token),
            )
            .await?;
        decode_data(data)
    }

    pub async fn revoke_session(
        &self,
        access_token: &str,
        session_id: i64,
    ) -> Result<(), ChannelError> {
        self.send(
            self.http
                .delete(self.url(&format!("/api/user/session/{}", session_id)))
                .bearer_auth(access_token),
        )
        .await?;
        Ok(())
    }

    pub async fn sync_up(
        &self,
        access_token: &str,
        request: &SyncUpRequest,
    ) -> Result<SyncUpResult, ChannelError> {
        let data = self
            .send(
                self.http
                    .post(self.url("/api/sync/up"))
                    .bearer_auth(access_token)
                    .json(request),
            )
            .await?;
        // An "ok" without data means nothing failed.
        Ok(match data {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| ChannelError::Malformed(e.to_string()))?,
            None => SyncUpResult::default(),
        })
    }

    pub async fn sync_down(
        &self,
        access_token: &str,
        query: &SyncDownQuery,
    ) -> Result<SyncDownData, ChannelError> {
        let data = self
            .send(
                self.http
                    .get(self.url("/api/sync/down"))
                    .bearer_auth(access_token)
                    .query(query),
            )
            .await?;
        decode_data(data)
    }

    /// Send a request and unwrap the response envelope.
    async fn send(&self, request: RequestBuilder) -> Result<Option<Value>, ChannelError> {
        let response = request.send().await?;
        let code = response.status();
        let body = response.text().await?;

        let envelope = match serde_json::from_str::<ServerResponse>(&body) {
            Ok(envelope) => envelope,
            Err(_) if !code.is_success() => {
                return Err(ChannelError::Status {
                    code: code.as_u16(),
                    message: body.chars().take(MAX_RAW_MESSAGE).collect(),
                });
            }
            Err(e) => return Err(ChannelError::Malformed(e.to_string())),
        };

        if !code.is_success() || envelope.status == Status::Error {
            tracing::debug!("Server answered {}: {}", code, envelope.message_text());
            return Err(ChannelError::Status {
                code: code.as_u16(),
                message: envelope.message_text(),
            });
        }

        Ok(envelope.data)
    }
}

fn decode_data<T: DeserializeOwned>(data: Option<Value>) -> Result<T, ChannelError> {
    let value = data.ok_or_else(|| ChannelError::Malformed("response has no data".to_string()))?;
    serde_json::from_value(value).map_err(|e| ChannelError::Malformed(e.to_string()))
}
