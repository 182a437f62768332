//! HTTP Collaborators
//!
//! Identity, assignment and history over the chat backend's REST API.
//!
//! # Endpoints
//!
//! - `POST /api/auth/anonymous` - requester identity (`{guestId, agentId}`,
//!   `503` while no responder is free)
//! - `POST /api/auth/login` - responder login (basic auth; username is the ID)
//! - `GET /api/assignment/{id}` - responder's current requester (`{guestId}`)
//! - `POST /api/assignment/free/{id}` - release a responder
//! - `POST /api/assignment/guest/{id}` - release a requester
//! - `GET /api/messages?userId={id}` - stored history

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{AssignmentService, HistoryService, IdentityGrant, IdentityService, ServiceError};
use crate::messages::{ChatMessage, Role};

/// Default REST base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnonymousResponse {
    #[serde(default)]
    guest_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignmentResponse {
    #[serde(default)]
    guest_id: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn status_error(status: u16, body: &str) -> ServiceError {
    match status {
        401 | 403 => ServiceError::Unauthorized(format!("HTTP {status}")),
        _ => ServiceError::Request(format!("HTTP {status}: {}", body.trim())),
    }
}

/// Interpret an anonymous-identity response
///
/// A `503` means the requester was queued without a counterpart. The body is
/// plain text in that case unless the backend includes a `guestId`.
pub fn parse_identity(status: u16, body: &str) -> Result<IdentityGrant, ServiceError> {
    match status {
        200..=299 => {
            let parsed: AnonymousResponse =
                serde_json::from_str(body).map_err(|e| ServiceError::Decode(e.to_string()))?;
            let local_id = non_empty(parsed.guest_id)
                .ok_or_else(|| ServiceError::Decode("response carries no guestId".to_string()))?;
            Ok(IdentityGrant {
                local_id,
                peer_id: non_empty(parsed.agent_id),
            })
        }
        503 => {
            let local_id = serde_json::from_str::<AnonymousResponse>(body)
                .ok()
                .and_then(|parsed| non_empty(parsed.guest_id));
            Err(ServiceError::Unavailable {
                local_id,
                detail: body.trim().to_string(),
            })
        }
        _ => Err(status_error(status, body)),
    }
}

/// Interpret an assignment lookup response
pub fn parse_assignment(status: u16, body: &str) -> Result<Option<String>, ServiceError> {
    match status {
        200..=299 => {
            let parsed: AssignmentResponse =
                serde_json::from_str(body).map_err(|e| ServiceError::Decode(e.to_string()))?;
            Ok(non_empty(parsed.guest_id))
        }
        _ => Err(status_error(status, body)),
    }
}

/// Interpret a history response
pub fn parse_history(status: u16, body: &str) -> Result<Vec<ChatMessage>, ServiceError> {
    match status {
        200..=299 => serde_json::from_str(body).map_err(|e| ServiceError::Decode(e.to_string())),
        _ => Err(status_error(status, body)),
    }
}

/// Interpret a response whose body does not matter
pub fn parse_ack(status: u16, body: &str) -> Result<(), ServiceError> {
    match status {
        200..=299 => Ok(()),
        _ => Err(status_error(status, body)),
    }
}

/// Collaborators backed by the chat backend's REST API
#[derive(Clone)]
pub struct HttpServices {
    base_url: String,
    credentials: Option<(String, String)>,
    http_client: reqwest::Client,
}

impl HttpServices {
    /// Create a client for `base_url`
    ///
    /// `credentials` are the responder's username and password; requesters
    /// need none.
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<(String, String)>,
    ) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            http_client,
        })
    }

    /// Get the base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials {
            Some((ref user, ref pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<(u16, String), ServiceError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ServiceError::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Request(e.to_string()))?;
        Ok((status, body))
    }

    async fn login(&self) -> Result<IdentityGrant, ServiceError> {
        let Some((ref username, _)) = self.credentials else {
            return Err(ServiceError::Unauthorized(
                "responder credentials not configured".to_string(),
            ));
        };
        let (status, body) = self
            .execute(self.http_client.post(self.url("/api/auth/login")))
            .await?;
        parse_ack(status, &body)?;
        tracing::info!(username = %username, "Responder logged in");
        Ok(IdentityGrant {
            local_id: username.clone(),
            peer_id: None,
        })
    }
}

#[async_trait]
impl IdentityService for HttpServices {
    async fn create_identity(&self, role: Role) -> Result<IdentityGrant, ServiceError> {
        match role {
            Role::Requester => {
                let (status, body) = self
                    .execute(self.http_client.post(self.url("/api/auth/anonymous")))
                    .await?;
                tracing::debug!(status, "Anonymous identity response");
                parse_identity(status, &body)
            }
            Role::Responder => self.login().await,
        }
    }
}

#[async_trait]
impl AssignmentService for HttpServices {
    async fn get_assignment(&self, local_id: &str) -> Result<Option<String>, ServiceError> {
        let (status, body) = self
            .execute(
                self.http_client
                    .get(self.url(&format!("/api/assignment/{local_id}"))),
            )
            .await?;
        parse_assignment(status, &body)
    }

    async fn release_assignment(&self, local_id: &str, role: Role) -> Result<(), ServiceError> {
        let path = match role {
            Role::Responder => format!("/api/assignment/free/{local_id}"),
            Role::Requester => format!("/api/assignment/guest/{local_id}"),
        };
        let (status, body) = self.execute(self.http_client.post(self.url(&path))).await?;
        parse_ack(status, &body)
    }
}

#[async_trait]
impl HistoryService for HttpServices {
    async fn get_history(&self, local_id: &str) -> Result<Vec<ChatMessage>, ServiceError> {
        let (status, body) = self
            .execute(
                self.http_client
                    .get(self.url("/api/messages"))
                    .query(&[("userId", local_id)]),
            )
            .await?;
        parse_history(status, &body)
    }
}
