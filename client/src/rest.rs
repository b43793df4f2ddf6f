//! REST collaborators: the snapshot poll endpoint and the command endpoint
//!
//! Both are traits so sessions can run against in-memory fakes; the HTTP
//! implementations use `reqwest` with the session token as a bearer token.

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use shared::{Session, SessionSnapshot};
use std::time::Duration;

use crate::commands::Intent;
use crate::error::SyncError;

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, session: &Session) -> Result<SessionSnapshot, SyncError>;
}

#[async_trait]
pub trait CommandEndpoint: Send + Sync {
    /// Resolves once the authority accepted or rejected the intent
    async fn execute(&self, session: &Session, intent: &Intent) -> Result<(), SyncError>;
}

fn parse_base(base: &str) -> Result<Url, SyncError> {
    let url = Url::parse(base).map_err(|e| SyncError::InvalidEndpoint(format!("{base}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(SyncError::InvalidEndpoint(format!(
            "unsupported scheme `{other}`"
        ))),
    }
}

fn join(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

pub fn snapshot_url(base: &Url, session: &Session) -> String {
    join(
        base,
        &format!(
            "api/{}/{}",
            session.scope.resource_segment(),
            session.session_id
        ),
    )
}

pub fn command_url(base: &Url, session: &Session, intent: &Intent) -> String {
    join(
        base,
        &format!("api/lobbies/{}/{}", session.session_id, intent.action()),
    )
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// Human-readable reason for a refused command
pub fn rejection_reason(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|parsed| parsed.detail)
        .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()))
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

pub struct HttpSnapshotSource {
    client: Client,
    base: Url,
}

impl HttpSnapshotSource {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidEndpoint(e.to_string()))?;
        Ok(Self {
            client,
            base: parse_base(base)?,
        })
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch(&self, session: &Session) -> Result<SessionSnapshot, SyncError> {
        let url = snapshot_url(&self.base, session);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|e| SyncError::SnapshotFetchFailed(e.to_string()))?;

        let status = response.status();
        if is_auth_failure(status) {
            return Err(SyncError::Unauthorized(format!("poll returned HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(SyncError::SnapshotFetchFailed(format!("HTTP {}", status.as_u16())));
        }

        response
            .json::<SessionSnapshot>()
            .await
            .map_err(|e| SyncError::SnapshotFetchFailed(e.to_string()))
    }
}

pub struct HttpCommandEndpoint {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HttpCommandEndpoint {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidEndpoint(e.to_string()))?;
        Ok(Self {
            client,
            base: parse_base(base)?,
            timeout,
        })
    }
}

#[async_trait]
impl CommandEndpoint for HttpCommandEndpoint {
    async fn execute(&self, session: &Session, intent: &Intent) -> Result<(), SyncError> {
        let url = command_url(&self.base, session, intent);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.token)
            .json(&intent.body())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SyncError::CommandTimeout(self.timeout)
                } else {
                    SyncError::ConnectionLost(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if is_auth_failure(status) {
            return Err(SyncError::Unauthorized(format!(
                "{} returned HTTP {}",
                intent.action(),
                status.as_u16()
            )));
        }

        let body = response.text().await.unwrap_or_default();
        Err(SyncError::CommandRejected(rejection_reason(status, &body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_url_per_scope() {
        let base = parse_base("https://play.example.com/").unwrap();
        assert_eq!(
            snapshot_url(&base, &Session::lobby("abc", "p1", "t")),
            "https://play.example.com/api/lobbies/abc"
        );
        assert_eq!(
            snapshot_url(&base, &Session::game("g1", "p1", "t")),
            "https://play.example.com/api/games/g1"
        );
    }

    #[test]
    fn test_command_url_keeps_base_path() {
        let base = parse_base("http://localhost:8000/v1").unwrap();
        let session = Session::lobby("abc", "p1", "t");
        assert_eq!(
            command_url(&base, &session, &Intent::Kick { slot: 2 }),
            "http://localhost:8000/v1/api/lobbies/abc/kick"
        );
    }

    #[test]
    fn test_rejection_reason_prefers_detail() {
        assert_eq!(
            rejection_reason(StatusCode::BAD_REQUEST, r#"{"detail":"Only the host can start"}"#),
            "Only the host can start"
        );
        assert_eq!(
            rejection_reason(StatusCode::BAD_GATEWAY, "<html>oops</html>"),
            "HTTP 502"
        );
    }

    #[test]
    fn test_non_http_base_is_invalid() {
        assert!(matches!(
            parse_base("ws://localhost:8000"),
            Err(SyncError::InvalidEndpoint(_))
        ));
        assert!(matches!(parse_base("not a url"), Err(SyncError::InvalidEndpoint(_))));
    }
}
