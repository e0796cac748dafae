//! HTTP client for the companion web service.
//!
//! The companion service backs two optional steps of a session:
//!
//! - the token exchange used when `AUTHENTICATE` rejects the raw
//!   authorization code (`POST /api/cubpresence/token-exchange`);
//! - a best-effort "connected" notification once a session is live
//!   (`POST /api/cubpresence/connected/{config_id}`).
//!
//! The exchange sits behind the [`TokenExchange`] trait so the handshake can
//! be driven by a stub in tests or by a host application that brokers tokens
//! itself.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::error::{PresenceError, PresenceResult};

/// Trades an authorization code for an access token.
#[async_trait]
pub trait TokenExchange: Send + Sync + fmt::Debug {
    /// Exchange `code`, issued to `client_id`, for an access token.
    async fn exchange(&self, client_id: &str, code: &str) -> PresenceResult<String>;
}

#[derive(Debug, Serialize)]
struct ExchangeRequest<'a> {
    code: &'a str,
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Companion service client.
#[derive(Debug, Clone)]
pub struct CompanionClient {
    client: reqwest::Client,
    base_url: String,
}

impl CompanionClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str) -> PresenceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PresenceError::TokenExchange(format!("Failed to build HTTP client: {e:#}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Tell the service that the presence for `config_id` is live.
    ///
    /// Failures are logged and swallowed.
    pub async fn report_connected(&self, config_id: &str) {
        let url = self.url(&format!("/api/cubpresence/connected/{config_id}"));
        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                log::debug!("[Companion] Reported connected for {}", config_id);
            }
            Ok(response) => {
                log::debug!("[Companion] Connected report rejected: {}", response.status());
            }
            Err(e) => {
                log::debug!("[Companion] Connected report failed: {e:#}");
            }
        }
    }
}

#[async_trait]
impl TokenExchange for CompanionClient {
    async fn exchange(&self, client_id: &str, code: &str) -> PresenceResult<String> {
        let url = self.url("/api/cubpresence/token-exchange");
        log::info!("[Companion] Exchanging authorization code");

        let response = self
            .client
            .post(&url)
            .json(&ExchangeRequest { code, client_id })
            .send()
            .await
            .map_err(|e| PresenceError::TokenExchange(format!("request failed: {e:#}")))?;

        let status = response.status();
        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| PresenceError::TokenExchange(format!("invalid response ({status}): {e:#}")))?;

        if !status.is_success() {
            return Err(PresenceError::TokenExchange(
                body.error.unwrap_or_else(|| status.to_string()),
            ));
        }

        body.access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| PresenceError::TokenExchange("response carried no access_token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_exchange_returns_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cubpresence/token-exchange"))
            .and(body_json(json!({"code": "abc", "client_id": "42"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "tok"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompanionClient::new(&server.uri()).unwrap();
        assert_eq!(client.exchange("42", "abc").await.unwrap(), "tok");
    }

    #[tokio::test]
    async fn test_exchange_surfaces_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cubpresence/token-exchange"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let client = CompanionClient::new(&server.uri()).unwrap();
        assert_eq!(
            client.exchange("42", "abc").await,
            Err(PresenceError::TokenExchange("invalid_grant".into()))
        );
    }

    #[tokio::test]
    async fn test_exchange_without_token_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = CompanionClient::new(&server.uri()).unwrap();
        assert!(matches!(
            client.exchange("42", "abc").await,
            Err(PresenceError::TokenExchange(_))
        ));
    }

    #[tokio::test]
    async fn test_report_connected_posts_config_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cubpresence/connected/cfg-9"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = CompanionClient::new(&format!("{}/", server.uri())).unwrap();
        client.report_connected("cfg-9").await;
    }

    #[tokio::test]
    async fn test_report_connected_tolerates_unreachable_service() {
        let client = CompanionClient::new("http://127.0.0.1:1").unwrap();
        client.report_connected("cfg-9").await;
    }
}
