use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some("IntegrationManager".to_string()),
            global_concurrency: 16,
        }
    }
}

/// Any failure to obtain data from, or apply a change to, an upstream system.
///
/// Response bodies of failed calls are kept for debug logging only; they are
/// not part of the display text.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("malformed response from {url}: {reason}")]
    MalformedBody { url: String, reason: String },
    #[error("login to {system} failed: {reason}")]
    Login { system: String, reason: String },
    #[error("document store error: {0}")]
    DocumentStore(String),
    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub url: String,
    pub body: Vec<u8>,
}

impl UpstreamResponse {
    /// Decodes the body as JSON; an empty or non-JSON body is malformed.
    pub fn json(&self) -> Result<JsonValue, UpstreamError> {
        serde_json::from_slice(&self.body).map_err(|err| UpstreamError::MalformedBody {
            url: self.url.clone(),
            reason: err.to_string(),
        })
    }

    /// JSON when possible, otherwise `{"raw_response": <text or null>}`.
    pub fn json_or_raw(&self) -> JsonValue {
        match serde_json::from_slice(&self.body) {
            Ok(value) => value,
            Err(_) => {
                let text = String::from_utf8_lossy(&self.body).trim().to_string();
                let raw = if text.is_empty() {
                    JsonValue::Null
                } else {
                    JsonValue::String(text)
                };
                serde_json::json!({ "raw_response": raw })
            }
        }
    }
}

/// Shared reqwest client for every upstream system. No retries: the client
/// timeout is the only bound on a call.
#[derive(Debug, Clone)]
pub struct UpstreamHttp {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl UpstreamHttp {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends a request and fails on any non-2xx status.
    pub async fn send(&self, request: RequestBuilder) -> Result<UpstreamResponse, UpstreamError> {
        let response = self.send_any_status(request).await?;
        if !response.status.is_success() {
            debug!(
                url = %response.url,
                status = response.status.as_u16(),
                body = %String::from_utf8_lossy(&response.body),
                "upstream error body"
            );
            return Err(UpstreamError::HttpStatus {
                status: response.status.as_u16(),
                url: response.url,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }
        Ok(response)
    }

    /// Sends a request and returns whatever status the upstream answered with.
    pub async fn send_any_status(
        &self,
        request: RequestBuilder,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let request = request
            .build()
            .map_err(|err| UpstreamError::InvalidRequest(err.to_string()))?;
        let url = request.url().to_string();
        let method = request.method().clone();
        let _permit = self.global_limit.acquire().await.ok();

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|source| UpstreamError::Transport {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| UpstreamError::Transport {
                url: url.clone(),
                source,
            })?
            .to_vec();

        info!(%method, url = %url, status = status.as_u16(), bytes = body.len(), "upstream call");
        Ok(UpstreamResponse { status, url, body })
    }
}

/// Joins a configured base URL and a relative path with exactly one slash.
/// An empty path yields the base unchanged.
pub fn join_url(base: &str, path: &str) -> String {
    if path.is_empty() {
        return base.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &[u8]) -> UpstreamResponse {
        UpstreamResponse {
            status: StatusCode::OK,
            url: "https://upstream.test/x".to_string(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn join_url_normalises_slashes() {
        assert_eq!(
            join_url("https://license.test/", "allLicences"),
            "https://license.test/allLicences"
        );
        assert_eq!(
            join_url("https://api.test/license", "/abc"),
            "https://api.test/license/abc"
        );
        assert_eq!(join_url("https://api.test/license", ""), "https://api.test/license");
    }

    #[test]
    fn non_json_bodies_are_malformed_or_wrapped() {
        assert!(matches!(
            response(b"<html>").json(),
            Err(UpstreamError::MalformedBody { .. })
        ));
        assert_eq!(
            response(b"done").json_or_raw(),
            serde_json::json!({"raw_response": "done"})
        );
        assert_eq!(
            response(b"").json_or_raw(),
            serde_json::json!({"raw_response": null})
        );
        assert_eq!(response(b"[1]").json().unwrap(), serde_json::json!([1]));
    }

    #[test]
    fn status_errors_do_not_display_the_body() {
        let err = UpstreamError::HttpStatus {
            status: 500,
            url: "https://upstream.test/x".to_string(),
            body: "secret stack trace".to_string(),
        };
        assert!(!err.to_string().contains("secret"));
    }
}
