// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP plumbing shared by every component that talks to the service.
//!
//! One [`Transport`] wraps a pooled `reqwest::Client` plus the headers that
//! identify the run. Requests are built here and sent either once
//! ([`Transport::send_once`]) or under the bounded retry policy
//! ([`Transport::send_with_retry`]).
//!
//! # Retry policy
//!
//! ```text
//!   attempt 1 ──fail──> wait min(wait_min * 2^1, wait_max)
//!   attempt 2 ──fail──> wait min(wait_min * 2^2, wait_max)
//!   ...
//!   attempt retry_max ──fail──> give up, report, drop
//! ```
//!
//! Any transport error or non-2xx status counts as a failed attempt.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{RequestBuilder, Response};
use tracing::{error, warn};

use crate::config::Settings;
use crate::error::TransportError;

pub const NDJSON: &str = "application/x-ndjson";
pub const JSON: &str = "application/json";

const X_RUN_ID: HeaderName = HeaderName::from_static("x-run-id");
const X_RUN_NAME: HeaderName = HeaderName::from_static("x-run-name");
const X_PROJECT_NAME: HeaderName = HeaderName::from_static("x-project-name");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.retry_max,
            wait_min: settings.retry_wait_min,
            wait_max: settings.retry_wait_max,
        }
    }

    /// Wait after failed attempt number `attempt` (1-based), before the next one.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let wait = self.wait_min.as_secs_f64() * factor;
        if !wait.is_finite() || wait >= self.wait_max.as_secs_f64() {
            self.wait_max
        } else {
            Duration::from_secs_f64(wait)
        }
    }
}

/// Builds the pooled client. A bad proxy setting falls back to a direct
/// connection instead of failing the run.
#[must_use]
pub fn get_client(settings: &Settings) -> reqwest::Client {
    match build_client(settings, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to use proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(settings, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(settings: &Settings, allow_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut client = reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .connect_timeout(settings.connect_timeout)
        .pool_max_idle_per_host(settings.max_connections)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(proxy) = &settings.http_proxy {
            client = client.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
    }

    client.build()
}

fn header(value: &str, name: &'static str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(name))
}

#[derive(Debug, Clone)]
pub struct Transport {
    client: reqwest::Client,
    headers: HeaderMap,
    policy: RetryPolicy,
}

impl Transport {
    /// `run_id` is unknown only for the create-run call itself.
    pub fn new(
        settings: &Settings,
        run_id: Option<&str>,
        run_name: &str,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header(&format!("Bearer {}", settings.auth), "Authorization")?,
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("runlog"));
        if let Some(run_id) = run_id {
            headers.insert(X_RUN_ID, header(run_id, "X-Run-Id")?);
        }
        headers.insert(X_RUN_NAME, header(run_name, "X-Run-Name")?);
        headers.insert(X_PROJECT_NAME, header(&settings.project, "X-Project-Name")?);

        Ok(Self {
            client: get_client(settings),
            headers,
            policy: RetryPolicy::from_settings(settings),
        })
    }

    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn post_json(&self, url: &str, body: Vec<u8>) -> RequestBuilder {
        self.client
            .post(url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, JSON)
            .body(body)
    }

    pub fn post_ndjson(&self, url: &str, body: bytes::Bytes) -> RequestBuilder {
        self.client
            .post(url)
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, NDJSON)
            .body(body)
    }

    /// Upload of raw file content. Storage URLs are pre-signed, so the run
    /// headers are not sent.
    pub fn put_bytes(&self, url: &str, body: Vec<u8>, content_type: &str) -> RequestBuilder {
        self.client
            .put(url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
    }

    /// Sends once; non-2xx responses are errors carrying the response body.
    pub async fn send_once(req: RequestBuilder) -> Result<Response, TransportError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Sends with bounded exponential backoff. `what` names the request in logs.
    pub async fn send_with_retry(
        &self,
        req: RequestBuilder,
        what: &str,
    ) -> Result<Response, TransportError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let Some(cloned_req) = req.try_clone() else {
                return Err(TransportError::NotReplayable);
            };
            let err = match Self::send_once(cloned_req).await {
                Ok(resp) => return Ok(resp),
                Err(e) => e,
            };

            if attempts >= self.policy.max_attempts {
                error!(
                    critical = true,
                    "Failed to send {what} after {attempts} attempt(s): {err}"
                );
                return Err(TransportError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }

            let wait = self.policy.backoff(attempts);
            warn!(
                "Retry {attempts}/{} for {what} in {}ms: {err}",
                self.policy.max_attempts,
                wait.as_millis()
            );
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            wait_min: Duration::from_millis(500),
            wait_max: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_default_backoff() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
    }

    fn test_settings(retry_max: u32) -> Settings {
        Settings {
            auth: "secret".to_string(),
            project: "proj".to_string(),
            retry_max,
            retry_wait_min: Duration::from_millis(1),
            retry_wait_max: Duration::from_millis(4),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_run_headers_are_sent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/ingest/metrics")
            .match_header("authorization", "Bearer secret")
            .match_header("user-agent", "runlog")
            .match_header("x-run-id", "r1")
            .match_header("x-run-name", "baseline")
            .match_header("x-project-name", "proj")
            .match_header("content-type", NDJSON)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let transport = Transport::new(&test_settings(1), Some("r1"), "baseline").unwrap();
        let url = format!("{}/ingest/metrics", server.url());
        Transport::send_once(transport.post_ndjson(&url, bytes::Bytes::from_static(b"{}\n")))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_with_retry_gives_up_after_max_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/runs/logName/add")
            .with_status(500)
            .with_body("Internal Server Error")
            .expect(3)
            .create_async()
            .await;

        let transport = Transport::new(&test_settings(3), Some("r1"), "baseline").unwrap();
        let url = format!("{}/api/runs/logName/add", server.url());
        let result = transport
            .send_with_retry(transport.post_json(&url, b"{}".to_vec()), "meta")
            .await;

        match result {
            Err(TransportError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, TransportError::Status { status: 500, .. }));
            }
            other => panic!("expected exhausted error, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_with_retry_stops_on_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/bucket/a.png")
            .match_header("content-type", "image/png")
            .with_status(201)
            .expect(1)
            .create_async()
            .await;

        let transport = Transport::new(&test_settings(3), Some("r1"), "baseline").unwrap();
        let url = format!("{}/bucket/a.png", server.url());
        let resp = transport
            .send_with_retry(transport.put_bytes(&url, vec![1, 2, 3], "image/png"), "file")
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 201);
        mock.assert_async().await;
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let settings = Settings {
            auth: "bad\nvalue".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            Transport::new(&settings, None, "run"),
            Err(TransportError::InvalidHeader("Authorization"))
        ));
    }
}
