// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use lifesim_common::ErrorBody;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Timeout,
    ClientError,
    ServerError,
    Parse,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::ClientError => "4xx",
            Self::ServerError => "5xx",
            Self::Parse => "parse",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::ServerError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct RequestError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    /// Machine-readable code from the service error body, when there was one.
    pub code: Option<String>,
    pub message: String,
}

impl RequestError {
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            status: None,
            code: None,
            message: format!("no response within {}s", after.as_secs_f64()),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Parse,
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            400..=499 => ErrorKind::ClientError,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Parse,
        };
        let (code, message) = match serde_json::from_str::<ErrorBody>(body) {
            Ok(error) => (error.error, error.message),
            Err(_) if body.trim().is_empty() => (None, format!("HTTP {status}")),
            Err(_) => (None, body.trim().to_string()),
        };
        Self {
            kind,
            status: Some(status),
            code,
            message,
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP exchange. Only connection-level failures are errors here;
/// any HTTP status is a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<RawResponse, RequestError>;
}

#[derive(Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<RawResponse, RequestError> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|error| RequestError::network(format!("failed to call {url}: {error}")))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|error| {
            RequestError::network(format!("failed to read response body: {error}"))
        })?;
        Ok(RawResponse { status, body })
    }
}

#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    timeout: Duration,
    retries: u32,
    base_delay: Duration,
}

impl RequestClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
        timeout: Duration,
        retries: u32,
        base_delay: Duration,
    ) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            retries,
            base_delay,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Network failures and 5xx answers are retried up to `retries` extra
    /// times, waiting `base_delay * 2^attempt` in between. Everything else
    /// is returned on first occurrence.
    pub async fn fetch_with_retry<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, RequestError> {
        let url = self.endpoint(path);
        let mut attempt = 0_u32;
        loop {
            match self.fetch_once(method.clone(), &url, body).await {
                Ok(value) => return Ok(value),
                Err(error) if error.kind.is_retryable() && attempt < self.retries => {
                    let delay = self.base_delay * 2_u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        url = %url,
                        attempt,
                        max_retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        kind = error.kind.as_str(),
                        error = %error.message,
                        "request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn fetch_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<T, RequestError> {
        let response =
            match tokio::time::timeout(self.timeout, self.transport.send(method, url, body)).await {
                Ok(result) => result?,
                Err(_) => return Err(RequestError::timeout(self.timeout)),
            };

        if !(200..300).contains(&response.status) {
            return Err(RequestError::from_status(response.status, &response.body));
        }
        debug!(url = %url, status = response.status, "request succeeded");
        serde_json::from_str(&response.body).map_err(|error| {
            RequestError::parse(format!("unexpected response from {url}: {error}"))
        })
    }
}
