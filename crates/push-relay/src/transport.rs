use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongPollRequest {
    pub url: Url,
    pub body: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongPollResponse {
    pub status: u16,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl LongPollResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),
}

/// Issues one long-poll request. Aborting is done by dropping the future.
#[async_trait]
pub trait LongPollTransport: Send + Sync {
    async fn long_poll(&self, request: LongPollRequest)
        -> Result<LongPollResponse, TransportError>;
}

/// HTTP transport backed by `reqwest`. No request timeout is set: the server
/// decides how long to hold the poll open.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl LongPollTransport for HttpTransport {
    async fn long_poll(
        &self,
        request: LongPollRequest,
    ) -> Result<LongPollResponse, TransportError> {
        let res = self
            .http
            .post(request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = res.status().as_u16();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = res
            .text()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        Ok(LongPollResponse {
            status,
            headers,
            body,
        })
    }
}
