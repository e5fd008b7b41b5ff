// src/api/transport.rs
//! Network transport seam.
//!
//! The orchestrator only speaks [`Transport`]; [`HttpTransport`] is the
//! reqwest-backed implementation. Status codes are returned as data, only
//! failures below HTTP become errors.

use async_trait::async_trait;
use log::{debug, info};
use std::error::Error as StdError;
use std::time::Duration;

use super::request::Method;
use crate::error::{ApiError, TransportErrorKind};

/// One fully-resolved network attempt.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: url::Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, ApiError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self, ApiError> {
        info!("🌐 Initializing HTTP transport (user agent: {})", user_agent);
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ApiError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<RawResponse, ApiError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
        };

        let mut builder = self
            .client
            .request(method, request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify_reqwest_error)?;
        debug!("📥 {} {} -> {} ({} bytes)", request.method, request.url, status, body.len());

        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ApiError {
    let message = err.to_string();
    if err.is_builder() {
        return ApiError::InvalidRequest(message);
    }

    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        if mentions_dns(&err) {
            TransportErrorKind::DnsFailure
        } else {
            TransportErrorKind::CannotConnect
        }
    } else if err.is_request() || err.is_body() || err.is_decode() {
        TransportErrorKind::ConnectionLost
    } else {
        TransportErrorKind::Other
    };
    ApiError::transport(kind, message)
}

fn mentions_dns(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns") || text.contains("lookup") || text.contains("resolve") {
            return true;
        }
        source = cause.source();
    }
    false
}
