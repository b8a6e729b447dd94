//! HTTP fetcher implementation
//!
//! This module handles the transport side of a fetch task:
//! - Building the shared HTTP client (user agent, base headers, timeouts, redirects)
//! - Issuing a single GET and reading the body
//! - Classifying failures so handlers can decide whether to resubmit

use crate::config::{EngineConfig, UserAgentConfig};
use crate::CrawlError;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Maximum redirect hops followed by the transport
const MAX_REDIRECTS: usize = 10;

/// A completed, successful fetch
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// URL the task was created with
    pub requested_url: String,
    /// Final URL after redirects; this is what gets marked in the ledger
    pub url: Url,
    /// HTTP status code (2xx)
    pub status: u16,
    /// Content-Type header value, if any
    pub content_type: Option<String>,
    /// Raw body bytes
    pub body: Bytes,
}

/// Classification of a failed fetch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("redirect error: {0}")]
    Redirect(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    /// Returns true if the same request may succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) | Self::Body(_) | Self::Transport(_) => true,
            Self::Status(code) => matches!(*code, 408 | 429) || *code >= 500,
            Self::Redirect(_) => false,
        }
    }

    fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_redirect() {
            Self::Redirect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// A failed fetch, handed to the error callback
#[derive(Debug, Clone)]
pub struct FetchFailure {
    /// URL the task was created with
    pub url: String,
    pub error: FetchError,
    /// Status code, when a response was received
    pub status: Option<u16>,
    /// Response body, when a non-success response was received
    pub body: Option<Bytes>,
}

/// Builds the shared HTTP client
///
/// The user agent is `Name/Version (+ContactURL)`; base headers from the
/// `[engine.headers]` table are attached to every request. Redirects are
/// followed transparently up to a fixed hop limit.
///
/// # Example
///
/// ```no_run
/// use storefront_crawler::config::{EngineConfig, UserAgentConfig};
/// use storefront_crawler::crawler::build_http_client;
///
/// let ua = UserAgentConfig {
///     crawler_name: "ShelfBot".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: None,
/// };
///
/// let client = build_http_client(&EngineConfig::default(), &ua).unwrap();
/// ```
pub fn build_http_client(
    engine: &EngineConfig,
    user_agent: &UserAgentConfig,
) -> Result<Client, CrawlError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &engine.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| CrawlError::InvalidHeader {
                name: name.clone(),
                message: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| CrawlError::InvalidHeader {
            name: name.clone(),
            message: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }

    let client = Client::builder()
        .user_agent(user_agent.header_value())
        .default_headers(headers)
        .timeout(engine.request_timeout())
        .connect_timeout(engine.request_timeout().min(Duration::from_secs(10)))
        .redirect(Policy::limited(MAX_REDIRECTS))
        .gzip(true)
        .brotli(true)
        .build()?;

    Ok(client)
}

/// Fetches a URL once, with no retry
///
/// Transport errors, timeouts and non-success statuses all come back as a
/// [`FetchFailure`]. For a non-success status the body is read (best effort)
/// so the error callback can inspect it.
pub async fn fetch_url(client: &Client, url: &str) -> Result<FetchResponse, FetchFailure> {
    let failure = |error: FetchError, status: Option<u16>, body: Option<Bytes>| FetchFailure {
        url: url.to_string(),
        error,
        status,
        body,
    };

    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(e) => return Err(failure(FetchError::from_reqwest(&e), None, None)),
    };

    let status = response.status();
    let final_url = response.url().clone();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    if !is_success_status(status) {
        let body = response.bytes().await.ok();
        return Err(failure(
            FetchError::Status(status.as_u16()),
            Some(status.as_u16()),
            body,
        ));
    }

    match response.bytes().await {
        Ok(body) => Ok(FetchResponse {
            requested_url: url.to_string(),
            url: final_url,
            status: status.as_u16(),
            content_type,
            body,
        }),
        Err(e) => Err(failure(
            FetchError::from_reqwest(&e),
            Some(status.as_u16()),
            None,
        )),
    }
}

/// 2xx is success; a 3xx that survives the redirect policy (e.g., 304) is too
fn is_success_status(status: StatusCode) -> bool {
    status.is_success() || status.is_redirection()
}
