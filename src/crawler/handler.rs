//! Completion callbacks for fetch tasks
//!
//! Every task carries one [`ResponseHandler`]. The engine runs exactly one of
//! its two methods per dispatched task, on the worker that performed the
//! fetch. Handlers receive the engine so they can submit follow-up work.

use super::engine::FetchEngine;
use super::fetcher::{FetchFailure, FetchResponse};
use crate::CrawlError;
use async_trait::async_trait;
use encoding_rs::SHIFT_JIS;

/// Longest body excerpt included in failure logs
const BODY_PREVIEW_CHARS: usize = 200;

/// Callbacks invoked when a fetch task resolves
///
/// An `Err` from `on_success` is logged and counted as a callback fault; it
/// never stops other tasks unless [`CrawlError::is_fatal`] says so. A panic in
/// either method is caught and treated the same way.
///
/// Handlers must not call [`FetchEngine::wait_and_close`]: they run on a
/// worker, and the engine cannot drain while that worker is busy.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Called with the response of a successful fetch
    async fn on_success(&self, engine: &FetchEngine, response: FetchResponse)
        -> Result<(), CrawlError>;

    /// Called when the fetch failed; the default logs the failure
    async fn on_error(&self, _engine: &FetchEngine, failure: FetchFailure) {
        log_failure(&failure);
    }
}

/// Logs a failed fetch, including a short body excerpt when one is available
pub fn log_failure(failure: &FetchFailure) {
    match failure.body.as_deref() {
        Some(body) if !body.is_empty() => tracing::warn!(
            "Fetch failed for {}: {} (body: {})",
            failure.url,
            failure.error,
            body_preview(body)
        ),
        _ => tracing::warn!("Fetch failed for {}: {}", failure.url, failure.error),
    }
}

/// Decodes a response body for display
///
/// Tries UTF-8 first, then Shift_JIS (common on Japanese storefronts), and
/// falls back to lossy UTF-8.
pub fn decode_body(body: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(body) {
        return text.to_string();
    }
    let (text, _, had_errors) = SHIFT_JIS.decode(body);
    if !had_errors {
        return text.into_owned();
    }
    String::from_utf8_lossy(body).into_owned()
}

/// First few characters of a decoded body, on a single line
pub fn body_preview(body: &[u8]) -> String {
    let text = decode_body(body);
    let mut preview: String = text
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if text.chars().count() > BODY_PREVIEW_CHARS {
        preview.push_str("...");
    }
    preview
}
