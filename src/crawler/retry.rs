//! Bounded resubmission of failed fetches
//!
//! The engine never retries on its own. [`RetryHandler`] wraps another
//! handler and, when a fetch fails with a transient error, submits the same
//! URL again as a new task. Attempts are counted per URL and shared by every
//! clone of the handler.

use super::engine::FetchEngine;
use super::fetcher::{FetchFailure, FetchResponse};
use super::handler::ResponseHandler;
use crate::CrawlError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone)]
pub struct RetryHandler {
    inner: Arc<dyn ResponseHandler>,
    max_retries: u32,
    attempts: Arc<Mutex<HashMap<String, u32>>>,
}

impl RetryHandler {
    pub fn new(inner: Arc<dyn ResponseHandler>, max_retries: u32) -> Self {
        Self {
            inner,
            max_retries,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Retries already spent on `url`
    pub fn attempts(&self, url: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Reserves one more retry for `url`, returning the attempt number if allowed
    fn reserve_retry(&self, url: &str) -> Option<u32> {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        let used = attempts.entry(url.to_string()).or_insert(0);
        if *used >= self.max_retries {
            return None;
        }
        *used += 1;
        Some(*used)
    }

    fn forget(&self, url: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }
}

#[async_trait]
impl ResponseHandler for RetryHandler {
    async fn on_success(
        &self,
        engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        self.forget(&response.requested_url);
        self.inner.on_success(engine, response).await
    }

    async fn on_error(&self, engine: &FetchEngine, failure: FetchFailure) {
        if failure.error.is_transient() {
            if let Some(attempt) = self.reserve_retry(&failure.url) {
                tracing::info!(
                    "Retrying {} after {} (attempt {}/{})",
                    failure.url,
                    failure.error,
                    attempt,
                    self.max_retries
                );
                match engine.fetch(failure.url.clone(), Arc::new(self.clone())) {
                    Ok(()) => return,
                    Err(e) => tracing::debug!("Retry of {} not submitted: {}", failure.url, e),
                }
            } else {
                tracing::warn!(
                    "Giving up on {} after {} retries",
                    failure.url,
                    self.max_retries
                );
            }
        }
        self.inner.on_error(engine, failure).await;
    }
}
