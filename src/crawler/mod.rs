//! Crawler module: the fetch engine and its collaborators
//!
//! This module contains the coordination core, including:
//! - HTTP transport (client construction, single-shot fetches)
//! - Process-wide request spacing
//! - The worker pool with liveness-counted drain and cancellation
//! - The callback contract and bounded retry

mod engine;
mod fetcher;
mod handler;
mod limiter;
mod retry;

pub use engine::{CancelHandle, DrainReport, FetchEngine};
pub use fetcher::{build_http_client, fetch_url, FetchError, FetchFailure, FetchResponse};
pub use handler::{body_preview, decode_body, log_failure, ResponseHandler};
pub use limiter::RateLimiter;
pub use retry::RetryHandler;
