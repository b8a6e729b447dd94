//! Storefront collaborators
//!
//! Configuration-driven handlers that turn fetched pages into files on disk
//! and follow-up fetches:
//! - [`ListingHandler`]: listing pages, fans out to item pages and the next page
//! - [`ItemHandler`]: item pages, fans out to images
//! - [`ImageHandler`]: image bytes
//!
//! Every handler persists its output before marking the URL in the ledger,
//! so a URL that is marked always has its files on disk.
//!
//! Submission claims the URL in the ledger first. Within one run a URL is
//! therefore fetched at most once, even when several pages in flight link to
//! it; the claim is dropped again only when the fetch fails for good.

mod extract;
mod image;
mod item;
mod listing;
mod paths;

pub use extract::{compile_selector, parse_item_page, select_urls, ParsedItem};
pub use image::ImageHandler;
pub use item::ItemHandler;
pub use listing::ListingHandler;
pub use paths::{image_file_name, item_id, sanitize_file_name, FileClaims, OutputLayout};

use crate::config::{Config, TargetConfig};
use crate::crawler::{
    log_failure, DrainReport, FetchEngine, FetchFailure, FetchResponse, ResponseHandler,
    RetryHandler,
};
use crate::ledger::Ledger;
use crate::CrawlError;
use std::path::Path;
use std::sync::Arc;

/// Everything a target's handlers share
pub struct SiteContext {
    pub target: TargetConfig,
    pub ledger: Arc<Ledger>,
    pub layout: OutputLayout,
    pub files: FileClaims,
    pub max_retries: u32,
}

impl SiteContext {
    pub fn new(config: &Config, target: &TargetConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            target: target.clone(),
            ledger,
            layout: OutputLayout::new(&config.output.root, &target.name),
            files: FileClaims::new(),
            max_retries: config.engine.max_retries,
        }
    }

    /// Submits `url` unless it is downloaded, denylisted or already claimed
    ///
    /// The handler is wrapped in a [`RetryHandler`]. Returns whether the URL
    /// was submitted.
    pub fn submit(
        &self,
        engine: &FetchEngine,
        url: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<bool, CrawlError> {
        if let Some(reason) = self.ledger.try_claim(url) {
            tracing::debug!("Skipping {}: {}", url, reason);
            engine.stats().record_skipped();
            return Ok(false);
        }

        let handler = RetryHandler::new(handler, self.max_retries);
        if let Err(e) = engine.fetch(url, Arc::new(handler)) {
            self.ledger.release(url);
            return Err(e);
        }
        Ok(true)
    }

    /// Final failure of a submitted URL: log it and give up the claim
    pub fn fail(&self, failure: &FetchFailure) {
        log_failure(failure);
        self.ledger.release(&failure.url);
    }

    /// Marks a completed response in the ledger
    ///
    /// The final URL is marked; when a redirect happened the requested URL is
    /// marked too, so the next run's skip check on the link it discovers hits.
    pub fn mark_completed(&self, response: &FetchResponse) -> Result<(), CrawlError> {
        self.ledger.mark_downloaded(response.url.as_str())?;
        if response.requested_url != response.url.as_str() {
            self.ledger.mark_downloaded(&response.requested_url)?;
        }
        Ok(())
    }
}

/// Submits the seed listing pages of one target
///
/// Returns the number of seeds submitted; the rest were skipped.
pub fn start_target(engine: &FetchEngine, context: Arc<SiteContext>) -> Result<usize, CrawlError> {
    context.layout.create_dirs()?;

    let seeds = context.target.seed_urls();
    tracing::info!(
        "Starting target '{}' with {} seed URLs",
        context.target.name,
        seeds.len()
    );

    let handler: Arc<dyn ResponseHandler> = Arc::new(ListingHandler::new(Arc::clone(&context)));
    let mut submitted = 0;
    for seed in &seeds {
        if context.submit(engine, seed, Arc::clone(&handler))? {
            submitted += 1;
        }
    }

    if submitted == 0 && !seeds.is_empty() {
        tracing::info!(
            "All seeds of target '{}' are already downloaded",
            context.target.name
        );
    }
    Ok(submitted)
}

/// Crawls the given targets on one engine and waits for the crawl to drain
///
/// If a target cannot be started, work already queued is cancelled and
/// drained before the error is returned. Flushing the ledger is left to the
/// caller, which owns it.
pub async fn crawl_targets(
    engine: &FetchEngine,
    config: &Config,
    targets: &[&TargetConfig],
    ledger: Arc<Ledger>,
) -> Result<DrainReport, CrawlError> {
    for target in targets {
        let context = Arc::new(SiteContext::new(config, target, Arc::clone(&ledger)));
        if let Err(e) = start_target(engine, context) {
            tracing::error!("Could not start target '{}': {}", target.name, e);
            engine.cancel();
            if let Err(drain_err) = engine.wait_and_close().await {
                tracing::error!("Drain after failed start also failed: {}", drain_err);
            }
            return Err(e);
        }
    }

    engine.wait_and_close().await
}

/// Writes a file, creating its parent directory if needed
async fn write_output(path: &Path, body: &[u8]) -> Result<(), CrawlError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    tracing::debug!("Wrote {} ({} bytes)", path.display(), body.len());
    Ok(())
}
