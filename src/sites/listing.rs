use super::extract::{compile_selector, select_urls};
use super::{write_output, ItemHandler, SiteContext};
use crate::crawler::{decode_body, FetchEngine, FetchFailure, FetchResponse, ResponseHandler};
use crate::url::next_page_url;
use crate::CrawlError;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

/// Handles listing (search result) pages
///
/// Saves the page, submits every item link matched by `item-selector`, and
/// submits the next listing page when the body contains `next-marker`.
pub struct ListingHandler {
    context: Arc<SiteContext>,
}

impl ListingHandler {
    pub fn new(context: Arc<SiteContext>) -> Self {
        Self { context }
    }

    /// Item links and the next page URL, if any
    fn follow_ups(&self, response: &FetchResponse) -> Result<(Vec<Url>, Option<Url>), CrawlError> {
        let target = &self.context.target;
        let body = decode_body(&response.body);

        let items = match &target.item_selector {
            Some(selector) => {
                let selector = compile_selector(selector, &response.url)?;
                select_urls(&body, &response.url, &selector, "href")
            }
            None => Vec::new(),
        };

        let next_page = match &target.next_marker {
            Some(marker) if body.contains(marker.as_str()) => {
                Some(next_page_url(&response.requested_url, &target.page_param)?)
            }
            _ => None,
        };

        Ok((items, next_page))
    }
}

#[async_trait]
impl ResponseHandler for ListingHandler {
    async fn on_success(
        &self,
        engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        let path = self.context.layout.listing_path(&response.url);
        write_output(&path, &response.body).await?;

        let (items, next_page) = self.follow_ups(&response)?;

        let item_handler: Arc<dyn ResponseHandler> =
            Arc::new(ItemHandler::new(Arc::clone(&self.context)));
        let mut submitted = 0;
        for item in &items {
            if self
                .context
                .submit(engine, item.as_str(), Arc::clone(&item_handler))?
            {
                submitted += 1;
            }
        }

        if let Some(next) = &next_page {
            let handler = Arc::new(ListingHandler::new(Arc::clone(&self.context)));
            self.context.submit(engine, next.as_str(), handler)?;
        }

        tracing::info!(
            "Listing {}: {} items found, {} new{}",
            response.url,
            items.len(),
            submitted,
            if next_page.is_some() { ", next page queued" } else { "" }
        );

        self.context.mark_completed(&response)
    }

    async fn on_error(&self, _engine: &FetchEngine, failure: FetchFailure) {
        self.context.fail(&failure);
    }
}
