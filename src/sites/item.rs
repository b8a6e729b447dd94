use super::extract::{compile_selector, select_urls};
use super::paths::item_id;
use super::{write_output, ImageHandler, SiteContext};
use crate::crawler::{decode_body, FetchEngine, FetchFailure, FetchResponse, ResponseHandler};
use crate::CrawlError;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

/// Handles item (product) pages
///
/// Saves the page as `pages/<item id>.html` and submits every image matched
/// by `image-selector`.
pub struct ItemHandler {
    context: Arc<SiteContext>,
}

impl ItemHandler {
    pub fn new(context: Arc<SiteContext>) -> Self {
        Self { context }
    }

    fn image_urls(&self, response: &FetchResponse) -> Result<Vec<Url>, CrawlError> {
        let target = &self.context.target;
        let Some(selector) = &target.image_selector else {
            return Ok(Vec::new());
        };
        let selector = compile_selector(selector, &response.url)?;
        let body = decode_body(&response.body);
        Ok(select_urls(&body, &response.url, &selector, &target.image_attr))
    }
}

#[async_trait]
impl ResponseHandler for ItemHandler {
    async fn on_success(
        &self,
        engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        // Item ids come from the link that was followed, not a redirect target
        let requested = Url::parse(&response.requested_url)?;
        let id = item_id(&requested);
        let path = self
            .context
            .files
            .claim(self.context.layout.item_path(&id), &requested);
        write_output(&path, &response.body).await?;

        let images = self.image_urls(&response)?;
        let image_handler: Arc<dyn ResponseHandler> =
            Arc::new(ImageHandler::new(Arc::clone(&self.context)));
        for image in &images {
            self.context
                .submit(engine, image.as_str(), Arc::clone(&image_handler))?;
        }

        tracing::info!(
            "Item {} saved to {}, {} images",
            id,
            path.display(),
            images.len()
        );
        self.context.mark_completed(&response)
    }

    async fn on_error(&self, _engine: &FetchEngine, failure: FetchFailure) {
        self.context.fail(&failure);
    }
}
