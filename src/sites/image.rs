use super::{write_output, SiteContext};
use crate::crawler::{FetchEngine, FetchFailure, FetchResponse, ResponseHandler};
use crate::CrawlError;
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

/// Handles image downloads: writes the bytes under `images/`, then marks
pub struct ImageHandler {
    context: Arc<SiteContext>,
}

impl ImageHandler {
    pub fn new(context: Arc<SiteContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ResponseHandler for ImageHandler {
    async fn on_success(
        &self,
        _engine: &FetchEngine,
        response: FetchResponse,
    ) -> Result<(), CrawlError> {
        // Named after the URL found on the item page so post-processing can find it
        let requested = Url::parse(&response.requested_url)?;
        let path = self.context.layout.image_path(&requested);
        write_output(&path, &response.body).await?;

        tracing::info!("Image saved to {}", path.display());
        self.context.mark_completed(&response)
    }

    async fn on_error(&self, _engine: &FetchEngine, failure: FetchFailure) {
        self.context.fail(&failure);
    }
}
