//! HTML extraction for listing and item pages
//!
//! This module pulls out the few things the storefront handlers need:
//! - Item links on listing pages (configured CSS selector, `href`)
//! - Image URLs on item pages (configured CSS selector and attribute)
//! - Page title and canonical link, for post-processing

use crate::url::resolve_link;
use crate::CrawlError;
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Fields of a saved item page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    /// The page title (from `<title>`)
    pub title: Option<String>,
    /// `<link rel="canonical">`, resolved against the base URL
    pub canonical: Option<Url>,
    /// Image URLs matched by the image selector, in document order
    pub image_urls: Vec<Url>,
}

/// Compiles a CSS selector, reporting the page it was meant for on failure
pub fn compile_selector(selector: &str, url: &Url) -> Result<Selector, CrawlError> {
    Selector::parse(selector).map_err(|e| CrawlError::HtmlParse {
        url: url.to_string(),
        message: format!("invalid selector '{}': {:?}", selector, e),
    })
}

/// Absolute URLs of every element matched by `selector`, read from `attr`
///
/// Links that don't resolve to http(s) are dropped, as are repeats.
pub fn select_urls(html: &str, base_url: &Url, selector: &Selector, attr: &str) -> Vec<Url> {
    let document = Html::parse_document(html);
    collect_urls(&document, base_url, selector, attr)
}

/// Parses a saved item page
///
/// The canonical link, when present, replaces `fallback_base` for resolving
/// relative image URLs.
pub fn parse_item_page(
    html: &str,
    fallback_base: &Url,
    image_selector: Option<&Selector>,
    image_attr: &str,
) -> ParsedItem {
    let document = Html::parse_document(html);

    let title = extract_title(&document);
    let canonical = extract_canonical(&document, fallback_base);
    let base = canonical.as_ref().unwrap_or(fallback_base);
    let image_urls = image_selector
        .map(|selector| collect_urls(&document, base, selector, image_attr))
        .unwrap_or_default();

    ParsedItem {
        title,
        canonical,
        image_urls,
    }
}

fn collect_urls(document: &Html, base_url: &Url, selector: &Selector, attr: &str) -> Vec<Url> {
    let mut seen = HashSet::new();
    document
        .select(selector)
        .filter_map(|element| element.value().attr(attr))
        .filter_map(|href| resolve_link(href, base_url))
        .filter(|url| seen.insert(url.as_str().to_string()))
        .collect()
}

fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_canonical(document: &Html, base_url: &Url) -> Option<Url> {
    let canonical_selector = Selector::parse("link[rel='canonical'][href]").ok()?;

    document
        .select(&canonical_selector)
        .filter_map(|element| element.value().attr("href"))
        .find_map(|href| resolve_link(href, base_url))
}
