//! Storage module for post-processed item data
//!
//! This module handles:
//! - Per-target SQLite item tables (`<target>_items`)
//! - Turning saved item pages into item rows
//! - Exporting item tables as JSON

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{ItemStore, StorageError, StorageResult};

use crate::config::{Config, TargetConfig};
use crate::crawler::decode_body;
use crate::sites::{compile_selector, parse_item_page, OutputLayout};
use crate::CrawlError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// Marker stored in `image_file_paths` when an image is missing on disk
pub const MISSING_IMAGES: &str = "ERROR";

/// Opens or creates the post-processing database
pub fn open_storage(path: &Path) -> StorageResult<SqliteStorage> {
    SqliteStorage::new(path)
}

/// One row of a `<target>_items` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub item_id: String,
    pub name: Option<String>,
    pub url: Option<String>,
    pub image_urls: Vec<String>,
    /// Local image paths joined by `", "`, or `"ERROR"` if any is missing
    pub image_file_paths: String,
    pub processed_at: String,
}

/// Counts from one post-processing pass over a target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostProcessReport {
    pub processed: usize,
    pub new_items: usize,
    pub updated_items: usize,
    /// Items with at least one image not yet downloaded
    pub missing_images: usize,
}

/// Reads every saved item page of a target into its item table
pub fn post_process(
    config: &Config,
    target: &TargetConfig,
    store: &mut dyn ItemStore,
) -> Result<PostProcessReport, CrawlError> {
    let layout = OutputLayout::new(&config.output.root, &target.name);
    let pages = saved_pages(&layout.pages_dir())?;
    store.ensure_table(&target.name)?;

    let mut report = PostProcessReport::default();
    if pages.is_empty() {
        tracing::warn!(
            "No saved item pages for target '{}' in {}",
            target.name,
            layout.pages_dir().display()
        );
        return Ok(report);
    }

    let fallback_base = target
        .seed_urls()
        .first()
        .and_then(|seed| Url::parse(seed).ok())
        .map_or_else(|| Url::parse("https://localhost/"), Ok)?;
    let image_selector = target
        .image_selector
        .as_deref()
        .map(|selector| compile_selector(selector, &fallback_base))
        .transpose()?;

    for page in pages {
        let Some(item_id) = page.file_stem().and_then(|s| s.to_str()) else {
            tracing::warn!("Skipping page with unusable file name: {}", page.display());
            continue;
        };

        let body = std::fs::read(&page)?;
        let html = decode_body(&body);
        let parsed = parse_item_page(
            &html,
            &fallback_base,
            image_selector.as_ref(),
            &target.image_attr,
        );

        let image_file_paths = local_image_paths(&layout, &parsed.image_urls);
        if image_file_paths == MISSING_IMAGES {
            report.missing_images += 1;
        }

        let item = ItemRecord {
            item_id: item_id.to_string(),
            name: parsed.title,
            url: parsed.canonical.map(String::from),
            image_urls: parsed.image_urls.iter().map(|u| u.to_string()).collect(),
            image_file_paths,
            processed_at: Utc::now().to_rfc3339(),
        };

        if store.save_item(&target.name, &item)? {
            report.new_items += 1;
        } else {
            report.updated_items += 1;
        }
        report.processed += 1;
        tracing::debug!("Processed item {} of target '{}'", item.item_id, target.name);
    }

    tracing::info!(
        "Post-processed target '{}': {} items ({} new, {} updated, {} missing images)",
        target.name,
        report.processed,
        report.new_items,
        report.updated_items,
        report.missing_images
    );
    Ok(report)
}

/// Writes the item tables of the given targets as one JSON object keyed by target
pub fn export_json(
    store: &dyn ItemStore,
    targets: &[&TargetConfig],
    path: &Path,
) -> Result<usize, CrawlError> {
    let mut tables = BTreeMap::new();
    let mut total = 0;
    for target in targets {
        let items = store.list_items(&target.name)?;
        total += items.len();
        tables.insert(target.name.clone(), items);
    }

    let json = serde_json::to_string_pretty(&tables)?;
    std::fs::write(path, json)?;
    tracing::info!("Exported {} items to {}", total, path.display());
    Ok(total)
}

/// `*.html` files in a directory, sorted; empty if the directory is missing
fn saved_pages(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut pages = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "html") {
            pages.push(path);
        }
    }
    pages.sort();
    Ok(pages)
}

fn local_image_paths(layout: &OutputLayout, image_urls: &[Url]) -> String {
    let paths: Vec<PathBuf> = image_urls.iter().map(|u| layout.image_path(u)).collect();
    if paths.iter().any(|p| !p.exists()) {
        return MISSING_IMAGES.to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
