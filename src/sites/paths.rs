//! On-disk layout of a target's output
//!
//! ```text
//! <root>/<target>/listings/   raw listing pages
//! <root>/<target>/pages/      raw item pages, one per item id
//! <root>/<target>/images/     downloaded images
//! ```
//!
//! Names are derived from URLs and must not be shared by two URLs: a marked
//! URL whose file was overwritten by another download would never be fetched
//! again. Listing and image names embed enough of the URL to be distinct on
//! their own. Item pages keep their readable item id and go through
//! [`FileClaims`], which moves a second URL with the same id to a suffixed name.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use url::Url;

/// Length of the hex digest used when a URL yields no usable name
const DIGEST_NAME_LEN: usize = 16;

/// Length of the hex digest appended to disambiguate a name
const SUFFIX_DIGEST_LEN: usize = 8;

/// Upper bound for a generated file name, below the common 255-byte limit
const MAX_NAME_BYTES: usize = 200;

/// Extensions longer than this are treated as part of the stem
const MAX_EXTENSION_BYTES: usize = 16;

/// Directory layout for one target
#[derive(Debug, Clone)]
pub struct OutputLayout {
    target_dir: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl AsRef<Path>, target: &str) -> Self {
        Self {
            target_dir: root.as_ref().join(sanitize_file_name(target)),
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn listings_dir(&self) -> PathBuf {
        self.target_dir.join("listings")
    }

    pub fn pages_dir(&self) -> PathBuf {
        self.target_dir.join("pages")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.target_dir.join("images")
    }

    pub fn create_dirs(&self) -> io::Result<()> {
        for dir in [self.listings_dir(), self.pages_dir(), self.images_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `listings/<host><path>?<query>.html`, flattened into one file name
    ///
    /// Names that would exceed the length limit are cut and end in a digest
    /// of the full URL.
    pub fn listing_path(&self, url: &Url) -> PathBuf {
        let mut name = String::new();
        name.push_str(url.host_str().unwrap_or_default());
        name.push_str(url.path());
        if let Some(query) = url.query() {
            name.push('?');
            name.push_str(query);
        }
        let stem = bounded_stem(sanitize_file_name(&name), ".html".len(), url);
        self.listings_dir().join(format!("{}.html", stem))
    }

    pub fn item_path(&self, item_id: &str) -> PathBuf {
        self.pages_dir().join(format!("{}.html", item_id))
    }

    pub fn image_path(&self, url: &Url) -> PathBuf {
        self.images_dir().join(image_file_name(url))
    }
}

/// Makes a string safe to use as a single file name
///
/// Path and shell metacharacters are swapped for their full-width forms, so
/// Japanese titles stay readable; line breaks are dropped.
///
/// # Examples
///
/// ```
/// use storefront_crawler::sites::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("a/b:c?"), "a／b：c？");
/// ```
pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .map(|c| match c {
            '\\' => '＼',
            '/' => '／',
            ':' => '：',
            '*' => '＊',
            '?' => '？',
            '"' => '＂',
            '<' => '＜',
            '>' => '＞',
            '|' => '｜',
            other => other,
        })
        .collect();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Stable identifier of an item page, used as its file stem
///
/// The last path segment without its extension, followed by the query values
/// (`item.php?id=42` becomes `item_42`).
pub fn item_id(url: &Url) -> String {
    let stem = last_segment(url)
        .map(|segment| match segment.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => segment.to_string(),
        })
        .unwrap_or_default();

    let mut parts = Vec::new();
    if !stem.is_empty() {
        parts.push(stem);
    }
    parts.extend(
        url.query_pairs()
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty()),
    );

    if parts.is_empty() {
        return url_digest(url);
    }
    bounded_stem(sanitize_file_name(&parts.join("_")), ".html".len(), url)
}

/// File name an image URL is saved under
///
/// The last path segment with a short digest of the whole URL before the
/// extension (`cover.jpg` becomes `cover_1a2b3c4d.jpg`), so images with the
/// same name in different directories stay apart.
pub fn image_file_name(url: &Url) -> String {
    let Some(segment) = last_segment(url) else {
        return url_digest(url);
    };

    let (stem, extension) = split_extension(segment);
    let extension = extension
        .map(|ext| format!(".{}", sanitize_file_name(ext)))
        .unwrap_or_default();
    let digest = short_digest(url);
    let room = MAX_NAME_BYTES.saturating_sub(extension.len() + digest.len() + 1);
    let stem = sanitize_file_name(stem);
    format!("{}_{}{}", truncate_bytes(&stem, room), digest, extension)
}

/// Run-wide record of which URL owns which item page file
///
/// A file already owned by another URL, in this run or a previous one left
/// on disk, is not reused; the newcomer gets the name with a digest suffix.
#[derive(Debug, Default)]
pub struct FileClaims {
    owners: Mutex<HashMap<PathBuf, String>>,
}

impl FileClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the path `url` should be written to, preferring `preferred`
    pub fn claim(&self, preferred: PathBuf, url: &Url) -> PathBuf {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        match owners.get(&preferred) {
            Some(owner) if owner == url.as_str() => return preferred,
            None if !preferred.exists() => {
                owners.insert(preferred.clone(), url.to_string());
                return preferred;
            }
            _ => {}
        }

        let fallback = with_digest_suffix(&preferred, url);
        tracing::debug!(
            "{} is taken, saving {} as {}",
            preferred.display(),
            url,
            fallback.display()
        );
        owners.insert(fallback.clone(), url.to_string());
        fallback
    }
}

fn with_digest_suffix(path: &Path, url: &Url) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let digest = short_digest(url);
    let room = MAX_NAME_BYTES.saturating_sub(extension.len() + digest.len() + 1);
    path.with_file_name(format!(
        "{}_{}{}",
        truncate_bytes(&stem, room),
        digest,
        extension
    ))
}

/// Keeps `stem` short enough that `reserve` more bytes still fit the limit
fn bounded_stem(stem: String, reserve: usize, url: &Url) -> String {
    if stem.len() + reserve <= MAX_NAME_BYTES {
        return stem;
    }
    let digest = short_digest(url);
    let room = MAX_NAME_BYTES.saturating_sub(reserve + digest.len() + 1);
    format!("{}_{}", truncate_bytes(&stem, room), digest)
}

/// Cuts `name` to at most `max` bytes without splitting a character
fn truncate_bytes(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

fn split_extension(segment: &str) -> (&str, Option<&str>) {
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty() && !ext.is_empty() && ext.len() <= MAX_EXTENSION_BYTES =>
        {
            (stem, Some(ext))
        }
        _ => (segment, None),
    }
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
}

fn url_digest(url: &Url) -> String {
    let digest = hex::encode(Sha256::digest(url.as_str().as_bytes()));
    digest[..DIGEST_NAME_LEN].to_string()
}

fn short_digest(url: &Url) -> String {
    let mut digest = url_digest(url);
    digest.truncate(SUFFIX_DIGEST_LEN);
    digest
}
