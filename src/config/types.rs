use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for the storefront crawler
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub ledger: LedgerConfig,
    pub output: OutputConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Looks up a target by name
    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }
}

/// Fetch engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Maximum number of simultaneous in-flight requests
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: u32,

    /// Per-request wall-clock timeout (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Minimum time between two request starts, across all workers (milliseconds)
    #[serde(default = "default_minimum_wait_ms")]
    pub minimum_wait_ms: u64,

    /// How many times a failed URL is resubmitted before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Log a progress line every N resolved tasks
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,

    /// Headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn minimum_wait(&self) -> Duration {
        Duration::from_millis(self.minimum_wait_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            request_timeout_ms: default_request_timeout_ms(),
            minimum_wait_ms: default_minimum_wait_ms(),
            max_retries: default_max_retries(),
            progress_every: default_progress_every(),
            headers: BTreeMap::new(),
        }
    }
}

fn default_max_concurrent_fetches() -> u32 {
    4
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_minimum_wait_ms() -> u64 {
    250
}

fn default_max_retries() -> u32 {
    5
}

fn default_progress_every() -> u64 {
    10
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserAgentConfig {
    /// Name of the crawler
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(default)]
    pub contact_url: Option<String>,
}

impl UserAgentConfig {
    /// Formats the User-Agent header: `Name/Version (+ContactURL)`
    pub fn header_value(&self) -> String {
        match &self.contact_url {
            Some(contact) => format!(
                "{}/{} (+{})",
                self.crawler_name, self.crawler_version, contact
            ),
            None => format!("{}/{}", self.crawler_name, self.crawler_version),
        }
    }
}

/// What to do when appending a mark to the ledger file fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppendFailurePolicy {
    /// Log the error and keep crawling; the mark survives in memory only
    #[default]
    Log,
    /// Abort the crawl
    Fatal,
}

/// Downloaded-URL ledger configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    /// Path to the ledger text file (one URL per line)
    pub path: String,

    #[serde(default)]
    pub append_failure: AppendFailurePolicy,

    /// Host patterns that are never fetched (e.g., "*.secure.pixiv.net")
    #[serde(default)]
    pub denylist: Vec<String>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Directory receiving per-target page dumps and images
    pub root: String,

    /// Path to the SQLite database file used by post-processing
    pub database_path: String,
}

/// Inclusive page range used to expand `{page}` in seed URLs
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

/// One storefront to crawl
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Short name, used for output directories and table names
    pub name: String,

    /// Listing URLs to start from; may contain a `{page}` placeholder
    pub seeds: Vec<String>,

    #[serde(default)]
    pub pages: Option<PageRange>,

    /// Query parameter carrying the page number
    #[serde(default = "default_page_param")]
    pub page_param: String,

    /// Substring marking that a listing page has a successor
    #[serde(default)]
    pub next_marker: Option<String>,

    /// CSS selector for item links on listing pages
    #[serde(default)]
    pub item_selector: Option<String>,

    /// CSS selector for image elements on item pages
    #[serde(default)]
    pub image_selector: Option<String>,

    /// Attribute of the image element holding its URL
    #[serde(default = "default_image_attr")]
    pub image_attr: String,
}

impl TargetConfig {
    /// Expands the seed list over the configured page range
    pub fn seed_urls(&self) -> Vec<String> {
        let mut urls = Vec::new();
        for seed in &self.seeds {
            match (seed.contains("{page}"), self.pages) {
                (true, Some(range)) => {
                    for page in range.start..=range.end {
                        urls.push(seed.replace("{page}", &page.to_string()));
                    }
                }
                (true, None) => urls.push(seed.replace("{page}", "0")),
                (false, _) => urls.push(seed.clone()),
            }
        }
        urls
    }
}

fn default_page_param() -> String {
    "page".to_string()
}

fn default_image_attr() -> String {
    "src".to_string()
}
