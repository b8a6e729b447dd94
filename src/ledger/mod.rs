//! Downloaded-URL ledger
//!
//! The ledger is the persistent set of URLs whose processing has completed.
//! It backs the skip decision that keeps crawls idempotent across runs.
//!
//! Storage format: a UTF-8 text file, one URL per line. Each first-time mark
//! is appended and synced immediately; [`Ledger::flush`] rewrites the file
//! sorted and deduplicated. Membership is monotonic: nothing is ever removed.
//!
//! The owner of a ledger is expected to call [`Ledger::flush`] once the crawl
//! has drained. Dropping a ledger with unflushed marks flushes it as a
//! fallback so that scoped cleanup also covers early returns.

use crate::config::{AppendFailurePolicy, LedgerConfig};
use crate::url::denylist_match;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised by ledger I/O
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to load ledger {}: {source}", .path.display())]
    Load { path: PathBuf, source: io::Error },

    #[error("Failed to append {url} to ledger: {source}")]
    Append { url: String, source: io::Error },

    #[error("Failed to rewrite ledger {}: {source}", .path.display())]
    Flush { path: PathBuf, source: io::Error },
}

impl LedgerError {
    /// Append errors only surface when the configured policy is `fatal`
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Append { .. })
    }
}

/// Why a URL must not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The URL was marked by this or a previous run
    AlreadyDownloaded,
    /// The URL's host matches a denylist pattern
    Denylisted { pattern: String },
    /// Another task of this run already claimed the URL
    InFlight,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyDownloaded => f.write_str("Already downloaded."),
            Self::Denylisted { pattern } => {
                write!(f, "Denylisted host (matches {}).", pattern)
            }
            Self::InFlight => f.write_str("Already queued in this run."),
        }
    }
}

struct LedgerInner {
    urls: HashSet<String>,
    appender: Option<File>,
    unflushed: usize,
    /// URLs claimed by this run that are neither marked nor released
    in_flight: HashSet<String>,
}

/// Persistent set of downloaded URLs, shared by reference with every collaborator
pub struct Ledger {
    path: PathBuf,
    policy: AppendFailurePolicy,
    denylist: Vec<String>,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Opens the ledger at `path`, loading existing entries or creating an empty file
    pub fn open(
        path: impl AsRef<Path>,
        policy: AppendFailurePolicy,
        denylist: Vec<String>,
    ) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let load_err = |source| LedgerError::Load {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(load_err)?;
        }

        let urls: HashSet<String> = if path.exists() {
            tracing::debug!("Loading downloaded URLs from {}", path.display());
            fs::read_to_string(&path)
                .map_err(load_err)?
                .lines()
                .map(str::trim_end)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()
        } else {
            tracing::debug!("Creating new ledger at {}", path.display());
            HashSet::new()
        };

        let appender = open_appender(&path).map_err(load_err)?;

        tracing::info!(
            "Ledger {} holds {} downloaded URLs",
            path.display(),
            urls.len()
        );

        Ok(Self {
            path,
            policy,
            denylist,
            inner: Mutex::new(LedgerInner {
                urls,
                appender: Some(appender),
                unflushed: 0,
                in_flight: HashSet::new(),
            }),
        })
    }

    /// Opens the ledger described by the `[ledger]` config section
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        Self::open(&config.path, config.append_failure, config.denylist.clone())
    }

    /// Returns the reason a URL must be skipped, or None if it should be fetched
    pub fn should_skip(&self, url: &str) -> Option<SkipReason> {
        if self.lock().urls.contains(url) {
            return Some(SkipReason::AlreadyDownloaded);
        }

        denylist_match(url, &self.denylist).map(|pattern| SkipReason::Denylisted {
            pattern: pattern.to_string(),
        })
    }

    /// Claims `url` for this run unless it must be skipped
    ///
    /// Returns None when the caller now owns the URL. The skip check and the
    /// claim happen under one lock, so of several concurrent callers claiming
    /// the same URL exactly one succeeds. A claim lasts until the URL is
    /// marked or [`Ledger::release`] is called; it is never persisted.
    pub fn try_claim(&self, url: &str) -> Option<SkipReason> {
        let mut inner = self.lock();
        if inner.urls.contains(url) {
            return Some(SkipReason::AlreadyDownloaded);
        }
        if let Some(pattern) = denylist_match(url, &self.denylist) {
            return Some(SkipReason::Denylisted {
                pattern: pattern.to_string(),
            });
        }
        if !inner.in_flight.insert(url.to_string()) {
            return Some(SkipReason::InFlight);
        }
        None
    }

    /// Drops the claim on a URL that failed for good, so it may be submitted again
    pub fn release(&self, url: &str) {
        if self.lock().in_flight.remove(url) {
            tracing::debug!("Released claim on {}", url);
        }
    }

    /// Records a URL as downloaded
    ///
    /// Returns `Ok(true)` if the URL was new, `Ok(false)` if it was already
    /// known. A first-time mark is appended and synced to disk before this
    /// returns. Under the `log` policy an append failure is logged and the
    /// mark is kept in memory; under `fatal` it is returned as an error.
    pub fn mark_downloaded(&self, url: &str) -> Result<bool, LedgerError> {
        let mut inner = self.lock();
        inner.in_flight.remove(url);

        if !inner.urls.insert(url.to_string()) {
            tracing::trace!("Already marked: {}", url);
            return Ok(false);
        }
        inner.unflushed += 1;
        tracing::debug!("Marking URL as downloaded: {}", url);

        let appended = match inner.appender.as_mut() {
            Some(file) => append_line(file, url),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "ledger file handle is unavailable",
            )),
        };

        match (appended, self.policy) {
            (Ok(()), _) => Ok(true),
            (Err(e), AppendFailurePolicy::Log) => {
                tracing::error!(
                    "Could not append {} to {}: {} (kept in memory)",
                    url,
                    self.path.display(),
                    e
                );
                Ok(true)
            }
            (Err(source), AppendFailurePolicy::Fatal) => Err(LedgerError::Append {
                url: url.to_string(),
                source,
            }),
        }
    }

    /// Rewrites the backing file as a sorted, deduplicated list of every known URL
    ///
    /// Returns the number of URLs written.
    pub fn flush(&self) -> Result<usize, LedgerError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let flush_err = |source| LedgerError::Flush {
            path: self.path.clone(),
            source,
        };

        let mut sorted: Vec<&String> = inner.urls.iter().collect();
        sorted.sort();

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(flush_err)?;
            let mut buffer = String::with_capacity(sorted.iter().map(|u| u.len() + 1).sum());
            for url in &sorted {
                buffer.push_str(url);
                buffer.push('\n');
            }
            tmp.write_all(buffer.as_bytes()).map_err(flush_err)?;
            tmp.sync_all().map_err(flush_err)?;
        }

        // The old append handle points at the replaced inode
        inner.appender = None;
        fs::rename(&tmp_path, &self.path).map_err(flush_err)?;
        inner.appender = Some(open_appender(&self.path).map_err(flush_err)?);
        inner.unflushed = 0;

        tracing::info!(
            "Saved {} downloaded URLs to {}",
            sorted.len(),
            self.path.display()
        );
        Ok(sorted.len())
    }

    /// Returns true if the URL has been marked
    pub fn contains(&self, url: &str) -> bool {
        self.lock().urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.lock().urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of downloaded URLs per host, for reporting
    pub fn host_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for url in self.lock().urls.iter() {
            let host = ::url::Url::parse(url)
                .ok()
                .and_then(|u| crate::url::extract_domain(&u))
                .unwrap_or_else(|| "<unparseable>".to_string());
            *counts.entry(host).or_insert(0) += 1;
        }
        counts
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        // The set stays consistent even if a holder panicked mid-append
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn drop_appender(&self) {
        self.lock().appender = None;
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        let unflushed = self.lock().unflushed;
        if unflushed > 0 {
            tracing::warn!(
                "Ledger dropped with {} unflushed marks, flushing now",
                unflushed
            );
            if let Err(e) = self.flush() {
                tracing::error!("Final ledger flush failed: {}", e);
            }
        }
    }
}

fn open_appender(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn append_line(file: &mut File, url: &str) -> io::Result<()> {
    let mut line = String::with_capacity(url.len() + 1);
    line.push_str(url);
    line.push('\n');
    file.write_all(line.as_bytes())?;
    file.sync_data()
}
