//! Crawl statistics and reporting
//!
//! The engine keeps a set of atomic counters while it runs; [`CrawlStats::snapshot`]
//! freezes them into a plain [`CrawlStatistics`] value for progress lines and
//! the final summary.

use crate::ledger::Ledger;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Live counters shared by every worker of an engine
#[derive(Debug, Default)]
pub struct CrawlStats {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    callback_faults: AtomicU64,
    skipped: AtomicU64,
    bytes_received: AtomicU64,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// A callback returned an error or panicked
    pub fn record_callback_fault(&self) {
        self.callback_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// A URL was not submitted because the ledger said to skip it
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, count: usize) {
        self.bytes_received.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Number of tasks that reached a terminal state
    pub fn resolved(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.cancelled.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CrawlStatistics {
        CrawlStatistics {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the crawl counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStatistics {
    /// Tasks accepted by `fetch`
    pub enqueued: u64,
    /// Tasks whose fetch succeeded and whose success callback ran
    pub succeeded: u64,
    /// Tasks whose request failed (transport error, timeout, non-success status)
    pub failed: u64,
    /// Tasks dropped by cancellation before any I/O
    pub cancelled: u64,
    /// Callbacks that returned an error or panicked
    pub callback_faults: u64,
    /// URLs skipped by the ledger before submission
    pub skipped: u64,
    pub bytes_received: u64,
}

impl CrawlStatistics {
    /// Tasks that reached a terminal state
    pub fn resolved(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }

    /// Share of dispatched tasks whose request succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let dispatched = self.enqueued.saturating_sub(self.cancelled);
        if dispatched == 0 {
            return 0.0;
        }
        let fetched_ok = dispatched.saturating_sub(self.failed);
        (fetched_ok as f64 / dispatched as f64) * 100.0
    }
}

/// Prints the end-of-crawl summary to stdout
pub fn print_statistics(stats: &CrawlStatistics, elapsed: Duration) {
    println!("=== Crawl Statistics ===");
    println!();
    println!("Tasks Enqueued: {}", stats.enqueued);
    println!("  Succeeded: {}", stats.succeeded);
    println!("  Failed: {}", stats.failed);
    if stats.cancelled > 0 {
        println!("  Cancelled: {}", stats.cancelled);
    }
    println!("Skipped (ledger): {}", stats.skipped);
    if stats.callback_faults > 0 {
        println!("Callback Faults: {}", stats.callback_faults);
    }
    println!("Bytes Received: {}", stats.bytes_received);
    println!("Elapsed: {:.1}s", elapsed.as_secs_f64());
    println!();
    println!(
        "Success Rate: {:.1}% ({} / {} tasks fetched)",
        stats.success_rate(),
        stats.enqueued.saturating_sub(stats.cancelled + stats.failed),
        stats.enqueued.saturating_sub(stats.cancelled)
    );
}

/// Prints what the ledger holds, grouped by host
pub fn print_ledger_summary(ledger: &Ledger) {
    println!("=== Download Ledger ===");
    println!();
    println!("Ledger File: {}", ledger.path().display());
    println!("Total URLs: {}", ledger.len());

    let hosts = ledger.host_counts();
    if !hosts.is_empty() {
        println!();
        println!("URLs by Host:");
        let mut by_count: Vec<_> = hosts.into_iter().collect();
        by_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (host, count) in by_count {
            println!("  {}: {}", host, count);
        }
    }
}
