//! Output module for crawl progress and summaries
//!
//! This module handles:
//! - Counting task outcomes while the engine runs
//! - Printing the end-of-crawl summary
//! - Summarizing the download ledger for `--stats`

pub mod stats;

pub use stats::{print_ledger_summary, print_statistics, CrawlStatistics, CrawlStats};
