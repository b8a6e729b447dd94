//! Storefront crawler entry point
//!
//! This is the command-line interface for the storefront crawler.

use anyhow::{bail, Context};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storefront_crawler::config::{load_config_with_hash, Config, TargetConfig};
use storefront_crawler::crawler::FetchEngine;
use storefront_crawler::ledger::Ledger;
use storefront_crawler::output::{print_ledger_summary, print_statistics};
use storefront_crawler::sites::crawl_targets;
use storefront_crawler::storage::{export_json, open_storage, post_process, ItemStore};
use tracing_subscriber::EnvFilter;

/// Storefront crawler: a polite, resumable storefront crawler
///
/// Crawls listing pages, item pages and images of the configured targets
/// with bounded concurrency and a minimum wait between requests. URLs that
/// were downloaded before are recorded in a ledger and skipped.
#[derive(Parser, Debug)]
#[command(name = "storefront-crawler")]
#[command(version)]
#[command(about = "A polite, resumable storefront crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Only process the named target (repeatable; default: all targets)
    #[arg(long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with_all = ["stats", "post_process"])]
    dry_run: bool,

    /// Show ledger and item table statistics and exit
    #[arg(long, conflicts_with_all = ["dry_run", "post_process"])]
    stats: bool,

    /// Turn saved item pages into per-target tables and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    post_process: bool,

    /// With --post-process, also write the item tables to this JSON file
    #[arg(long, value_name = "PATH", requires = "post_process")]
    dump_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let targets = select_targets(&config, &cli.targets)?;

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config, &targets);
    } else if cli.stats {
        handle_stats(&config, &targets)?;
    } else if cli.post_process {
        handle_post_process(&config, &targets, cli.dump_json.as_deref())?;
    } else {
        handle_crawl(&config, &targets).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("storefront_crawler=info,warn"),
            1 => EnvFilter::new("storefront_crawler=debug,info"),
            2 => EnvFilter::new("storefront_crawler=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Resolves `--target` names; no names means every configured target
fn select_targets<'a>(config: &'a Config, names: &[String]) -> anyhow::Result<Vec<&'a TargetConfig>> {
    if names.is_empty() {
        return Ok(config.targets.iter().collect());
    }

    names
        .iter()
        .map(|name| match config.target(name) {
            Some(target) => Ok(target),
            None => bail!(
                "Unknown target '{}' (configured: {})",
                name,
                config
                    .targets
                    .iter()
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
        .collect()
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config, targets: &[&TargetConfig]) {
    println!("=== Storefront Crawler Dry Run ===\n");

    println!("Engine Configuration:");
    println!(
        "  Max concurrent fetches: {}",
        config.engine.max_concurrent_fetches
    );
    println!("  Request timeout: {}ms", config.engine.request_timeout_ms);
    println!("  Minimum wait: {}ms", config.engine.minimum_wait_ms);
    println!("  Max retries: {}", config.engine.max_retries);
    for (name, value) in &config.engine.headers {
        println!("  Header: {}: {}", name, value);
    }

    println!("\nUser Agent: {}", config.user_agent.header_value());

    println!("\nLedger:");
    println!("  Path: {}", config.ledger.path);
    println!("  Append failure policy: {:?}", config.ledger.append_failure);
    println!("  Denylist ({}):", config.ledger.denylist.len());
    for pattern in &config.ledger.denylist {
        println!("    - {}", pattern);
    }

    println!("\nOutput:");
    println!("  Root: {}", config.output.root);
    println!("  Database: {}", config.output.database_path);

    let mut seed_total = 0;
    println!("\nTargets ({}):", targets.len());
    for target in targets {
        let seeds = target.seed_urls();
        seed_total += seeds.len();
        println!("  - {} ({} seeds)", target.name, seeds.len());
        for seed in &seeds {
            println!("    * {}", seed);
        }
    }

    println!("\n✓ Configuration is valid");
    println!("✓ Would start crawling with {} seed URLs", seed_total);
}

/// Handles the --stats mode: summarizes the ledger and the item tables
fn handle_stats(config: &Config, targets: &[&TargetConfig]) -> anyhow::Result<()> {
    let ledger_path = Path::new(&config.ledger.path);
    if ledger_path.exists() {
        let ledger = Ledger::from_config(&config.ledger)?;
        print_ledger_summary(&ledger);
    } else {
        println!("Ledger {} does not exist yet", ledger_path.display());
    }

    let database_path = Path::new(&config.output.database_path);
    if !database_path.exists() {
        return Ok(());
    }

    let storage = open_storage(database_path)?;
    println!("\n=== Item Tables ===\n");
    println!("Database: {}", database_path.display());
    for target in targets {
        match storage.count_items(&target.name) {
            Ok(count) => println!("  {}_items: {}", target.name, count),
            Err(_) => println!("  {}_items: not post-processed yet", target.name),
        }
    }

    Ok(())
}

/// Handles the --post-process mode: fills the item tables from saved pages
fn handle_post_process(
    config: &Config,
    targets: &[&TargetConfig],
    dump_json: Option<&Path>,
) -> anyhow::Result<()> {
    let database_path = Path::new(&config.output.database_path);
    let mut storage = open_storage(database_path)
        .with_context(|| format!("Failed to open database {}", database_path.display()))?;

    println!("=== Post-Processing ===\n");
    for target in targets {
        let report = post_process(config, target, &mut storage)?;
        println!(
            "{}: {} items ({} new, {} updated, {} with missing images)",
            target.name,
            report.processed,
            report.new_items,
            report.updated_items,
            report.missing_images
        );
    }

    if let Some(path) = dump_json {
        let total = export_json(&storage, targets, path)?;
        println!("\n✓ Exported {} items to: {}", total, path.display());
    }

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: &Config, targets: &[&TargetConfig]) -> anyhow::Result<()> {
    if targets.is_empty() {
        bail!("No targets configured");
    }

    let ledger = Arc::new(
        Ledger::from_config(&config.ledger).context("Failed to open download ledger")?,
    );
    let engine = FetchEngine::new(&config.engine, &config.user_agent)
        .context("Failed to start fetch engine")?;

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight requests");
            cancel.cancel();
        }
    });

    let result = crawl_targets(&engine, config, targets, Arc::clone(&ledger)).await;

    // The ledger is flushed whether or not the crawl succeeded
    match ledger.flush() {
        Ok(count) => tracing::info!("Ledger flushed: {} URLs", count),
        Err(e) => tracing::error!("Failed to flush ledger: {}", e),
    }

    match result {
        Ok(report) => {
            print_statistics(&report.statistics, report.elapsed);
            if report.cancelled {
                tracing::warn!("Crawl was cancelled before completion");
            } else {
                tracing::info!("Crawl completed successfully");
            }
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
