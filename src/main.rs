//! Ripple-Harvest main entry point
//!
//! This is the command-line interface for the Ripple-Harvest site harvester.

use anyhow::Context;
use clap::Parser;
use ripple_harvest::config::{hash_config_text, load_config_with_hash, validate, Config};
use ripple_harvest::output::print_report;
use ripple_harvest::Coordinator;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ripple-Harvest: a concurrent site harvester
///
/// Ripple-Harvest downloads a site starting from one URL. Fetcher workers
/// download pages, crawler workers filter and rank the links found on them,
/// and the crawl ends when both sides run out of work.
#[derive(Parser, Debug)]
#[command(name = "ripple-harvest")]
#[command(version)]
#[command(about = "A concurrent site harvester", long_about = None)]
struct Cli {
    /// Seed URL to start harvesting from
    #[arg(value_name = "URL", required_unless_present_any = ["resume", "dry_run"])]
    url: Option<String>,

    /// Path to TOML configuration file; defaults apply when omitted
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume the crawl saved by the last interrupted run
    #[arg(long)]
    resume: bool,

    /// Print the effective configuration and exit without crawling
    #[arg(long, conflicts_with = "resume")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let (config, config_hash) = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (config, hash)
        }
        None => {
            let config = Config::default();
            validate(&config).context("default configuration is invalid")?;
            (config, hash_config_text(""))
        }
    };

    if cli.dry_run {
        handle_dry_run(&config, cli.url.as_deref());
        return Ok(());
    }

    handle_crawl(config, config_hash, cli.url.as_deref(), cli.resume).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ripple_harvest=info,warn"),
            1 => EnvFilter::new("ripple_harvest=debug,info"),
            2 => EnvFilter::new("ripple_harvest=trace,debug"),
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

/// Handles the --dry-run mode: shows the effective configuration
fn handle_dry_run(config: &Config, url: Option<&str>) {
    println!("=== Ripple-Harvest Dry Run ===\n");

    if let Some(url) = url {
        println!("Seed: {}\n", url);
    }

    let crawler = &config.crawler;
    println!("Crawler:");
    if crawler.single_threaded {
        println!("  Workers: single-threaded (1 fetcher, 1 crawler)");
    } else {
        let (fetchers, crawlers) = crawler.worker_split();
        println!(
            "  Workers: {} ({} fetchers, {} crawlers)",
            crawler.workers, fetchers, crawlers
        );
    }
    println!("  Queue size: {}", crawler.queue_size);
    println!("  Queue timeout: {}ms", crawler.queue_timeout_ms);

    println!("\nNetwork:");
    println!("  Max connections: {}", config.network.max_connections);
    println!("  Retries: {}", config.network.retries);
    println!("  User agent: {}", config.user_agent.header_value());

    println!("\nDownload pool:");
    println!("  Size: {}", config.pool.thread_pool_size);
    println!("  Parts per file: {}", config.pool.num_parts);

    let limits = &config.limits;
    println!("\nLimits:");
    if limits.any() {
        println!("  Max files: {}", limits.max_files);
        println!("  Max bytes: {}", limits.max_bytes);
        println!("  Time limit: {}s", limits.time_limit_secs);
    } else {
        println!("  None");
    }

    println!("\nRules:");
    println!("  Max depth: {}", config.rules.max_depth);
    println!("  Same domain: {}", config.rules.same_domain);
    println!("  Blacklist: {} patterns", config.rules.blacklist.len());

    println!("\nOutput:");
    println!("  Project dir: {}", config.output.project_dir);
    println!("  Database: {}", config.output.database_path);
    println!("  Save files: {}", config.output.save_files);

    println!("\n✓ Configuration is valid");
}

/// Handles the main crawl operation
async fn handle_crawl(
    config: Config,
    config_hash: String,
    url: Option<&str>,
    resume: bool,
) -> anyhow::Result<()> {
    let mut coordinator = Coordinator::builder(config)
        .config_hash(config_hash)
        .build()
        .context("failed to set up the crawler")?;

    let ctx = coordinator.context().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping crawl");
            ctx.end_loop(true);
        }
    });

    let report = if resume {
        tracing::info!("Resuming interrupted crawl");
        coordinator.restart().await.context("failed to resume crawl")?
    } else {
        let url = url.context("a seed URL is required")?;
        coordinator
            .configure(url)
            .with_context(|| format!("invalid seed URL {}", url))?;
        coordinator.crawl().await.context("crawl failed")?
    };

    print_report(&report);
    Ok(())
}
