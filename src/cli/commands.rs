//! Command implementations: wire configuration, seeds, and run bounds into
//! the crawl engine. Everything here is collaborator surface; the engine
//! itself never parses flags or reads seed files.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::browser::{Navigator, PageDriver};
use crate::config::Config;
use crate::crawl::{CrawlLimits, CrawlMode, CrawlServices, PaginationController};
use crate::detect::BlockDetector;
use crate::extract::FieldExtractor;
use crate::identity::{probe_proxy, IdentityRotator};
use crate::pacing::{BackoffScheduler, Sleeper, TokioSleeper};
use crate::seed::load_seeds;
use crate::store::CheckpointStore;

const PROXY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "harvest",
    about = "Resilient product-record acquisition from Tor-proxied marketplaces",
    version
)]
struct Cli {
    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the TOML config file (default: ./harvest.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a listing page by page and capture every item.
    Listing {
        /// First listing page (overrides the configured one).
        #[arg(long)]
        url: Option<String>,
        /// Stop after capturing this many items.
        #[arg(long)]
        max_items: Option<u64>,
        /// Directory for the checkpoint log and final artifact.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Visit each seeded product URL once and capture its details.
    Products {
        /// Newline-delimited seed file: JSON descriptors or bare paths.
        #[arg(long)]
        seeds: PathBuf,
        /// Site base URL for relative seed paths (overrides config).
        #[arg(long)]
        base_url: Option<String>,
        /// Skip this many seeds before starting.
        #[arg(long, default_value_t = 0)]
        start: usize,
        /// Stop after capturing this many items.
        #[arg(long)]
        max_items: Option<u64>,
        /// Directory for the checkpoint log and final artifact.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Consolidate an existing checkpoint log into the final artifact.
    Finalize {
        /// Directory holding the checkpoint log.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Peeked before the logger exists, so it scans raw args.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        info!("verbose logging enabled");
    }
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Listing { url, max_items, out } => {
            apply_overrides(&mut config, out, max_items);
            let start_url = url.or_else(|| config.listing.url.clone()).ok_or_else(|| {
                anyhow::anyhow!("no listing URL; pass --url or set [listing].url in the config")
            })?;
            let mode = CrawlMode::Paginated {
                start_url,
                item_selector: config.listing.item_selector.clone(),
                next: config.listing.next.clone(),
            };
            let extractor =
                FieldExtractor::compile(&config.listing.fields, &config.listing.empty_sentinel)?;
            let marker = config.listing.marker.clone();
            crawl(&config, mode, extractor, marker).await
        }
        Commands::Products {
            seeds,
            base_url,
            start,
            max_items,
            out,
        } => {
            apply_overrides(&mut config, out, max_items);
            let seeds = load_seeds(&seeds)?;
            info!("{} seeds loaded", seeds.len());
            let base_url = base_url.or_else(|| config.product.base_url.clone()).ok_or_else(
                || anyhow::anyhow!("no base URL; pass --base-url or set [product].base_url"),
            )?;
            let mode = CrawlMode::Bounded {
                base_url,
                seeds,
                start,
            };
            let extractor =
                FieldExtractor::compile(&config.product.fields, &config.product.empty_sentinel)?;
            let marker = config.product.marker.clone();
            crawl(&config, mode, extractor, marker).await
        }
        Commands::Finalize { out } => {
            apply_overrides(&mut config, out, None);
            cmd_finalize(&config)
        }
    }
}

fn apply_overrides(config: &mut Config, out: Option<PathBuf>, max_items: Option<u64>) {
    if let Some(dir) = out {
        config.output.data_dir = dir;
    }
    if let Some(cap) = max_items {
        config.limits.max_items = Some(cap);
    }
}

async fn crawl(
    config: &Config,
    mode: CrawlMode,
    extractor: FieldExtractor,
    marker: String,
) -> anyhow::Result<()> {
    probe_proxy(&config.proxy, PROXY_PROBE_TIMEOUT).await?;

    let driver = launch_driver(config).await?;
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
    let scheduler = BackoffScheduler::new(config.pacing.clone());
    let navigator = Navigator::new(driver, &config.navigation, scheduler.clone(), sleeper.clone());

    // Fresh session, no carried-over cookie state.
    if let Err(e) = navigator.delete_cookies().await {
        warn!("could not clear cookies at startup: {}", e);
    }

    let store = CheckpointStore::open(
        config.output.checkpoint_log_path(),
        config.output.artifact_path(),
        config.output.error_page_path(),
    )?;
    let rotator = IdentityRotator::new(&config.proxy, scheduler.settle_delay(), sleeper.clone());
    let detector = BlockDetector::new(&config.detection);

    let services = CrawlServices {
        navigator,
        extractor,
        detector,
        rotator,
        scheduler,
        sleeper,
        store,
    };
    let limits = CrawlLimits {
        max_items: config.limits.max_items,
        failure_ceiling: config.limits.failure_ceiling,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing the current item, then terminating");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} {pos} captured  {wide_msg}").unwrap(),
    );
    progress.enable_steady_tick(Duration::from_millis(120));

    let controller = PaginationController::new(services, mode, marker, limits, cancel)?
        .with_progress({
            let progress = progress.clone();
            Box::new(move |captured, url| {
                progress.set_position(captured);
                progress.set_message(url.to_string());
            })
        });

    match controller.run().await {
        Ok(summary) => {
            progress.finish_and_clear();
            println!(
                "{} {} — {} captured, {} duplicates skipped, {} pages",
                style("✓").green(),
                summary.outcome,
                summary.captured,
                summary.duplicates_skipped,
                summary.pages_visited
            );
            println!("  artifact: {}", summary.artifact.display());
            Ok(())
        }
        Err(e) => {
            progress.finish_and_clear();
            eprintln!("{} {}", style("✗").red(), e);
            Err(e.into())
        }
    }
}

#[cfg(feature = "browser")]
async fn launch_driver(config: &Config) -> anyhow::Result<Box<dyn PageDriver>> {
    let driver = crate::browser::CdpDriver::launch(
        &config.browser,
        &config.proxy.host,
        config.proxy.socks_port,
    )
    .await?;
    Ok(Box::new(driver))
}

#[cfg(not(feature = "browser"))]
async fn launch_driver(_config: &Config) -> anyhow::Result<Box<dyn PageDriver>> {
    anyhow::bail!("browser support not compiled; rebuild with: cargo build --features browser")
}

fn cmd_finalize(config: &Config) -> anyhow::Result<()> {
    let mut store = CheckpointStore::open(
        config.output.checkpoint_log_path(),
        config.output.artifact_path(),
        config.output.error_page_path(),
    )?;
    let artifact = store.finalize()?;
    println!("{} artifact: {}", style("✓").green(), artifact.display());
    Ok(())
}
