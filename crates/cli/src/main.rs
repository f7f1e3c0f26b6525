//! `filemover` command line front end
//!
//! Drives a `TransferManager` for operators: request files and follow them
//! to completion, look up sources, run a pool sweep by hand, inspect
//! download areas and age old files out of them. Configuration comes from the `FILEMOVER_*` environment
//! variables; logs go to stderr, results to stdout as JSON lines.

mod catalog;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use filemover_core::{
    Lfn, ManagerConfig, SiteId, SiteSelector, SourceLocator, StatusCode, TransferManager,
    TransferStatus,
};
use filemover_storage::{sweep_pool, DownloadArea, StoragePool};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::catalog::StaticCatalog;

/// Fetch files from the storage federation into the local pool
#[derive(Parser)]
#[command(name = "filemover", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Request LFNs and follow them until every transfer has finished
    Fetch(FetchArgs),
    /// Show which source would be used for an LFN
    Locate {
        /// JSON replica catalog
        #[arg(long)]
        catalog: PathBuf,
        /// Sites to skip, as after failed transfers
        #[arg(long = "exclude", short = 'x')]
        exclude: Vec<String>,
        lfn: String,
    },
    /// Run one pool sweep now
    Sweep(PoolArgs),
    /// List a user's published files
    Downloads {
        #[arg(long)]
        user: String,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Remove download-area files nobody has read for a while
    Clean {
        /// Age threshold: a number followed by h (hours), d (days) or m (months of 30 days)
        #[arg(long, default_value = "3m", value_parser = parse_age)]
        older_than: Duration,
        /// Only print what would be removed
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// Validate and print the effective configuration
    Config(PoolArgs),
}

const HOUR_SECS: u64 = 60 * 60;

/// Parse `Xh`, `Xd` or `Xm` into a duration.
fn parse_age(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let unit = match value.chars().last() {
        Some('h') => HOUR_SECS,
        Some('d') => 24 * HOUR_SECS,
        Some('m') => 30 * 24 * HOUR_SECS,
        _ => return Err("expected a number followed by h, d or m".to_string()),
    };
    let count: u64 = value[..value.len() - 1]
        .parse()
        .map_err(|_| format!("{value:?} does not start with a number"))?;
    if count == 0 {
        return Err("the threshold must be longer than zero".to_string());
    }
    count
        .checked_mul(unit)
        .map(Duration::from_secs)
        .ok_or_else(|| "threshold is too large".to_string())
}

#[derive(Args)]
struct FetchArgs {
    /// JSON replica catalog
    #[arg(long)]
    catalog: PathBuf,
    /// User the requests are made for
    #[arg(long)]
    user: String,
    /// Number of concurrent transfers
    #[arg(long)]
    movers: Option<usize>,
    /// Link finished files into the user's download area
    #[arg(long)]
    publish: bool,
    #[command(flatten)]
    pool: PoolArgs,
    #[arg(required = true)]
    lfns: Vec<String>,
}

/// Overrides for the environment configuration
#[derive(Args, Clone, Default)]
struct PoolArgs {
    /// Pool base directory
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Pool quota in GB
    #[arg(long)]
    max_size_gb: Option<f64>,
    /// Root of the per-user download areas
    #[arg(long)]
    download_area: Option<PathBuf>,
}

impl PoolArgs {
    fn config(&self) -> anyhow::Result<ManagerConfig> {
        let mut config = ManagerConfig::from_env();
        if let Some(base) = &self.base_dir {
            config.base_directory = base.clone();
        }
        if let Some(size) = self.max_size_gb {
            config.max_size_gb = size;
        }
        if let Some(area) = &self.download_area {
            config.download_area = Some(area.clone());
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn emit(value: serde_json::Value) {
    println!("{value}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Fetch(args) => fetch(args).await,
        Command::Locate {
            catalog,
            exclude,
            lfn,
        } => locate(catalog, exclude, lfn).await,
        Command::Sweep(pool) => sweep(pool).await,
        Command::Downloads { user, pool } => downloads(&user, &pool),
        Command::Clean {
            older_than,
            dry_run,
            pool,
        } => clean(older_than, dry_run, pool).await,
        Command::Config(pool) => {
            let config = pool.config()?;
            println!("{config:#?}");
            Ok(())
        }
    }
}

async fn fetch(args: FetchArgs) -> anyhow::Result<()> {
    let mut config = args.pool.config()?;
    if let Some(movers) = args.movers {
        config.max_movers = movers;
        config.validate().context("invalid configuration")?;
    }
    let poll = config.poll_interval;

    let catalog = Arc::new(StaticCatalog::load(&args.catalog)?);
    if catalog.is_empty() {
        warn!(catalog = %args.catalog.display(), "Replica catalog lists no files");
    } else {
        info!(files = catalog.len(), "Loaded replica catalog");
    }
    let manager = TransferManager::new(catalog.clone(), catalog);
    manager.configure(config)?;

    let mut pending: Vec<String> = Vec::new();
    let mut rejected = 0usize;
    for lfn in &args.lfns {
        match manager.request(lfn, &args.user).await {
            Ok(admission) => {
                info!(lfn = %lfn, ?admission, "Requested");
                if !pending.contains(lfn) {
                    pending.push(lfn.clone());
                }
            }
            Err(e) => {
                warn!(lfn = %lfn, error = %e, "Request rejected");
                emit(json!({ "lfn": lfn, "error": e.to_string() }));
                rejected += 1;
            }
        }
    }

    let finished = tokio::select! {
        finished = follow(&manager, pending.clone(), poll) => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling outstanding transfers");
            for lfn in &pending {
                manager.cancel(lfn, &args.user).await?;
            }
            BTreeMap::new()
        }
    };

    let mut incomplete = rejected + pending.len() - finished.len();
    for (lfn, status) in &finished {
        if status.code != StatusCode::Done {
            incomplete += 1;
            continue;
        }
        if args.publish {
            match manager.publish(lfn, &args.user) {
                Ok(link) => emit(json!({ "lfn": lfn, "published": link })),
                Err(e) => {
                    warn!(lfn = %lfn, error = %e, "Unable to publish");
                    incomplete += 1;
                }
            }
        }
    }

    manager.shutdown().await?;
    if incomplete > 0 {
        bail!("{incomplete} of {} requested files were not transferred", rejected + pending.len());
    }
    Ok(())
}

/// Poll until every LFN reaches a terminal status, printing each change.
async fn follow(
    manager: &TransferManager,
    mut pending: Vec<String>,
    poll: Duration,
) -> BTreeMap<String, TransferStatus> {
    let mut last: BTreeMap<String, TransferStatus> = BTreeMap::new();
    let mut finished = BTreeMap::new();

    while !pending.is_empty() {
        let mut still_pending = Vec::with_capacity(pending.len());
        for lfn in pending {
            let status = match manager.status(&lfn).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(lfn = %lfn, error = %e, "Unable to get status");
                    continue;
                }
            };
            if last.get(&lfn) != Some(&status) {
                emit(json!({ "lfn": lfn, "status": status }));
                last.insert(lfn.clone(), status.clone());
            }
            if status.is_terminal() {
                finished.insert(lfn, status);
            } else {
                still_pending.push(lfn);
            }
        }
        pending = still_pending;
        if !pending.is_empty() {
            tokio::time::sleep(poll).await;
        }
    }
    finished
}

async fn locate(catalog: PathBuf, exclude: Vec<String>, lfn: String) -> anyhow::Result<()> {
    let config = ManagerConfig::from_env();
    config.validate().context("invalid configuration")?;
    let catalog = Arc::new(StaticCatalog::load(&catalog)?);
    let locator = SourceLocator::new(
        catalog.clone(),
        catalog,
        SiteSelector::new(config.priority_table()?),
        config.protocol.clone(),
        config.location_ttl,
    );

    let lfn = Lfn::parse(&lfn)?;
    let exclude: HashSet<SiteId> = exclude.into_iter().map(SiteId::new).collect();
    let location = locator
        .locate(&lfn, &exclude)
        .await
        .with_context(|| format!("no source for {lfn}"))?;
    emit(json!({ "lfn": lfn, "location": location }));
    Ok(())
}

async fn sweep(pool: PoolArgs) -> anyhow::Result<()> {
    let config = pool.config()?;
    let root = StoragePool::new(config.base_directory.clone()).store_root();
    let quota = config.quota_bytes();
    let report = tokio::task::spawn_blocking(move || sweep_pool(&root, quota)).await??;
    emit(json!({
        "scanned_files": report.scanned_files,
        "total_bytes": report.total_bytes,
        "quota_bytes": report.quota_bytes,
        "freed_bytes": report.freed_bytes,
        "removed": report.removed,
        "pinned": report.pinned,
        "failures": report.failures,
    }));
    Ok(())
}

fn downloads(user: &str, pool: &PoolArgs) -> anyhow::Result<()> {
    let config = pool.config()?;
    let Some(area) = config.download_area else {
        bail!("no download area configured; set FILEMOVER_DOWNLOAD_AREA or --download-area");
    };
    let area = DownloadArea::new(area, StoragePool::new(config.base_directory));
    for entry in area.list(user)? {
        emit(json!({ "file": entry.file_name, "link": entry.link, "size": entry.size }));
    }
    Ok(())
}

async fn clean(older_than: Duration, dry_run: bool, pool: PoolArgs) -> anyhow::Result<()> {
    let config = pool.config()?;
    let Some(area) = config.download_area else {
        bail!("no download area configured; set FILEMOVER_DOWNLOAD_AREA or --download-area");
    };
    let area = DownloadArea::new(area, StoragePool::new(config.base_directory));
    let report = tokio::task::spawn_blocking(move || area.clean(older_than, dry_run)).await??;
    for link in &report.links {
        emit(json!({ "link": link, "removed": !dry_run }));
    }
    for file in &report.pool_files {
        emit(json!({ "pool_file": file, "removed": !dry_run }));
    }
    info!(shared = report.shared, dry_run, "Clean finished");
    Ok(())
}
