#![forbid(unsafe_code)]

//! Playlist watcher entry point.
//!
//! One invocation is one run: reconcile every configured playlist, download
//! whatever got flagged for archival, backfill missing thumbnails, then wait
//! for the notification scripts to drain. Meant to be driven by cron.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use playlist_watcher::{
    api::YouTubeApi,
    cache::RunCache,
    config::{
        Config, DEFAULT_CONFIG_PATH, RuntimeOverrides, resolve_runtime_settings,
    },
    download::{YtDlpDownloader, ensure_ytdlp_available, run_downloads},
    reconciler::Reconciler,
    scripts::Dispatcher,
    security::ensure_not_root,
    site::Site,
    storage::NullStorage,
    store::CatalogStore,
    thumbnails,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "check_playlists", about = "Reconcile tracked playlists against the catalog")]
struct Args {
    /// Path to the TOML run configuration.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Only check the given playlist ids (repeatable).
    #[arg(long = "specific", value_name = "PLAYLIST_ID")]
    specific: Vec<String>,

    /// Reconcile only; skip the download and thumbnail passes.
    #[arg(long)]
    no_downloads: bool,

    /// Catalog database path (overrides CATALOG_DB).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Platform API key (overrides YT_API_KEY).
    #[arg(long)]
    api_key: Option<String>,

    /// Alternative .env file location.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

/// Exclusive run lock. A second invocation while the file exists aborts; the
/// file is removed when the run ends.
#[derive(Debug)]
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(path: &Path) -> Result<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Self {
                path: path.to_owned(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!(
                    "another run appears to be in progress (lock file {} exists); \
                     remove it if the previous run crashed",
                    path.display()
                );
            }
            Err(err) => {
                Err(err).with_context(|| format!("creating lock file {}", path.display()))
            }
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove lock file");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    ensure_not_root("check_playlists")?;
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let settings = resolve_runtime_settings(RuntimeOverrides {
        db_path: args.db,
        api_key: args.api_key,
        env_path: args.env_file,
    })?;

    let _lock = RunLock::acquire(&settings.db_path.with_extension("lock"))?;

    let store = CatalogStore::open(&settings.db_path).await?;
    let api = YouTubeApi::new(settings.api_key.clone());

    let only: Option<HashSet<String>> = if args.specific.is_empty() {
        None
    } else {
        Some(args.specific.iter().cloned().collect())
    };

    info!(playlists = config.playlists.len(), "starting check");
    let cache = RunCache::prime(&store).await?;
    let mut reconciler = Reconciler::new(&store, &api, cache);
    let outcomes = reconciler.reconcile_all(&config, only.as_ref()).await;
    info!(reconciled = outcomes.len(), "reconciliation finished");

    // Scripts start right away; they drain while downloads run.
    let mut dispatcher = Dispatcher::new();
    for outcome in &outcomes {
        dispatcher.dispatch_playlist(outcome);
    }

    if args.no_downloads {
        info!("downloads disabled for this run");
    } else {
        let candidates = store
            .videos_to_download(reconciler.touched_playlists())
            .await?;
        if !candidates.is_empty() {
            ensure_ytdlp_available()?;
            run_downloads(&store, &config, &candidates, &YtDlpDownloader, &NullStorage).await?;
        }

        let agent = ureq::AgentBuilder::new().build();
        for &site in Site::ALL {
            thumbnails::backfill(&store, &agent, site, &config.data_dir).await?;
        }
    }

    dispatcher.drain().await;
    info!("run complete");
    Ok(())
}
