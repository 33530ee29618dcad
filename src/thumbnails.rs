#![forbid(unsafe_code)]

//! Thumbnail backfill.
//!
//! Videos that will never get a full media download still get their
//! thumbnail archived. The loop is rate-limited by sleeping after every few
//! fetches instead of after each one.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::site::Site;
use crate::store::{CatalogStore, ExtraFiles, ThumbnailCandidate};

/// Fetches between sleeps.
const FETCH_CHUNK: usize = 5;
const CHUNK_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct BackfillStats {
    pub fetched: usize,
    pub already_present: usize,
    pub failed: usize,
}

/// Downloads missing thumbnails for one site and records the artifact paths.
/// Individual fetch failures are logged and skipped.
pub async fn backfill(
    store: &CatalogStore,
    agent: &ureq::Agent,
    site: Site,
    data_dir: &Path,
) -> Result<BackfillStats> {
    let candidates = store.thumbnails_missing(site).await?;
    if candidates.is_empty() {
        return Ok(BackfillStats::default());
    }

    let dir = data_dir.join("thumbnails").join(site.id().to_string());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating thumbnail directory {}", dir.display()))?;

    info!(%site, count = candidates.len(), "backfilling thumbnails");
    let mut stats = BackfillStats::default();
    let mut since_sleep = 0usize;

    for candidate in &candidates {
        let Some(url) = candidate.thumbnail_url.as_deref() else {
            debug!(video = %candidate.video_id, "no thumbnail URL known");
            stats.failed += 1;
            continue;
        };

        let path = dir.join(format!("{}.jpg", candidate.video_id));
        if path.exists() {
            stats.already_present += 1;
            record(store, candidate, &path).await?;
            continue;
        }

        match fetch(agent, url, &path) {
            Ok(()) => {
                stats.fetched += 1;
                record(store, candidate, &path).await?;
                if chunk_elapsed(&mut since_sleep) {
                    tokio::time::sleep(CHUNK_SLEEP).await;
                }
            }
            Err(err) => {
                warn!(video = %candidate.video_id, %err, "thumbnail fetch failed");
                stats.failed += 1;
            }
        }
    }

    info!(
        fetched = stats.fetched,
        already_present = stats.already_present,
        failed = stats.failed,
        "thumbnail backfill finished"
    );
    Ok(stats)
}

/// Counts fetches since the last pause; true once per full chunk so failed
/// candidates in between never trigger extra sleeps.
fn chunk_elapsed(since_sleep: &mut usize) -> bool {
    *since_sleep += 1;
    if *since_sleep >= FETCH_CHUNK {
        *since_sleep = 0;
        true
    } else {
        false
    }
}

fn fetch(agent: &ureq::Agent, url: &str, path: &Path) -> Result<()> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("requesting {url}"))?;

    let mut body = Vec::new();
    response
        .into_reader()
        .take(10 * 1024 * 1024)
        .read_to_end(&mut body)
        .context("reading thumbnail body")?;
    std::fs::write(path, &body).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

async fn record(store: &CatalogStore, candidate: &ThumbnailCandidate, path: &Path) -> Result<()> {
    store
        .update_extra_files(&ExtraFiles {
            video_id: candidate.id,
            thumbnail: Some(path.to_string_lossy().into_owned()),
            ..ExtraFiles::default()
        })
        .await
}
