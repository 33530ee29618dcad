#![forbid(unsafe_code)]

//! Video archival via yt-dlp.
//!
//! After all playlists are reconciled the driver walks the selected
//! candidates, invokes the external downloader for each and records the
//! outcome. Every iteration is independent; a failed download never stops
//! the rest of the batch.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

#[cfg(test)]
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SleepBounds};
use crate::site::Site;
use crate::store::{BLOCKED_FORMAT, CatalogStore, DownloadCandidate, ExtraFiles};
use crate::storage::ObjectStorage;

/// yt-dlp output template; the title is capped so filenames stay within
/// filesystem limits.
const OUTPUT_TEMPLATE: &str = "%(title).200B [%(id)s].%(ext)s";

/// stderr fragments that mean the video can never be downloaded from here.
const BLOCKED_PATTERNS: &[&str] = &[
    "blocked in your",
    "copyright grounds",
    "video unavailable",
];

pub fn is_blocked_error(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    BLOCKED_PATTERNS.iter().any(|pattern| lowered.contains(pattern))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub format_override: Option<String>,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Success {
        filename: String,
        format: String,
        info_json: Option<String>,
        thumbnail: Option<String>,
        subtitles: Vec<String>,
    },
    /// Permanent refusal (region block, takedown, removal). Recorded with a
    /// sentinel format so the video is not retried every run.
    Blocked,
    /// Transient or unknown failure; row state is left untouched so the next
    /// run retries.
    Failed,
}

/// External download capability. One call, one video.
pub trait Downloader {
    fn download(&self, request: &DownloadRequest) -> DownloadOutcome;
}

#[cfg(test)]
static YT_DLP_STUB: Mutex<Option<PathBuf>> = Mutex::new(None);
#[cfg(test)]
static STUB_USE_LOCK: Mutex<()> = Mutex::new(());

fn yt_dlp_command() -> Command {
    #[cfg(test)]
    {
        if let Some(path) = YT_DLP_STUB.lock().unwrap().clone() {
            return Command::new(path);
        }
    }
    Command::new("yt-dlp")
}

#[cfg(test)]
fn set_ytdlp_stub_path(path: PathBuf) -> YtDlpStubGuard {
    let guard = STUB_USE_LOCK.lock().unwrap();
    {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = Some(path);
    }
    YtDlpStubGuard { lock: Some(guard) }
}

#[cfg(test)]
struct YtDlpStubGuard {
    lock: Option<MutexGuard<'static, ()>>,
}

#[cfg(test)]
impl Drop for YtDlpStubGuard {
    fn drop(&mut self) {
        let mut lock = YT_DLP_STUB.lock().unwrap();
        *lock = None;
        self.lock.take();
    }
}

/// Fails loudly when yt-dlp is missing instead of erroring on the first
/// candidate.
pub fn ensure_ytdlp_available() -> Result<()> {
    let status = Command::new("yt-dlp")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => anyhow::bail!("yt-dlp is installed but returned a failure status"),
        Err(err) => anyhow::bail!("yt-dlp is not installed or not in PATH: {err}"),
    }
}

/// Spawns yt-dlp for one video and collects the resulting artifact paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct YtDlpDownloader;

impl Downloader for YtDlpDownloader {
    fn download(&self, request: &DownloadRequest) -> DownloadOutcome {
        if let Err(err) = std::fs::create_dir_all(&request.output_dir) {
            error!(dir = %request.output_dir.display(), %err, "cannot create download directory");
            return DownloadOutcome::Failed;
        }

        let mut command = yt_dlp_command();
        command
            .arg("--no-progress")
            .arg("--no-warnings")
            .arg("--write-info-json")
            .arg("--write-thumbnail")
            .arg("--write-subs")
            .arg("--sub-langs")
            .arg("all")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--print")
            .arg("after_move:format")
            .arg("-o")
            .arg(request.output_dir.join(OUTPUT_TEMPLATE));
        if let Some(format) = &request.format_override {
            command.arg("-f").arg(format);
        }
        if request.overwrite {
            command.arg("--force-overwrites");
        }
        command.arg(&request.url);

        let output = match command.output() {
            Ok(output) => output,
            Err(err) => {
                error!(url = %request.url, %err, "failed to spawn yt-dlp");
                return DownloadOutcome::Failed;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if is_blocked_error(&stderr) {
                warn!(url = %request.url, "video is blocked: {}", stderr.trim());
                return DownloadOutcome::Blocked;
            }
            error!(url = %request.url, status = %output.status, "yt-dlp failed: {}", stderr.trim());
            return DownloadOutcome::Failed;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        let Some(filename) = lines.next().filter(|line| !line.is_empty()) else {
            error!(url = %request.url, "yt-dlp succeeded but printed no filepath");
            return DownloadOutcome::Failed;
        };
        let format = lines.next().unwrap_or("unknown").to_owned();

        let (info_json, thumbnail, subtitles) = sibling_artifacts(Path::new(filename));
        DownloadOutcome::Success {
            filename: filename.to_owned(),
            format,
            info_json,
            thumbnail,
            subtitles,
        }
    }
}

/// Locates the info JSON, thumbnail and subtitle files yt-dlp wrote next to
/// the media file.
fn sibling_artifacts(media: &Path) -> (Option<String>, Option<String>, Vec<String>) {
    let stem = media.with_extension("");
    let stem_str = stem.to_string_lossy().into_owned();

    let info_json = existing(format!("{stem_str}.info.json"));
    let thumbnail = ["webp", "jpg", "png"]
        .iter()
        .find_map(|ext| existing(format!("{stem_str}.{ext}")));

    let mut subtitles = Vec::new();
    for ext in ["ass", "vtt", "srt", "ttml", "srv3"] {
        let suffix = format!(".{ext}");
        if let Some(dir) = media.parent()
            && let Ok(entries) = std::fs::read_dir(dir)
        {
            for entry in entries.flatten() {
                let path = entry.path();
                let name = path.to_string_lossy().into_owned();
                if name.starts_with(&stem_str) && name.ends_with(&suffix) {
                    subtitles.push(name);
                }
            }
        }
    }
    subtitles.sort();

    (info_json, thumbnail, subtitles)
}

fn existing(path: String) -> Option<String> {
    Path::new(&path).exists().then_some(path)
}

async fn rate_limit_sleep(bounds: SleepBounds) {
    let secs = rand::thread_rng().gen_range(bounds.min..=bounds.max);
    if secs > 0 {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct DownloadStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub blocked: usize,
    pub failed: usize,
}

/// Walks the candidates, downloading up to the configured per-run cap and
/// persisting each outcome as it happens.
pub async fn run_downloads<D: Downloader, S: ObjectStorage>(
    store: &CatalogStore,
    config: &Config,
    candidates: &[DownloadCandidate],
    downloader: &D,
    storage: &S,
) -> Result<DownloadStats> {
    let cap = usize::try_from(config.max_downloads_per_run).unwrap_or(usize::MAX);
    let mut stats = DownloadStats::default();

    for candidate in candidates.iter().take(cap) {
        let Some(site) = Site::from_id(candidate.site) else {
            warn!(video = %candidate.video_id, site = candidate.site, "unknown site id, skipping");
            continue;
        };

        stats.attempted += 1;
        info!(video = %candidate.video_id, "downloading");
        let request = DownloadRequest {
            url: site.video_url(&candidate.video_id),
            output_dir: config
                .data_dir
                .join("videos")
                .join(site.id().to_string()),
            format_override: candidate.download_format.clone(),
            overwrite: candidate.force_redownload,
        };

        match downloader.download(&request) {
            DownloadOutcome::Success {
                filename,
                format,
                info_json,
                thumbnail,
                subtitles,
            } => {
                stats.succeeded += 1;
                // Snapshot the old artifact references before the coalesce
                // write replaces them.
                let previous_extra = if config.delete_old_files {
                    store.get_extra_files(candidate.id).await?
                } else {
                    None
                };

                store
                    .update_downloaded(candidate.id, Some(&filename), Some(&format))
                    .await?;
                store
                    .update_extra_files(&ExtraFiles {
                        video_id: candidate.id,
                        thumbnail: thumbnail.clone(),
                        info_json: info_json.clone(),
                        subtitles,
                        ..ExtraFiles::default()
                    })
                    .await?;

                if config.delete_old_files {
                    delete_superseded(storage, candidate.downloaded_filename.as_deref(), &filename);
                    if let Some(previous) = previous_extra {
                        for (old, new) in [
                            (previous.thumbnail, thumbnail),
                            (previous.info_json, info_json),
                        ] {
                            if let Some(new) = new {
                                delete_superseded(storage, old.as_deref(), &new);
                            }
                        }
                    }
                }
            }
            DownloadOutcome::Blocked => {
                stats.blocked += 1;
                store
                    .update_downloaded(candidate.id, None, Some(BLOCKED_FORMAT))
                    .await?;
            }
            DownloadOutcome::Failed => {
                stats.failed += 1;
            }
        }

        rate_limit_sleep(config.download_sleep).await;
    }

    info!(
        attempted = stats.attempted,
        succeeded = stats.succeeded,
        blocked = stats.blocked,
        failed = stats.failed,
        "download pass finished"
    );
    Ok(stats)
}

/// Removes the artifact a re-download just replaced.
///
/// Two guards: never delete when the old reference equals the new one, and a
/// name without a path separator is treated as a flat remote object key and
/// handed to the storage backend instead of the filesystem.
fn delete_superseded<S: ObjectStorage>(storage: &S, old: Option<&str>, new: &str) {
    let Some(old) = old.filter(|old| !old.is_empty()) else {
        return;
    };
    if old == new {
        debug!(path = %old, "filename unchanged, keeping artifact");
        return;
    }

    if old.contains('/') {
        match std::fs::remove_file(old) {
            Ok(()) => info!(path = %old, "removed superseded local file"),
            Err(err) => warn!(path = %old, %err, "could not remove superseded file"),
        }
    } else if let Err(err) = storage.delete(old) {
        warn!(key = %old, %err, "could not delete superseded remote object");
    } else {
        info!(key = %old, "deleted superseded remote object");
    }
}
