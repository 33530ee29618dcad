#![forbid(unsafe_code)]

//! Per-playlist reconciliation.
//!
//! For each configured playlist the reconciler lists remote membership,
//! partitions it into current/deleted/already-checked sets, and persists the
//! consequences step by step. Each persistence step commits on its own; a
//! later failure leaves earlier steps durably applied. A failure anywhere in
//! a playlist aborts that playlist only, never the run.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::api::{PlatformApi, VideoEntry};
use crate::cache::RunCache;
use crate::config::{Config, PlaylistConfig, ScriptConfig};
use crate::scripts::{self, ScriptField};
use crate::site::Site;
use crate::store::{CatalogStore, DeletedVideoInfo, PlaylistRow, VideoTitle};

/// Disjoint membership partition for one playlist.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Partition {
    /// Ids confirmed live by the detail lookup this run.
    pub current: Vec<String>,
    /// Ids listed in the playlist but absent from the detail response.
    pub deleted: Vec<String>,
    /// Members already reconciled earlier this run via another playlist.
    pub already_checked: Vec<String>,
}

/// Pure set algebra over membership ids.
///
/// `deleted = membership − detail − checked`; `current = detail`. The detail
/// response can only contain requested ids, so the three sets are disjoint by
/// construction. Input order is preserved, duplicates dropped.
pub fn partition(
    membership: &[String],
    detail_ids: &HashSet<String>,
    checked: &HashSet<String>,
) -> Partition {
    let mut out = Partition::default();
    let mut seen = HashSet::with_capacity(membership.len());

    for id in membership {
        if !seen.insert(id.as_str()) {
            continue;
        }
        if checked.contains(id) {
            out.already_checked.push(id.clone());
        } else if detail_ids.contains(id) {
            out.current.push(id.clone());
        } else {
            out.deleted.push(id.clone());
        }
    }
    out
}

/// What changed in one playlist, as far as the dispatcher needs to know.
/// Expensive fields are `None` when no script asked for them.
#[derive(Debug, Clone, Default)]
pub struct ChangeReport {
    pub deleted_ids: Vec<String>,
    /// External ids new to this playlist's membership.
    pub new: Option<Vec<String>>,
    /// First-time deletions, with last-known titles.
    pub newly_deleted: Option<Vec<VideoTitle>>,
    /// All deleted ids enriched with title and channel info.
    pub deleted_details: Option<Vec<DeletedVideoInfo>>,
}

/// Result of reconciling one playlist, handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct PlaylistOutcome {
    pub playlist: PlaylistRow,
    pub site: Site,
    pub scripts: Vec<ScriptConfig>,
    pub changes: ChangeReport,
}

/// Drives reconciliation for a whole run. Owns the run cache; the store and
/// API stay on the main thread for the entire run.
pub struct Reconciler<'a, A: PlatformApi> {
    store: &'a CatalogStore,
    api: &'a A,
    cache: RunCache,
    /// Internal playlist ids touched this run, for download selection.
    touched: Vec<i64>,
}

impl<'a, A: PlatformApi> Reconciler<'a, A> {
    pub fn new(store: &'a CatalogStore, api: &'a A, cache: RunCache) -> Self {
        Self {
            store,
            api,
            cache,
            touched: Vec::new(),
        }
    }

    pub fn touched_playlists(&self) -> &[i64] {
        &self.touched
    }

    /// Reconciles every configured playlist in order, optionally restricted
    /// to an allow-list of playlist ids. A playlist failure is logged and the
    /// run moves on.
    pub async fn reconcile_all(
        &mut self,
        config: &Config,
        only: Option<&HashSet<String>>,
    ) -> Vec<PlaylistOutcome> {
        let mut outcomes = Vec::new();
        for playlist in &config.playlists {
            if let Some(allowed) = only
                && !allowed.contains(&playlist.playlist_id)
            {
                debug!(playlist = %playlist.playlist_id, "not in allow-list, skipping");
                continue;
            }

            match self.reconcile_playlist(config, playlist).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(err) => {
                    error!(playlist = %playlist.playlist_id, "reconciliation failed, moving on: {err:#}");
                }
            }
        }
        outcomes
    }

    /// Runs the full reconciliation sequence for one playlist. Returns
    /// `Ok(None)` when the playlist was skipped (API failure or unknown
    /// remote playlist).
    pub async fn reconcile_playlist(
        &mut self,
        config: &Config,
        playlist: &PlaylistConfig,
    ) -> Result<Option<PlaylistOutcome>> {
        let site = playlist.site;
        info!(playlist = %playlist.playlist_id, %site, "checking playlist");

        let Some(row) = self.resolve_playlist_row(playlist).await? else {
            return Ok(None);
        };

        let membership = match self.api.list_playlist_items(&playlist.playlist_id) {
            Ok(ids) => ids,
            Err(err) => {
                error!(playlist = %playlist.playlist_id, %err, "membership listing failed");
                return Ok(None);
            }
        };

        let to_check: Vec<String> = membership
            .iter()
            .filter(|id| !self.cache.is_checked(site, id))
            .cloned()
            .collect();
        let entries = match self.api.fetch_item_details(&to_check) {
            Ok(entries) => entries,
            Err(err) => {
                error!(playlist = %playlist.playlist_id, %err, "detail lookup failed");
                return Ok(None);
            }
        };

        let detail_ids: HashSet<String> =
            entries.iter().map(|entry| entry.video_id.clone()).collect();
        let parts = partition(&membership, &detail_ids, self.cache.checked_set(site));
        info!(
            playlist = %playlist.playlist_id,
            current = parts.current.len(),
            deleted = parts.deleted.len(),
            already_checked = parts.already_checked.len(),
            "partitioned membership"
        );

        let scripts = config.scripts_for(playlist);
        let requested = scripts::requested_fields(&scripts);

        // Fields that must be read before writes change what they observe.
        let newly_deleted = if requested.contains(&ScriptField::NewDeleted) {
            Some(self.store.newly_deleted(site, &parts.deleted).await?)
        } else {
            None
        };
        let prior_members: Option<HashSet<i64>> = if requested.contains(&ScriptField::New) {
            Some(
                self.store
                    .playlist_member_ids(row.id)
                    .await?
                    .into_iter()
                    .collect(),
            )
        } else {
            None
        };

        self.store.upsert_videos(site, &entries).await?;
        self.store.mark_deleted(site, &parts.deleted).await?;

        let resolved = self.resolve_internal_ids(site, &parts).await?;
        let member_ids: Vec<i64> = {
            let mut ids: Vec<i64> = resolved.values().copied().collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        self.store.replace_playlist_videos(row.id, &member_ids).await?;

        if playlist.archive {
            let flagged = self.store.mark_playlist_for_download(row.id).await?;
            if flagged > 0 {
                info!(playlist = %playlist.playlist_id, flagged, "flagged videos for download");
            }
        }

        self.ingest_tags(playlist, &entries, &resolved).await?;
        self.ingest_channels(site, &entries, &resolved).await?;

        self.cache.mark_checked(site, parts.current.iter().cloned());
        self.cache.mark_checked(site, parts.deleted.iter().cloned());
        self.touched.push(row.id);

        let new = match prior_members {
            Some(prior) => Some(
                parts
                    .current
                    .iter()
                    .filter(|id| {
                        resolved
                            .get(id.as_str())
                            .is_none_or(|internal| !prior.contains(internal))
                    })
                    .cloned()
                    .collect(),
            ),
            None => None,
        };
        let deleted_details = if requested.contains(&ScriptField::Deleted) {
            Some(self.store.deleted_info(site, &parts.deleted).await?)
        } else {
            None
        };

        info!(playlist = %playlist.playlist_id, "done checking");
        Ok(Some(PlaylistOutcome {
            playlist: row,
            site,
            scripts,
            changes: ChangeReport {
                deleted_ids: parts.deleted,
                new,
                newly_deleted,
                deleted_details,
            },
        }))
    }

    /// Looks up the playlist row, bootstrapping it from remote info on first
    /// sighting. An info fetch failure skips the playlist.
    async fn resolve_playlist_row(
        &mut self,
        playlist: &PlaylistConfig,
    ) -> Result<Option<PlaylistRow>> {
        if let Some(row) = self
            .store
            .get_playlist(&playlist.playlist_id, playlist.site)
            .await?
        {
            return Ok(Some(row));
        }

        info!(playlist = %playlist.playlist_id, "new playlist, fetching info");
        let info = match self.api.fetch_playlist_info(&playlist.playlist_id) {
            Ok(info) => info,
            Err(err) => {
                error!(playlist = %playlist.playlist_id, %err, "playlist info fetch failed");
                return Ok(None);
            }
        };
        let name = playlist.name.as_deref().unwrap_or(&info.title);
        let row = self
            .store
            .add_playlist(&playlist.playlist_id, name, playlist.site)
            .await?;
        Ok(Some(row))
    }

    /// Resolves internal ids for the full membership union, going to the
    /// store only for ids the cache does not know yet.
    async fn resolve_internal_ids(
        &mut self,
        site: Site,
        parts: &Partition,
    ) -> Result<HashMap<String, i64>> {
        let union = parts
            .current
            .iter()
            .chain(&parts.deleted)
            .chain(&parts.already_checked);

        let mut resolved = HashMap::new();
        let mut unknown = Vec::new();
        for id in union {
            match self.cache.video_id(site, id) {
                Some(internal) => {
                    resolved.insert(id.clone(), internal);
                }
                None => unknown.push(id.clone()),
            }
        }

        if !unknown.is_empty() {
            let fetched = self.store.video_ids_for(site, &unknown).await?;
            for id in &unknown {
                if !fetched.contains_key(id) {
                    // Should not happen after the upserts above.
                    warn!(video = %id, "video id did not resolve, leaving out of membership");
                }
            }
            self.cache.insert_video_ids(site, fetched.clone());
            resolved.extend(fetched);
        }
        Ok(resolved)
    }

    /// Lower-cases and links per-video tags plus the playlist's default tags.
    async fn ingest_tags(
        &mut self,
        playlist: &PlaylistConfig,
        entries: &[VideoEntry],
        resolved: &HashMap<String, i64>,
    ) -> Result<()> {
        let default_tags: Vec<String> = playlist
            .default_tags
            .iter()
            .map(|tag| tag.to_lowercase())
            .collect();

        let mut wanted: HashSet<String> = default_tags.iter().cloned().collect();
        for entry in entries {
            wanted.extend(entry.tags.iter().map(|tag| tag.to_lowercase()));
        }
        if wanted.is_empty() {
            return Ok(());
        }

        let unknown: Vec<String> = wanted
            .iter()
            .filter(|tag| self.cache.tag_id(tag).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            let added = self.store.add_tags(&unknown).await?;
            self.cache.insert_tags(added);
        }

        let mut links = Vec::new();
        for entry in entries {
            let Some(&video_id) = resolved.get(&entry.video_id) else {
                debug!(video = %entry.video_id, "skipping tag links for unresolved video");
                continue;
            };
            let video_tags = entry
                .tags
                .iter()
                .map(|tag| tag.to_lowercase())
                .chain(default_tags.iter().cloned());
            for tag in video_tags {
                match self.cache.tag_id(&tag) {
                    Some(tag_id) => links.push((tag_id, video_id)),
                    None => debug!(%tag, "tag did not resolve, skipping link"),
                }
            }
        }
        self.store.link_video_tags(&links).await?;
        Ok(())
    }

    /// Fetches details for channels unseen this run, upserts them, and links
    /// every current video to its channel. A channel fetch failure only means
    /// the cache does not grow this run.
    async fn ingest_channels(
        &mut self,
        site: Site,
        entries: &[VideoEntry],
        resolved: &HashMap<String, i64>,
    ) -> Result<()> {
        let referenced: HashSet<String> = entries
            .iter()
            .filter_map(|entry| entry.channel_id.clone())
            .collect();
        if referenced.is_empty() {
            return Ok(());
        }

        let uncached: Vec<String> = referenced
            .iter()
            .filter(|id| !self.cache.channel_known(site, id))
            .cloned()
            .collect();
        if !uncached.is_empty() {
            match self.api.fetch_channel_details(&uncached) {
                Ok(channels) => {
                    self.store.upsert_channels(site, &channels).await?;
                    self.cache.mark_channels_known(
                        site,
                        channels.iter().map(|channel| channel.channel_id.clone()),
                    );
                }
                Err(err) => {
                    warn!(%err, "channel detail fetch failed, retrying next run");
                }
            }
        }

        let referenced: Vec<String> = referenced.into_iter().collect();
        let channel_ids = self.store.channel_ids_for(site, &referenced).await?;
        let mut links = Vec::new();
        for entry in entries {
            let (Some(channel), Some(&video_id)) = (
                entry.channel_id.as_ref(),
                resolved.get(&entry.video_id),
            ) else {
                continue;
            };
            match channel_ids.get(channel) {
                Some(&channel_id) => links.push((channel_id, video_id)),
                None => debug!(%channel, "channel not in catalog, skipping link"),
            }
        }
        self.store.link_channel_videos(&links).await?;
        Ok(())
    }
}
