#![forbid(unsafe_code)]

//! Run-scoped identity cache.
//!
//! Primed from the catalog once at run start and owned by the reconciliation
//! session on the main thread. Nothing here is shared or persisted; the cache
//! dies with the run.

use std::collections::{HashMap, HashSet};

use anyhow::Result;

use crate::site::Site;
use crate::store::CatalogStore;

#[derive(Debug, Default)]
pub struct RunCache {
    /// External video id -> internal catalog id, per site.
    video_ids: HashMap<Site, HashMap<String, i64>>,
    /// External video ids already reconciled this run, per site. A video in
    /// several playlists is only detailed and diffed once.
    already_checked: HashMap<Site, HashSet<String>>,
    /// Lower-cased tag -> catalog tag id.
    tags: HashMap<String, i64>,
    /// Channel ids whose details are already in the catalog, per site.
    channels: HashMap<Site, HashSet<String>>,
}

impl RunCache {
    /// Loads every known identity from the catalog in one pass.
    pub async fn prime(store: &CatalogStore) -> Result<Self> {
        let mut cache = Self::default();
        for &site in Site::ALL {
            cache
                .video_ids
                .insert(site, store.all_video_ids(site).await?);
            cache
                .channels
                .insert(site, store.all_channel_ids(site).await?);
            cache.already_checked.insert(site, HashSet::new());
        }
        cache.tags = store.all_tags().await?;
        Ok(cache)
    }

    pub fn video_id(&self, site: Site, external_id: &str) -> Option<i64> {
        self.video_ids.get(&site)?.get(external_id).copied()
    }

    pub fn insert_video_ids(&mut self, site: Site, resolved: HashMap<String, i64>) {
        self.video_ids.entry(site).or_default().extend(resolved);
    }

    pub fn is_checked(&self, site: Site, external_id: &str) -> bool {
        self.already_checked
            .get(&site)
            .is_some_and(|checked| checked.contains(external_id))
    }

    pub fn checked_set(&self, site: Site) -> &HashSet<String> {
        static EMPTY: std::sync::LazyLock<HashSet<String>> =
            std::sync::LazyLock::new(HashSet::new);
        self.already_checked.get(&site).unwrap_or(&EMPTY)
    }

    pub fn mark_checked(&mut self, site: Site, external_ids: impl IntoIterator<Item = String>) {
        self.already_checked
            .entry(site)
            .or_default()
            .extend(external_ids);
    }

    pub fn tag_id(&self, tag: &str) -> Option<i64> {
        self.tags.get(tag).copied()
    }

    pub fn insert_tags(&mut self, resolved: HashMap<String, i64>) {
        self.tags.extend(resolved);
    }

    pub fn channel_known(&self, site: Site, channel_id: &str) -> bool {
        self.channels
            .get(&site)
            .is_some_and(|known| known.contains(channel_id))
    }

    pub fn mark_channels_known(
        &mut self,
        site: Site,
        channel_ids: impl IntoIterator<Item = String>,
    ) {
        self.channels.entry(site).or_default().extend(channel_ids);
    }
}
