#![forbid(unsafe_code)]

//! Platform API collaborator. The reconciler only depends on the
//! [`PlatformApi`] trait; [`YouTubeApi`] implements it over the YouTube Data
//! v3 REST API with blocking `ureq` calls.
//!
//! Every request failure is surfaced as an [`ApiError`] so callers can skip
//! a single playlist without aborting the whole run.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
/// Maximum ids per detail lookup accepted by the platform.
pub const DETAIL_BATCH_SIZE: usize = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("platform request failed: {0}")]
    Request(String),
    #[error("unexpected platform response: {0}")]
    Decode(String),
    #[error("playlist {0} not found")]
    PlaylistNotFound(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One remote video as returned by the detail lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoEntry {
    pub video_id: String,
    pub title: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail: Option<String>,
    pub tags: Vec<String>,
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEntry {
    pub channel_id: String,
    pub name: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistInfo {
    pub playlist_id: String,
    pub title: String,
}

/// Capability consumed by the reconciler. Calls are synchronous; the run
/// processes playlists sequentially.
pub trait PlatformApi {
    /// Cheap membership listing: video ids only, in playlist order.
    fn list_playlist_items(&self, playlist_id: &str) -> ApiResult<Vec<String>>;

    /// Batched full detail lookup. Ids missing from the response are treated
    /// as deleted by the caller.
    fn fetch_item_details(&self, ids: &[String]) -> ApiResult<Vec<VideoEntry>>;

    fn fetch_channel_details(&self, ids: &[String]) -> ApiResult<Vec<ChannelEntry>>;

    fn fetch_playlist_info(&self, playlist_id: &str) -> ApiResult<PlaylistInfo>;
}

// Wire format. Only the fields we read are declared; everything is optional
// because partially deleted resources come back with sparse snippets.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemResource {
    content_details: Option<PlaylistItemContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContent {
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
    snippet: Option<VideoSnippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    title: Option<String>,
    description: Option<String>,
    published_at: Option<String>,
    channel_id: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    thumbnails: HashMap<String, Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct ChannelResource {
    id: String,
    snippet: Option<ChannelSnippet>,
}

#[derive(Debug, Deserialize)]
struct ChannelSnippet {
    title: Option<String>,
    #[serde(default)]
    thumbnails: HashMap<String, Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct PlaylistResource {
    snippet: Option<PlaylistSnippet>,
}

#[derive(Debug, Deserialize)]
struct PlaylistSnippet {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// Picks the largest available thumbnail variant.
fn best_thumbnail(thumbnails: &HashMap<String, Thumbnail>) -> Option<String> {
    for quality in ["maxres", "standard", "high", "medium", "default"] {
        if let Some(thumb) = thumbnails.get(quality) {
            return Some(thumb.url.clone());
        }
    }
    None
}

fn parse_published_at(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc))
}

impl VideoResource {
    fn into_entry(self) -> VideoEntry {
        let snippet = self.snippet;
        match snippet {
            Some(snippet) => VideoEntry {
                video_id: self.id,
                title: snippet.title.unwrap_or_default(),
                description: snippet.description.unwrap_or_default(),
                published_at: parse_published_at(snippet.published_at.as_deref()),
                thumbnail: best_thumbnail(&snippet.thumbnails),
                tags: snippet.tags,
                channel_id: snippet.channel_id,
            },
            None => VideoEntry {
                video_id: self.id,
                title: String::new(),
                description: String::new(),
                published_at: None,
                thumbnail: None,
                tags: Vec::new(),
                channel_id: None,
            },
        }
    }
}

impl ChannelResource {
    fn into_entry(self) -> ChannelEntry {
        let snippet = self.snippet;
        match snippet {
            Some(snippet) => ChannelEntry {
                channel_id: self.id,
                name: snippet.title,
                thumbnail: best_thumbnail(&snippet.thumbnails),
            },
            None => ChannelEntry {
                channel_id: self.id,
                name: None,
                thumbnail: None,
            },
        }
    }
}

/// YouTube Data v3 client.
pub struct YouTubeApi {
    agent: ureq::Agent,
    api_key: String,
    base_url: String,
}

impl YouTubeApi {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, API_BASE)
    }

    /// Used by tests to point the client at a local endpoint.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
        page_token: Option<&str>,
    ) -> ApiResult<Page<T>> {
        let url = format!("{}/{}", self.base_url, resource);
        let mut request = self.agent.get(&url).query("key", &self.api_key);
        for (key, value) in query {
            request = request.query(key, value);
        }
        if let Some(token) = page_token {
            request = request.query("pageToken", token);
        }

        let response = request
            .call()
            .map_err(|err| ApiError::Request(err.to_string()))?;
        response
            .into_json::<Page<T>>()
            .map_err(|err| ApiError::Decode(err.to_string()))
    }

    /// Follows `nextPageToken` until the listing is exhausted.
    fn get_all_pages<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> ApiResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.get_page::<T>(resource, query, page_token.as_deref())?;
            items.extend(page.items);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(items)
    }
}

impl PlatformApi for YouTubeApi {
    fn list_playlist_items(&self, playlist_id: &str) -> ApiResult<Vec<String>> {
        let items: Vec<PlaylistItemResource> = self.get_all_pages(
            "playlistItems",
            &[
                ("part", "contentDetails"),
                ("maxResults", "50"),
                ("playlistId", playlist_id),
            ],
        )?;

        Ok(items
            .into_iter()
            .filter_map(|item| item.content_details.map(|content| content.video_id))
            .collect())
    }

    fn fetch_item_details(&self, ids: &[String]) -> ApiResult<Vec<VideoEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(DETAIL_BATCH_SIZE) {
            let joined = chunk.join(",");
            let items: Vec<VideoResource> = self.get_all_pages(
                "videos",
                &[("part", "snippet"), ("id", &joined), ("maxResults", "50")],
            )?;
            entries.extend(items.into_iter().map(VideoResource::into_entry));
        }
        Ok(entries)
    }

    fn fetch_channel_details(&self, ids: &[String]) -> ApiResult<Vec<ChannelEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(DETAIL_BATCH_SIZE) {
            let joined = chunk.join(",");
            let items: Vec<ChannelResource> = self.get_all_pages(
                "channels",
                &[("part", "snippet"), ("id", &joined), ("maxResults", "50")],
            )?;
            entries.extend(items.into_iter().map(ChannelResource::into_entry));
        }
        Ok(entries)
    }

    fn fetch_playlist_info(&self, playlist_id: &str) -> ApiResult<PlaylistInfo> {
        let items: Vec<PlaylistResource> =
            self.get_all_pages("playlists", &[("part", "snippet"), ("id", playlist_id)])?;

        let Some(playlist) = items.into_iter().next() else {
            return Err(ApiError::PlaylistNotFound(playlist_id.to_string()));
        };

        Ok(PlaylistInfo {
            playlist_id: playlist_id.to_string(),
            title: playlist
                .snippet
                .and_then(|snippet| snippet.title)
                .unwrap_or_else(|| playlist_id.to_string()),
        })
    }
}
