#![forbid(unsafe_code)]

//! Catalog persistence layer.
//!
//! Owns the SQLite database that tracks videos, channels, tags, playlists and
//! their relationships. All multi-row writes run inside short-lived
//! transactions scoped to one logical unit so a failing step never leaves a
//! half-written batch behind, while earlier committed units stay applied.
//!
//! Merge semantics: title/description only overwrite when the incoming value
//! is non-null and different; thumbnail, channel name and artifact paths use
//! coalesce writes (null never erases known data); the deleted flag and
//! timestamp are monotonic.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use libsql::{Builder, Connection, Row, Value, params};

use crate::api::{ChannelEntry, VideoEntry};
use crate::site::Site;

/// Title stored for videos that were never seen before deletion.
pub const TOMBSTONE_TITLE: &str = "Deleted video";
/// Sentinel `downloaded_format` recorded for permanently blocked videos so
/// they are not retried every run.
pub const BLOCKED_FORMAT: &str = "-blocked-";

/// How many ids go into a single `IN (...)` lookup.
const LOOKUP_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistRow {
    pub id: i64,
    pub playlist_id: String,
    pub site: i64,
    pub name: String,
}

/// Row state handed to the download collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadCandidate {
    pub id: i64,
    pub site: i64,
    pub video_id: String,
    pub downloaded_filename: Option<String>,
    pub downloaded_format: Option<String>,
    pub download_format: Option<String>,
    pub force_redownload: bool,
}

/// Archival artifacts tracked per video. Every field is merged with coalesce
/// semantics so a partial update never erases known paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraFiles {
    pub video_id: i64,
    pub thumbnail: Option<String>,
    pub info_json: Option<String>,
    pub audio_file: Option<String>,
    pub subtitles: Vec<String>,
    pub other_files: HashMap<String, String>,
}

/// Minimal video info used for script payload enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTitle {
    pub video_id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletedVideoInfo {
    pub video_id: String,
    pub title: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
}

/// A video missing its thumbnail artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ThumbnailCandidate {
    pub id: i64,
    pub video_id: String,
    pub thumbnail_url: Option<String>,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site INTEGER NOT NULL,
            video_id TEXT NOT NULL,
            title TEXT,
            description TEXT,
            published_at TEXT,
            thumbnail TEXT,
            deleted INTEGER NOT NULL DEFAULT 0,
            deleted_at TEXT,
            download INTEGER NOT NULL DEFAULT 0,
            force_redownload INTEGER NOT NULL DEFAULT 0,
            download_format TEXT,
            downloaded_filename TEXT,
            downloaded_format TEXT,
            UNIQUE(site, video_id)
        );

        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site INTEGER NOT NULL,
            channel_id TEXT NOT NULL,
            name TEXT,
            thumbnail TEXT,
            UNIQUE(site, channel_id)
        );

        CREATE TABLE IF NOT EXISTS tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tag TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS video_tags (
            tag_id INTEGER NOT NULL REFERENCES tags(id),
            video_id INTEGER NOT NULL REFERENCES videos(id),
            PRIMARY KEY (tag_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS playlists (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            site INTEGER NOT NULL,
            playlist_id TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(site, playlist_id)
        );

        CREATE TABLE IF NOT EXISTS playlist_videos (
            playlist_id INTEGER NOT NULL REFERENCES playlists(id),
            video_id INTEGER NOT NULL REFERENCES videos(id),
            PRIMARY KEY (playlist_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS channel_videos (
            channel_id INTEGER NOT NULL REFERENCES channels(id),
            video_id INTEGER NOT NULL REFERENCES videos(id),
            PRIMARY KEY (channel_id, video_id)
        );

        CREATE TABLE IF NOT EXISTS extra_video_files (
            video_id INTEGER PRIMARY KEY REFERENCES videos(id),
            thumbnail TEXT,
            info_json TEXT,
            audio_file TEXT,
            subtitles TEXT,
            other_files TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_playlist_videos_video ON playlist_videos(video_id);
        CREATE INDEX IF NOT EXISTS idx_videos_download ON videos(download, force_redownload);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite connection performing all catalog reads/writes.
/// Owned by the main thread; side-effect workers never touch it.
pub struct CatalogStore {
    conn: Connection,
}

impl std::fmt::Debug for CatalogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogStore").finish_non_exhaustive()
    }
}

impl CatalogStore {
    /// Opens (and if necessary creates) the catalog DB and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening catalog DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> &Connection {
        &self.conn
    }

    pub async fn add_playlist(
        &self,
        playlist_id: &str,
        name: &str,
        site: Site,
    ) -> Result<PlaylistRow> {
        self.conn
            .execute(
                "INSERT INTO playlists (site, playlist_id, name) VALUES (?1, ?2, ?3)",
                params![site.id(), playlist_id, name],
            )
            .await?;

        Ok(PlaylistRow {
            id: self.conn.last_insert_rowid(),
            playlist_id: playlist_id.to_owned(),
            site: site.id(),
            name: name.to_owned(),
        })
    }

    pub async fn get_playlist(&self, playlist_id: &str, site: Site) -> Result<Option<PlaylistRow>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, site, playlist_id, name FROM playlists WHERE site=?1 AND playlist_id=?2",
                params![site.id(), playlist_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(PlaylistRow {
            id: row.get(0)?,
            site: row.get(1)?,
            playlist_id: row.get(2)?,
            name: row.get(3)?,
        }))
    }

    /// Inserts new videos and merges fresh metadata into existing rows.
    ///
    /// Title and description only change when the incoming value is non-null
    /// and actually differs; the thumbnail uses coalesce; the earliest known
    /// publish date wins; the deleted flag is cleared on genuine reappearance.
    pub async fn upsert_videos(&self, site: Site, videos: &[VideoEntry]) -> Result<()> {
        if videos.is_empty() {
            return Ok(());
        }

        let sql = r#"
            INSERT INTO videos (site, video_id, title, description, published_at, thumbnail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(site, video_id) DO UPDATE SET
                title=CASE
                    WHEN excluded.title IS NOT NULL AND excluded.title IS NOT videos.title
                    THEN excluded.title ELSE videos.title END,
                description=CASE
                    WHEN excluded.description IS NOT NULL AND excluded.description IS NOT videos.description
                    THEN excluded.description ELSE videos.description END,
                thumbnail=COALESCE(excluded.thumbnail, videos.thumbnail),
                published_at=CASE
                    WHEN excluded.published_at IS NOT NULL
                        AND (videos.published_at IS NULL OR excluded.published_at < videos.published_at)
                    THEN excluded.published_at ELSE videos.published_at END,
                deleted=0
        "#;

        let tx = self.conn.transaction().await?;
        for video in videos {
            tx.execute(
                sql,
                params![
                    site.id(),
                    video.video_id.as_str(),
                    video.title.as_str(),
                    video.description.as_str(),
                    video.published_at.map(|t| t.to_rfc3339()),
                    video.thumbnail.as_deref(),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Marks videos deleted, inserting tombstones for never-seen ids.
    ///
    /// The deletion timestamp is only written the first time the flag flips;
    /// repeat sightings of an already-deleted video leave it untouched.
    pub async fn mark_deleted(&self, site: Site, video_ids: &[String]) -> Result<()> {
        if video_ids.is_empty() {
            return Ok(());
        }

        let now = Utc::now().to_rfc3339();
        let sql = r#"
            INSERT INTO videos (site, video_id, title, published_at, deleted, deleted_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?4)
            ON CONFLICT(site, video_id) DO UPDATE SET
                deleted_at=CASE WHEN videos.deleted=0 THEN excluded.deleted_at ELSE videos.deleted_at END,
                deleted=1
        "#;

        let tx = self.conn.transaction().await?;
        for video_id in video_ids {
            tx.execute(
                sql,
                params![site.id(), video_id.as_str(), TOMBSTONE_TITLE, now.as_str()],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Resolves external ids to internal row ids in one batched pass.
    pub async fn video_ids_for(
        &self,
        site: Site,
        video_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let mut resolved = HashMap::with_capacity(video_ids.len());

        for chunk in video_ids.chunks(LOOKUP_CHUNK) {
            let placeholders = placeholder_list(chunk.len());
            let sql = format!(
                "SELECT id, video_id FROM videos WHERE site={} AND video_id IN ({placeholders})",
                site.id()
            );

            let mut values: Vec<Value> = Vec::with_capacity(chunk.len());
            for id in chunk {
                values.push(Value::from(id.clone()));
            }

            let mut rows = self.conn.query(&sql, values).await?;
            while let Some(row) = rows.next().await? {
                let id: i64 = row.get(0)?;
                let video_id: String = row.get(1)?;
                resolved.insert(video_id, id);
            }
        }

        Ok(resolved)
    }

    /// Every known video id of a site. Used to prime the run cache once.
    pub async fn all_video_ids(&self, site: Site) -> Result<HashMap<String, i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, video_id FROM videos WHERE site=?1",
                params![site.id()],
            )
            .await?;

        let mut ids = HashMap::new();
        while let Some(row) = rows.next().await? {
            let id: i64 = row.get(0)?;
            let video_id: String = row.get(1)?;
            ids.insert(video_id, id);
        }
        Ok(ids)
    }

    pub async fn all_channel_ids(&self, site: Site) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT channel_id FROM channels WHERE site=?1",
                params![site.id()],
            )
            .await?;

        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn all_tags(&self) -> Result<HashMap<String, i64>> {
        let mut rows = self.conn.query("SELECT id, tag FROM tags", params![]).await?;
        let mut tags = HashMap::new();
        while let Some(row) = rows.next().await? {
            let id: i64 = row.get(0)?;
            let tag: String = row.get(1)?;
            tags.insert(tag, id);
        }
        Ok(tags)
    }

    /// Prior membership snapshot of a playlist, as internal video ids.
    pub async fn playlist_member_ids(&self, playlist_db_id: i64) -> Result<Vec<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT video_id FROM playlist_videos WHERE playlist_id=?1",
                params![playlist_db_id],
            )
            .await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<i64>(0)?);
        }
        Ok(ids)
    }

    /// Rewrites playlist membership to exactly `member_ids`: rows for videos
    /// no longer present are removed, the rest inserted idempotently.
    pub async fn replace_playlist_videos(
        &self,
        playlist_db_id: i64,
        member_ids: &[i64],
    ) -> Result<()> {
        let tx = self.conn.transaction().await?;

        if member_ids.is_empty() {
            tx.execute(
                "DELETE FROM playlist_videos WHERE playlist_id=?1",
                params![playlist_db_id],
            )
            .await?;
        } else {
            let placeholders = placeholder_list(member_ids.len());
            let sql = format!(
                "DELETE FROM playlist_videos WHERE playlist_id={playlist_db_id} AND video_id NOT IN ({placeholders})"
            );
            let values: Vec<Value> = member_ids.iter().map(|id| Value::from(*id)).collect();
            tx.execute(&sql, values).await?;

            for id in member_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO playlist_videos (playlist_id, video_id) VALUES (?1, ?2)",
                    params![playlist_db_id, *id],
                )
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flips the download flag for every member of an archive playlist.
    /// Idempotent; already-flagged videos are left alone.
    pub async fn mark_playlist_for_download(&self, playlist_db_id: i64) -> Result<u64> {
        let changed = self
            .conn
            .execute(
                r#"
                UPDATE videos SET download=1
                WHERE download=0 AND id IN (
                    SELECT video_id FROM playlist_videos WHERE playlist_id=?1
                )
                "#,
                params![playlist_db_id],
            )
            .await?;
        Ok(changed)
    }

    /// Inserts unseen tags (already lower-cased by the caller) and returns
    /// ids for all requested tags.
    pub async fn add_tags(&self, tags: &[String]) -> Result<HashMap<String, i64>> {
        if tags.is_empty() {
            return Ok(HashMap::new());
        }

        let tx = self.conn.transaction().await?;
        for tag in tags {
            tx.execute(
                "INSERT OR IGNORE INTO tags (tag) VALUES (?1)",
                params![tag.as_str()],
            )
            .await?;
        }
        tx.commit().await?;

        let placeholders = placeholder_list(tags.len());
        let sql = format!("SELECT id, tag FROM tags WHERE tag IN ({placeholders})");
        let values: Vec<Value> = tags.iter().map(|tag| Value::from(tag.clone())).collect();

        let mut rows = self.conn.query(&sql, values).await?;
        let mut resolved = HashMap::with_capacity(tags.len());
        while let Some(row) = rows.next().await? {
            let id: i64 = row.get(0)?;
            let tag: String = row.get(1)?;
            resolved.insert(tag, id);
        }
        Ok(resolved)
    }

    /// Conflict-ignored tag/video links: linking twice yields one row.
    pub async fn link_video_tags(&self, links: &[(i64, i64)]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().await?;
        for (tag_id, video_id) in links {
            tx.execute(
                "INSERT OR IGNORE INTO video_tags (tag_id, video_id) VALUES (?1, ?2)",
                params![*tag_id, *video_id],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Upserts channels with coalesce semantics: a null incoming name or
    /// thumbnail never erases a previously known value.
    pub async fn upsert_channels(&self, site: Site, channels: &[ChannelEntry]) -> Result<()> {
        if channels.is_empty() {
            return Ok(());
        }

        let sql = r#"
            INSERT INTO channels (site, channel_id, name, thumbnail)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(site, channel_id) DO UPDATE SET
                name=COALESCE(excluded.name, channels.name),
                thumbnail=COALESCE(excluded.thumbnail, channels.thumbnail)
        "#;

        let tx = self.conn.transaction().await?;
        for channel in channels {
            tx.execute(
                sql,
                params![
                    site.id(),
                    channel.channel_id.as_str(),
                    channel.name.as_deref(),
                    channel.thumbnail.as_deref(),
                ],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn channel_ids_for(
        &self,
        site: Site,
        channel_ids: &[String],
    ) -> Result<HashMap<String, i64>> {
        let mut resolved = HashMap::with_capacity(channel_ids.len());

        for chunk in channel_ids.chunks(LOOKUP_CHUNK) {
            let placeholders = placeholder_list(chunk.len());
            let sql = format!(
                "SELECT id, channel_id FROM channels WHERE site={} AND channel_id IN ({placeholders})",
                site.id()
            );
            let values: Vec<Value> = chunk.iter().map(|id| Value::from(id.clone())).collect();

            let mut rows = self.conn.query(&sql, values).await?;
            while let Some(row) = rows.next().await? {
                let id: i64 = row.get(0)?;
                let channel_id: String = row.get(1)?;
                resolved.insert(channel_id, id);
            }
        }

        Ok(resolved)
    }

    pub async fn link_channel_videos(&self, links: &[(i64, i64)]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction().await?;
        for (channel_id, video_id) in links {
            tx.execute(
                "INSERT OR IGNORE INTO channel_videos (channel_id, video_id) VALUES (?1, ?2)",
                params![*channel_id, *video_id],
            )
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Videos eligible for archival this run, restricted to the playlists
    /// touched by the reconciler, deduplicated and ordered by internal id.
    ///
    /// Already-downloaded videos are skipped unless force_redownload is set;
    /// the blocked sentinel counts as downloaded on purpose.
    pub async fn videos_to_download(
        &self,
        playlist_db_ids: &[i64],
    ) -> Result<Vec<DownloadCandidate>> {
        if playlist_db_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = placeholder_list(playlist_db_ids.len());
        let sql = format!(
            r#"
            SELECT DISTINCT v.id, v.site, v.video_id, v.downloaded_filename,
                   v.downloaded_format, v.download_format, v.force_redownload
            FROM videos v
            INNER JOIN playlist_videos pv ON v.id = pv.video_id
            WHERE pv.playlist_id IN ({placeholders})
                AND ((v.download=1 AND v.downloaded_format IS NULL) OR v.force_redownload=1)
                AND v.deleted=0
            ORDER BY v.id
            "#
        );
        let values: Vec<Value> = playlist_db_ids.iter().map(|id| Value::from(*id)).collect();

        let mut rows = self.conn.query(&sql, values).await?;
        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            candidates.push(row_to_candidate(&row)?);
        }
        Ok(candidates)
    }

    /// Records a finished download: coalesce the filename/format and clear
    /// the force flag.
    pub async fn update_downloaded(
        &self,
        video_db_id: i64,
        filename: Option<&str>,
        format: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                r#"
                UPDATE videos SET
                    downloaded_filename=COALESCE(?1, downloaded_filename),
                    downloaded_format=COALESCE(?2, downloaded_format),
                    force_redownload=0
                WHERE id=?3
                "#,
                params![filename, format, video_db_id],
            )
            .await?;
        Ok(())
    }

    /// Field-level coalesce upsert of the artifact record.
    pub async fn update_extra_files(&self, extra: &ExtraFiles) -> Result<()> {
        let subtitles = if extra.subtitles.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&extra.subtitles).context("serializing subtitles")?)
        };
        let other_files = if extra.other_files.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&extra.other_files).context("serializing other files")?)
        };

        self.conn
            .execute(
                r#"
                INSERT INTO extra_video_files (video_id, thumbnail, info_json, audio_file, subtitles, other_files)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(video_id) DO UPDATE SET
                    thumbnail=COALESCE(excluded.thumbnail, extra_video_files.thumbnail),
                    info_json=COALESCE(excluded.info_json, extra_video_files.info_json),
                    audio_file=COALESCE(excluded.audio_file, extra_video_files.audio_file),
                    subtitles=COALESCE(excluded.subtitles, extra_video_files.subtitles),
                    other_files=COALESCE(excluded.other_files, extra_video_files.other_files)
                "#,
                params![
                    extra.video_id,
                    extra.thumbnail.as_deref(),
                    extra.info_json.as_deref(),
                    extra.audio_file.as_deref(),
                    subtitles,
                    other_files,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_extra_files(&self, video_db_id: i64) -> Result<Option<ExtraFiles>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_id, thumbnail, info_json, audio_file, subtitles, other_files
                FROM extra_video_files WHERE video_id=?1
                "#,
                params![video_db_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let subtitles: Option<String> = row.get(4)?;
        let other_files: Option<String> = row.get(5)?;
        Ok(Some(ExtraFiles {
            video_id: row.get(0)?,
            thumbnail: row.get(1)?,
            info_json: row.get(2)?,
            audio_file: row.get(3)?,
            subtitles: match subtitles {
                Some(raw) => serde_json::from_str(&raw).context("parsing stored subtitles")?,
                None => Vec::new(),
            },
            other_files: match other_files {
                Some(raw) => serde_json::from_str(&raw).context("parsing stored other files")?,
                None => HashMap::new(),
            },
        }))
    }

    /// Finds live videos that still lack a thumbnail artifact and are not
    /// waiting on a full media download.
    pub async fn thumbnails_missing(&self, site: Site) -> Result<Vec<ThumbnailCandidate>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT v.id, v.video_id, v.thumbnail
                FROM videos v
                LEFT JOIN extra_video_files evf ON v.id = evf.video_id
                WHERE v.site=?1 AND v.deleted=0 AND evf.thumbnail IS NULL
                    AND (v.download=0 OR (v.force_redownload=0 AND v.downloaded_format IS NOT NULL))
                ORDER BY v.id
                "#,
                params![site.id()],
            )
            .await?;

        let mut candidates = Vec::new();
        while let Some(row) = rows.next().await? {
            candidates.push(ThumbnailCandidate {
                id: row.get(0)?,
                video_id: row.get(1)?,
                thumbnail_url: row.get(2)?,
            });
        }
        Ok(candidates)
    }

    /// Subset of `video_ids` whose deleted flag is still unset. Must be
    /// queried before [`CatalogStore::mark_deleted`] runs for the same ids.
    pub async fn newly_deleted(
        &self,
        site: Site,
        video_ids: &[String],
    ) -> Result<Vec<VideoTitle>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = placeholder_list(video_ids.len());
        let sql = format!(
            "SELECT video_id, title FROM videos WHERE deleted=0 AND site={} AND video_id IN ({placeholders})",
            site.id()
        );
        let values: Vec<Value> = video_ids.iter().map(|id| Value::from(id.clone())).collect();

        let mut rows = self.conn.query(&sql, values).await?;
        let mut titles = Vec::new();
        while let Some(row) = rows.next().await? {
            titles.push(VideoTitle {
                video_id: row.get(0)?,
                title: row.get(1)?,
            });
        }
        Ok(titles)
    }

    /// Enriches deleted ids with the last-known title and channel info.
    pub async fn deleted_info(
        &self,
        site: Site,
        video_ids: &[String],
    ) -> Result<Vec<DeletedVideoInfo>> {
        if video_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = placeholder_list(video_ids.len());
        let sql = format!(
            r#"
            SELECT v.video_id, v.title, c.name, c.channel_id
            FROM videos v
            LEFT JOIN channel_videos cv ON cv.video_id = v.id
            LEFT JOIN channels c ON cv.channel_id = c.id
            WHERE v.site={} AND v.video_id IN ({placeholders})
            "#,
            site.id()
        );
        let values: Vec<Value> = video_ids.iter().map(|id| Value::from(id.clone())).collect();

        let mut rows = self.conn.query(&sql, values).await?;
        let mut infos = Vec::new();
        while let Some(row) = rows.next().await? {
            infos.push(DeletedVideoInfo {
                video_id: row.get(0)?,
                title: row.get(1)?,
                channel_name: row.get(2)?,
                channel_id: row.get(3)?,
            });
        }
        Ok(infos)
    }
}

fn placeholder_list(count: usize) -> String {
    let mut placeholders = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            placeholders.push(',');
        }
        placeholders.push('?');
    }
    placeholders
}

fn row_to_candidate(row: &Row) -> Result<DownloadCandidate> {
    Ok(DownloadCandidate {
        id: row.get(0)?,
        site: row.get(1)?,
        video_id: row.get(2)?,
        downloaded_filename: row.get(3)?,
        downloaded_format: row.get(4)?,
        download_format: row.get(5)?,
        force_redownload: row.get::<i64>(6).map(|value| value != 0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(id: &str) -> VideoEntry {
        VideoEntry {
            video_id: id.to_owned(),
            title: format!("Video {id}"),
            description: "desc".into(),
            published_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            thumbnail: Some("https://img/thumb.jpg".into()),
            tags: vec!["Tech".into()],
            channel_id: Some("chan1".into()),
        }
    }

    async fn create_store() -> Result<(tempfile::TempDir, CatalogStore)> {
        let dir = tempdir()?;
        let store = CatalogStore::open(&dir.path().join("catalog/test.db")).await?;
        Ok((dir, store))
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let (dir, _store) = create_store().await?;
        assert!(dir.path().join("catalog/test.db").exists());

        let db = Builder::new_local(dir.path().join("catalog/test.db"))
            .build()
            .await?;
        let conn = db.connect()?;
        for table in [
            "videos",
            "channels",
            "tags",
            "video_tags",
            "playlists",
            "playlist_videos",
            "channel_videos",
            "extra_video_files",
        ] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            let exists: Option<String> = rows
                .next()
                .await?
                .map(|row| row.get::<String>(0))
                .transpose()?;
            assert_eq!(exists.as_deref(), Some(table), "missing table {table}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn add_and_get_playlist_roundtrip() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let added = store.add_playlist("PL1", "My list", Site::YouTube).await?;
        assert!(added.id > 0);

        let fetched = store
            .get_playlist("PL1", Site::YouTube)
            .await?
            .expect("playlist exists");
        assert_eq!(fetched, added);
        assert!(store.get_playlist("PL-nope", Site::YouTube).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn upsert_videos_inserts_then_merges() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;

        let ids = store
            .video_ids_for(Site::YouTube, &["a".to_string()])
            .await?;
        assert_eq!(ids.len(), 1);

        // Second pass with a changed title but no thumbnail: title updates,
        // thumbnail survives the null.
        let mut updated = entry("a");
        updated.title = "Renamed".into();
        updated.thumbnail = None;
        store.upsert_videos(Site::YouTube, &[updated]).await?;

        let mut rows = store
            .conn
            .query(
                "SELECT title, thumbnail FROM videos WHERE video_id='a'",
                params![],
            )
            .await?;
        let row = rows.next().await?.expect("row exists");
        assert_eq!(row.get::<String>(0)?, "Renamed");
        assert_eq!(
            row.get::<Option<String>>(1)?.as_deref(),
            Some("https://img/thumb.jpg")
        );
        Ok(())
    }

    #[tokio::test]
    async fn upsert_is_idempotent() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;

        let mut rows = store
            .conn
            .query("SELECT COUNT(*) FROM videos", params![])
            .await?;
        let count: i64 = rows.next().await?.expect("count row").get(0)?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn mark_deleted_inserts_tombstone_and_preserves_timestamp() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .mark_deleted(Site::YouTube, &["gone".to_string()])
            .await?;

        let first = fetch_deleted(&store, "gone").await?;
        assert_eq!(first.0, 1);
        let first_at = first.1.expect("deleted_at set");

        // Marking again must not move the timestamp.
        store
            .mark_deleted(Site::YouTube, &["gone".to_string()])
            .await?;
        let second = fetch_deleted(&store, "gone").await?;
        assert_eq!(second.1.as_deref(), Some(first_at.as_str()));

        let mut rows = store
            .conn
            .query("SELECT title FROM videos WHERE video_id='gone'", params![])
            .await?;
        let title: String = rows.next().await?.expect("row").get(0)?;
        assert_eq!(title, TOMBSTONE_TITLE);
        Ok(())
    }

    async fn fetch_deleted(store: &CatalogStore, video_id: &str) -> Result<(i64, Option<String>)> {
        let mut rows = store
            .conn
            .query(
                "SELECT deleted, deleted_at FROM videos WHERE video_id=?1",
                params![video_id],
            )
            .await?;
        let row = rows.next().await?.expect("row exists");
        Ok((row.get(0)?, row.get(1)?))
    }

    #[tokio::test]
    async fn reappearing_video_clears_deleted_flag() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .mark_deleted(Site::YouTube, &["back".to_string()])
            .await?;
        store.upsert_videos(Site::YouTube, &[entry("back")]).await?;

        let (deleted, _) = fetch_deleted(&store, "back").await?;
        assert_eq!(deleted, 0);
        Ok(())
    }

    #[tokio::test]
    async fn replace_playlist_videos_rewrites_membership() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let playlist = store.add_playlist("PL1", "l", Site::YouTube).await?;
        store
            .upsert_videos(Site::YouTube, &[entry("a"), entry("b"), entry("c")])
            .await?;
        let ids = store
            .video_ids_for(
                Site::YouTube,
                &["a".to_string(), "b".to_string(), "c".to_string()],
            )
            .await?;

        let initial = vec![ids["a"], ids["b"]];
        store.replace_playlist_videos(playlist.id, &initial).await?;
        // Repeat insert must not duplicate rows.
        store.replace_playlist_videos(playlist.id, &initial).await?;
        let mut members = store.playlist_member_ids(playlist.id).await?;
        members.sort();
        let mut expected = initial.clone();
        expected.sort();
        assert_eq!(members, expected);

        // b drops out, c joins.
        store
            .replace_playlist_videos(playlist.id, &[ids["a"], ids["c"]])
            .await?;
        let mut members = store.playlist_member_ids(playlist.id).await?;
        members.sort();
        let mut expected = vec![ids["a"], ids["c"]];
        expected.sort();
        assert_eq!(members, expected);
        Ok(())
    }

    #[tokio::test]
    async fn mark_playlist_for_download_is_idempotent() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let playlist = store.add_playlist("PL1", "l", Site::YouTube).await?;
        store
            .upsert_videos(Site::YouTube, &[entry("a"), entry("b")])
            .await?;
        let ids = store
            .video_ids_for(Site::YouTube, &["a".to_string(), "b".to_string()])
            .await?;
        store
            .replace_playlist_videos(playlist.id, &[ids["a"], ids["b"]])
            .await?;

        assert_eq!(store.mark_playlist_for_download(playlist.id).await?, 2);
        assert_eq!(store.mark_playlist_for_download(playlist.id).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn tag_links_are_conflict_safe() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;
        let video_ids = store
            .video_ids_for(Site::YouTube, &["a".to_string()])
            .await?;

        let tags = store
            .add_tags(&["tech".to_string(), "music".to_string()])
            .await?;
        assert_eq!(tags.len(), 2);
        // Adding again returns the same ids.
        let again = store.add_tags(&["tech".to_string()]).await?;
        assert_eq!(again["tech"], tags["tech"]);

        let link = (tags["tech"], video_ids["a"]);
        store.link_video_tags(&[link]).await?;
        store.link_video_tags(&[link]).await?;

        let mut rows = store
            .conn
            .query("SELECT COUNT(*) FROM video_tags", params![])
            .await?;
        let count: i64 = rows.next().await?.expect("count").get(0)?;
        assert_eq!(count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn channel_upsert_coalesces_nulls() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .upsert_channels(
                Site::YouTube,
                &[ChannelEntry {
                    channel_id: "chan1".into(),
                    name: Some("Channel".into()),
                    thumbnail: Some("pic.jpg".into()),
                }],
            )
            .await?;
        // Null name must not erase the stored one.
        store
            .upsert_channels(
                Site::YouTube,
                &[ChannelEntry {
                    channel_id: "chan1".into(),
                    name: None,
                    thumbnail: None,
                }],
            )
            .await?;

        let mut rows = store
            .conn
            .query(
                "SELECT name, thumbnail FROM channels WHERE channel_id='chan1'",
                params![],
            )
            .await?;
        let row = rows.next().await?.expect("row");
        assert_eq!(row.get::<Option<String>>(0)?.as_deref(), Some("Channel"));
        assert_eq!(row.get::<Option<String>>(1)?.as_deref(), Some("pic.jpg"));
        Ok(())
    }

    #[tokio::test]
    async fn download_selection_respects_flags_and_ordering() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let playlist = store.add_playlist("PL1", "l", Site::YouTube).await?;
        store
            .upsert_videos(Site::YouTube, &[entry("a"), entry("b"), entry("c"), entry("d")])
            .await?;
        let ids = store
            .video_ids_for(
                Site::YouTube,
                &[
                    "a".to_string(),
                    "b".to_string(),
                    "c".to_string(),
                    "d".to_string(),
                ],
            )
            .await?;
        let members: Vec<i64> = vec![ids["a"], ids["b"], ids["c"], ids["d"]];
        store.replace_playlist_videos(playlist.id, &members).await?;
        store.mark_playlist_for_download(playlist.id).await?;

        // b already downloaded, c downloaded but forced, d deleted.
        store
            .update_downloaded(ids["b"], Some("b.mp4"), Some("720p"))
            .await?;
        store
            .update_downloaded(ids["c"], Some("c.mp4"), Some("720p"))
            .await?;
        store
            .conn
            .execute(
                "UPDATE videos SET force_redownload=1 WHERE id=?1",
                params![ids["c"]],
            )
            .await?;
        store
            .mark_deleted(Site::YouTube, &["d".to_string()])
            .await?;

        let candidates = store.videos_to_download(&[playlist.id]).await?;
        let selected: Vec<&str> = candidates
            .iter()
            .map(|candidate| candidate.video_id.as_str())
            .collect();
        assert_eq!(selected, vec!["a", "c"]);
        assert!(candidates[1].force_redownload);
        Ok(())
    }

    #[tokio::test]
    async fn blocked_sentinel_prevents_reselection() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let playlist = store.add_playlist("PL1", "l", Site::YouTube).await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;
        let ids = store
            .video_ids_for(Site::YouTube, &["a".to_string()])
            .await?;
        store
            .replace_playlist_videos(playlist.id, &[ids["a"]])
            .await?;
        store.mark_playlist_for_download(playlist.id).await?;

        store
            .update_downloaded(ids["a"], None, Some(BLOCKED_FORMAT))
            .await?;
        assert!(store.videos_to_download(&[playlist.id]).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn extra_files_coalesce_per_field() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;
        let ids = store
            .video_ids_for(Site::YouTube, &["a".to_string()])
            .await?;

        store
            .update_extra_files(&ExtraFiles {
                video_id: ids["a"],
                thumbnail: Some("thumb.jpg".into()),
                info_json: Some("info.json".into()),
                ..ExtraFiles::default()
            })
            .await?;
        // Update only the audio file; other fields must survive.
        store
            .update_extra_files(&ExtraFiles {
                video_id: ids["a"],
                audio_file: Some("audio.m4a".into()),
                subtitles: vec!["en.ass".into()],
                ..ExtraFiles::default()
            })
            .await?;

        let extra = store
            .get_extra_files(ids["a"])
            .await?
            .expect("extra files exist");
        assert_eq!(extra.thumbnail.as_deref(), Some("thumb.jpg"));
        assert_eq!(extra.info_json.as_deref(), Some("info.json"));
        assert_eq!(extra.audio_file.as_deref(), Some("audio.m4a"));
        assert_eq!(extra.subtitles, vec!["en.ass"]);
        Ok(())
    }

    #[tokio::test]
    async fn thumbnails_missing_skips_pending_downloads() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .upsert_videos(Site::YouTube, &[entry("plain"), entry("queued"), entry("done")])
            .await?;
        let ids = store
            .video_ids_for(
                Site::YouTube,
                &[
                    "plain".to_string(),
                    "queued".to_string(),
                    "done".to_string(),
                ],
            )
            .await?;

        // queued: waiting on a media download, thumbnail comes with it.
        store
            .conn
            .execute(
                "UPDATE videos SET download=1 WHERE id=?1",
                params![ids["queued"]],
            )
            .await?;
        // done: downloaded, but thumbnail artifact already recorded.
        store
            .update_downloaded(ids["done"], Some("f.mp4"), Some("720p"))
            .await?;
        store
            .update_extra_files(&ExtraFiles {
                video_id: ids["done"],
                thumbnail: Some("done.jpg".into()),
                ..ExtraFiles::default()
            })
            .await?;

        let missing = store.thumbnails_missing(Site::YouTube).await?;
        let wanted: Vec<&str> = missing
            .iter()
            .map(|candidate| candidate.video_id.as_str())
            .collect();
        assert_eq!(wanted, vec!["plain"]);
        assert_eq!(
            missing[0].thumbnail_url.as_deref(),
            Some("https://img/thumb.jpg")
        );
        Ok(())
    }

    #[tokio::test]
    async fn newly_deleted_only_reports_first_time_deletions() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .upsert_videos(Site::YouTube, &[entry("live"), entry("old")])
            .await?;
        store
            .mark_deleted(Site::YouTube, &["old".to_string()])
            .await?;

        let ids = vec!["live".to_string(), "old".to_string()];
        let newly = store.newly_deleted(Site::YouTube, &ids).await?;
        assert_eq!(newly.len(), 1);
        assert_eq!(newly[0].video_id, "live");
        Ok(())
    }

    #[tokio::test]
    async fn deleted_info_joins_channel_data() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.upsert_videos(Site::YouTube, &[entry("a")]).await?;
        store
            .upsert_channels(
                Site::YouTube,
                &[ChannelEntry {
                    channel_id: "chan1".into(),
                    name: Some("Creator".into()),
                    thumbnail: None,
                }],
            )
            .await?;
        let video_ids = store
            .video_ids_for(Site::YouTube, &["a".to_string()])
            .await?;
        let channel_ids = store
            .channel_ids_for(Site::YouTube, &["chan1".to_string()])
            .await?;
        store
            .link_channel_videos(&[(channel_ids["chan1"], video_ids["a"])])
            .await?;

        let info = store
            .deleted_info(Site::YouTube, &["a".to_string()])
            .await?;
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].title.as_deref(), Some("Video a"));
        assert_eq!(info[0].channel_name.as_deref(), Some("Creator"));
        assert_eq!(info[0].channel_id.as_deref(), Some("chan1"));
        Ok(())
    }

    #[tokio::test]
    async fn prime_helpers_return_full_maps() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store
            .upsert_videos(Site::YouTube, &[entry("a"), entry("b")])
            .await?;
        store.add_tags(&["tech".to_string()]).await?;
        store
            .upsert_channels(
                Site::YouTube,
                &[ChannelEntry {
                    channel_id: "chan1".into(),
                    name: None,
                    thumbnail: None,
                }],
            )
            .await?;

        assert_eq!(store.all_video_ids(Site::YouTube).await?.len(), 2);
        assert_eq!(store.all_tags().await?.len(), 1);
        assert!(store.all_channel_ids(Site::YouTube).await?.contains("chan1"));
        Ok(())
    }
}
