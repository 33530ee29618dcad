#![forbid(unsafe_code)]

//! Library shared by the playlist-watcher binaries.
//!
//! The crate reconciles remote playlist snapshots against a local SQLite
//! catalog, archives flagged videos through yt-dlp, and notifies external
//! scripts about changes.

pub mod api;
pub mod cache;
pub mod config;
pub mod download;
pub mod reconciler;
pub mod scripts;
pub mod security;
pub mod site;
pub mod storage;
pub mod store;
pub mod thumbnails;
