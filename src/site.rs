#![forbid(unsafe_code)]

//! Supported video platforms. Only YouTube exists today but every identifier
//! in the catalog is scoped by site so more can be added without migrations.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    YouTube,
}

impl Site {
    /// Every site the watcher knows about, in catalog id order.
    pub const ALL: &[Site] = &[Site::YouTube];

    /// Stable integer id stored in the `site` columns.
    pub fn id(self) -> i64 {
        match self {
            Site::YouTube => 0,
        }
    }

    pub fn from_id(id: i64) -> Option<Site> {
        Site::ALL.iter().copied().find(|site| site.id() == id)
    }

    /// Printf-style watch URL handed to notification scripts.
    pub fn url_format(self) -> &'static str {
        match self {
            Site::YouTube => "https://www.youtube.com/watch?v=%s",
        }
    }

    /// Full watch URL for one video id.
    pub fn video_url(self, video_id: &str) -> String {
        match self {
            Site::YouTube => format!("https://www.youtube.com/watch?v={video_id}"),
        }
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Site::YouTube => write!(f, "youtube"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_url_embeds_id() {
        assert_eq!(
            Site::YouTube.video_url("abc123"),
            "https://www.youtube.com/watch?v=abc123"
        );
    }

    #[test]
    fn url_format_matches_video_url() {
        let formatted = Site::YouTube.url_format().replace("%s", "abc123");
        assert_eq!(formatted, Site::YouTube.video_url("abc123"));
    }
}
