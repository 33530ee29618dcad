#![forbid(unsafe_code)]

//! Run configuration: a TOML file describing playlists, post-run scripts and
//! download behaviour, plus `.env`-style overrides for the catalog path and
//! the platform API key.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use crate::scripts::ScriptField;
use crate::site::Site;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_DB_FILE: &str = "catalog.db";
pub const DEFAULT_DATA_DIR: &str = "data";

/// Inclusive sleep bounds in seconds used to rate-limit downloads.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct SleepBounds {
    pub min: u64,
    pub max: u64,
}

impl Default for SleepBounds {
    fn default() -> Self {
        Self { min: 3, max: 6 }
    }
}

/// One external post-processing script attached to a playlist.
///
/// When `required_fields` is absent the script receives every available
/// payload field.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub required_fields: Option<Vec<ScriptField>>,
}

/// A tracked remote playlist.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaylistConfig {
    pub playlist_id: String,
    pub site: Site,
    #[serde(default)]
    pub name: Option<String>,
    /// Flip the download flag on every member video after reconciliation.
    #[serde(default)]
    pub archive: bool,
    /// Tags applied to every current video of this playlist.
    #[serde(default)]
    pub default_tags: Vec<String>,
    /// Scripts run after this playlist has been reconciled.
    #[serde(default)]
    pub after: Vec<ScriptConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub playlists: Vec<PlaylistConfig>,
    #[serde(default)]
    pub download_sleep: SleepBounds,
    /// Downloads per run. Negative means unbounded.
    #[serde(default = "default_max_downloads")]
    pub max_downloads_per_run: i64,
    /// Remove superseded local/remote artifacts after a re-download.
    #[serde(default)]
    pub delete_old_files: bool,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Scripts appended to every playlist's `after` list.
    #[serde(default)]
    pub after: Vec<ScriptConfig>,
}

fn default_max_downloads() -> i64 {
    -1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.download_sleep.min > self.download_sleep.max {
            bail!(
                "download_sleep.min ({}) exceeds download_sleep.max ({})",
                self.download_sleep.min,
                self.download_sleep.max
            );
        }
        for playlist in &self.playlists {
            if playlist.playlist_id.trim().is_empty() {
                bail!("playlist with empty playlist_id");
            }
        }
        Ok(())
    }

    /// Scripts that run for the given playlist: its own plus the global ones.
    pub fn scripts_for(&self, playlist: &PlaylistConfig) -> Vec<ScriptConfig> {
        let mut scripts = playlist.after.clone();
        scripts.extend(self.after.iter().cloned());
        scripts
    }
}

/// Values resolved from CLI overrides, the process environment, and the
/// `.env` file, in that order of precedence.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub db_path: PathBuf,
    pub api_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub db_path: Option<PathBuf>,
    pub api_key: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let db_path = overrides
        .db_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("CATALOG_DB", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
    let api_key = overrides
        .api_key
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            if trimmed.is_empty() { None } else { Some(trimmed) }
        })
        .or_else(|| lookup_value("YT_API_KEY", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("YT_API_KEY not set"))?;

    Ok(RuntimeSettings {
        db_path: PathBuf::from(db_path),
        api_key,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn parse_config(contents: &str) -> Config {
        let file = make_file(contents);
        Config::load(file.path()).unwrap()
    }

    const MINIMAL: &str = r#"
        [[playlists]]
        playlist_id = "PL123"
        site = "youtube"
    "#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL);
        assert_eq!(config.playlists.len(), 1);
        assert_eq!(config.download_sleep, SleepBounds { min: 3, max: 6 });
        assert_eq!(config.max_downloads_per_run, -1);
        assert!(!config.delete_old_files);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert!(!config.playlists[0].archive);
        assert!(config.playlists[0].after.is_empty());
    }

    #[test]
    fn full_playlist_entry_parses() {
        let config = parse_config(
            r#"
            max_downloads_per_run = 5
            delete_old_files = true

            [download_sleep]
            min = 1
            max = 2

            [[after]]
            name = "global-notify"
            script = "notify-send changed"

            [[playlists]]
            playlist_id = "PL456"
            site = "youtube"
            name = "Music"
            archive = true
            default_tags = ["music", "Archive"]

            [[playlists.after]]
            name = "webhook"
            script = "./webhook.sh"
            required_fields = ["new", "url_format"]
            "#,
        );
        let playlist = &config.playlists[0];
        assert!(playlist.archive);
        assert_eq!(playlist.default_tags, vec!["music", "Archive"]);
        let scripts = config.scripts_for(playlist);
        assert_eq!(scripts.len(), 2);
        assert_eq!(scripts[0].name, "webhook");
        assert_eq!(
            scripts[0].required_fields.as_deref(),
            Some(&[ScriptField::New, ScriptField::UrlFormat][..])
        );
        assert_eq!(scripts[1].name, "global-notify");
        assert!(scripts[1].required_fields.is_none());
    }

    #[test]
    fn invalid_sleep_bounds_rejected() {
        let file = make_file(
            r#"
            [download_sleep]
            min = 9
            max = 2

            [[playlists]]
            playlist_id = "PL1"
            site = "youtube"
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn empty_playlist_id_rejected() {
        let file = make_file(
            r#"
            [[playlists]]
            playlist_id = "  "
            site = "youtube"
            "#,
        );
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn runtime_settings_prefer_overrides_over_file() {
        let env = make_file("CATALOG_DB=\"/from-file.db\"\nYT_API_KEY=\"file-key\"\n");
        let vars = read_env_file(env.path()).unwrap();
        let settings = build_runtime_settings(
            &vars,
            |_| None,
            RuntimeOverrides {
                db_path: Some(PathBuf::from("/override.db")),
                api_key: None,
                env_path: None,
            },
        )
        .unwrap();
        assert_eq!(settings.db_path, PathBuf::from("/override.db"));
        assert_eq!(settings.api_key, "file-key");
    }

    #[test]
    fn runtime_settings_prefer_env_over_file() {
        let env = make_file("YT_API_KEY=\"file-key\"\n");
        let vars = read_env_file(env.path()).unwrap();
        let settings = build_runtime_settings(
            &vars,
            |key| (key == "YT_API_KEY").then(|| "env-key".to_string()),
            RuntimeOverrides::default(),
        )
        .unwrap();
        assert_eq!(settings.api_key, "env-key");
        assert_eq!(settings.db_path, PathBuf::from(DEFAULT_DB_FILE));
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let err =
            build_runtime_settings(&HashMap::new(), |_| None, RuntimeOverrides::default())
                .unwrap_err();
        assert!(err.to_string().contains("YT_API_KEY"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let env = make_file(
            r#"
            export CATALOG_DB="/data/catalog.db"
            YT_API_KEY='secret'
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(env.path()).unwrap();
        assert_eq!(vars.get("CATALOG_DB").unwrap(), "/data/catalog.db");
        assert_eq!(vars.get("YT_API_KEY").unwrap(), "secret");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
