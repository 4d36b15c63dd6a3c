use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::dates;
use crate::download::{DEFAULT_MAX_CONCURRENT_DOWNLOADS, DownloaderConfig, RENEW_DEBOUNCE};
use crate::media::MediaKind;

const DEFAULT_OUTPUT_DIR: &str = "./chat_export";
const DEFAULT_SIZE_LIMIT_MB: u64 = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid {key}: {message}")]
    InvalidDate { key: &'static str, message: String },
    #[error("from date {from} is after to date {to}")]
    EmptyRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Process-wide settings from `CHAT_EXPORT_*` environment variables.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub output_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub size_limit_mb: u64,
    pub renew_debounce_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let output_dir = lookup("CHAT_EXPORT_OUTPUT_DIR")
            .filter(|dir| !dir.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
        let max_concurrent_downloads = parse_var(
            &lookup,
            "CHAT_EXPORT_MAX_CONCURRENT_DOWNLOADS",
            DEFAULT_MAX_CONCURRENT_DOWNLOADS,
        )?;
        if max_concurrent_downloads == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_EXPORT_MAX_CONCURRENT_DOWNLOADS",
                value: "0".to_string(),
            });
        }
        let size_limit_mb = parse_var(&lookup, "CHAT_EXPORT_SIZE_LIMIT_MB", DEFAULT_SIZE_LIMIT_MB)?;
        let renew_debounce_ms = parse_var(
            &lookup,
            "CHAT_EXPORT_RENEW_DEBOUNCE_MS",
            RENEW_DEBOUNCE.as_millis() as u64,
        )?;

        Ok(Self {
            output_dir,
            max_concurrent_downloads,
            size_limit_mb,
            renew_debounce_ms,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

/// Per-kind download switches. Audio and inline kinds have no switch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaToggles {
    pub photos: bool,
    pub videos: bool,
    pub voice: bool,
    pub video_notes: bool,
    pub stickers: bool,
    pub gifs: bool,
    pub files: bool,
}

impl Default for MediaToggles {
    fn default() -> Self {
        Self {
            photos: true,
            videos: true,
            voice: true,
            video_notes: true,
            stickers: true,
            gifs: true,
            files: true,
        }
    }
}

/// What to export and where.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportConfig {
    pub chat_ids: Vec<String>,
    pub output_dir: PathBuf,
    pub media: MediaToggles,
    pub size_limit_mb: u64,
    pub from_date: DateTime<Utc>,
    pub to_date: DateTime<Utc>,
    pub max_concurrent_downloads: usize,
    pub renew_debounce_ms: u64,
}

impl ExportConfig {
    pub fn new(config: &Config) -> Self {
        Self {
            chat_ids: vec!["me".to_string()],
            output_dir: config.output_dir.clone(),
            media: MediaToggles::default(),
            size_limit_mb: config.size_limit_mb,
            from_date: dates::epoch(),
            to_date: Utc::now(),
            max_concurrent_downloads: config.max_concurrent_downloads,
            renew_debounce_ms: config.renew_debounce_ms,
        }
    }

    /// Sets the export window from user-supplied bounds.
    pub fn with_dates(
        mut self,
        from: Option<&str>,
        to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        if let Some(from) = from {
            self.from_date = dates::parse_date_bound(from, now).map_err(|message| {
                ConfigError::InvalidDate {
                    key: "from date",
                    message,
                }
            })?;
        }
        if let Some(to) = to {
            self.to_date = dates::parse_date_bound(to, now).map_err(|message| {
                ConfigError::InvalidDate {
                    key: "to date",
                    message,
                }
            })?;
        }
        if self.from_date > self.to_date {
            return Err(ConfigError::EmptyRange {
                from: self.from_date,
                to: self.to_date,
            });
        }
        Ok(self)
    }

    pub fn excluded_media(&self) -> BTreeSet<MediaKind> {
        let toggles = [
            (self.media.photos, MediaKind::Photo),
            (self.media.videos, MediaKind::Video),
            (self.media.voice, MediaKind::Voice),
            (self.media.video_notes, MediaKind::VideoNote),
            (self.media.stickers, MediaKind::Sticker),
            (self.media.gifs, MediaKind::Animation),
            (self.media.files, MediaKind::Document),
        ];
        toggles
            .into_iter()
            .filter(|(enabled, _)| !enabled)
            .map(|(_, kind)| kind)
            .collect()
    }

    pub fn size_limit_bytes(&self) -> u64 {
        self.size_limit_mb.saturating_mul(1024 * 1024)
    }

    pub fn downloader(&self) -> DownloaderConfig {
        DownloaderConfig {
            max_concurrent_downloads: self.max_concurrent_downloads,
            renew_debounce: Duration::from_millis(self.renew_debounce_ms),
            ..DownloaderConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.output_dir, PathBuf::from("./chat_export"));
        assert_eq!(config.max_concurrent_downloads, 4);
        assert_eq!(config.size_limit_mb, 32);
        assert_eq!(config.renew_debounce_ms, 5000);
    }

    #[test]
    fn env_overrides_and_rejects_garbage() {
        let config = Config::from_lookup(lookup(&[
            ("CHAT_EXPORT_OUTPUT_DIR", "/tmp/out"),
            ("CHAT_EXPORT_MAX_CONCURRENT_DOWNLOADS", " 8 "),
        ]))
        .expect("config");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.max_concurrent_downloads, 8);

        let err = Config::from_lookup(lookup(&[("CHAT_EXPORT_SIZE_LIMIT_MB", "lots")]))
            .expect_err("invalid");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHAT_EXPORT_SIZE_LIMIT_MB",
                ..
            }
        ));
        assert!(
            Config::from_lookup(lookup(&[("CHAT_EXPORT_MAX_CONCURRENT_DOWNLOADS", "0")])).is_err()
        );
    }

    #[test]
    fn disabled_toggles_become_exclusions() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        let mut export = ExportConfig::new(&config);
        assert!(export.excluded_media().is_empty());

        export.media.gifs = false;
        export.media.files = false;
        assert_eq!(
            export.excluded_media(),
            BTreeSet::from([MediaKind::Document, MediaKind::Animation])
        );
        assert_eq!(export.size_limit_bytes(), 32 * 1024 * 1024);
    }

    #[test]
    fn date_window_is_validated() {
        let config = Config::from_lookup(lookup(&[])).expect("config");
        let now = Utc.with_ymd_and_hms(2026, 1, 28, 12, 0, 0).single().expect("now");

        let export = ExportConfig::new(&config)
            .with_dates(Some("01.01.2026"), Some("yesterday"), now)
            .expect("window");
        assert_eq!(
            export.to_date,
            Utc.with_ymd_and_hms(2026, 1, 27, 0, 0, 0).single().expect("date")
        );

        let err = ExportConfig::new(&config)
            .with_dates(Some("2026-02-01"), Some("2026-01-01"), now)
            .expect_err("inverted");
        assert!(matches!(err, ConfigError::EmptyRange { .. }));
    }

    #[test]
    fn downloader_config_carries_knobs() {
        let config = Config::from_lookup(lookup(&[("CHAT_EXPORT_RENEW_DEBOUNCE_MS", "250")]))
            .expect("config");
        let downloader = ExportConfig::new(&config).downloader();
        assert_eq!(downloader.renew_debounce, Duration::from_millis(250));
        assert_eq!(downloader.max_concurrent_downloads, 4);
        assert_eq!(downloader.renew_batch_limit, 100);
    }
}
