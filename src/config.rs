//! Loads the TOML configuration file and normalizes it into [`Config`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;

use crate::source::FeedId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Raw file shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    logging: RawLogging,
    source: RawSource,
    #[serde(default)]
    pacing: RawPacing,
    #[serde(default)]
    feeds: Vec<RawFeed>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    #[serde(default = "default_database_path")]
    path: String,
}

impl Default for RawDatabase {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawLogging {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    base_url: String,
    label: Option<String>,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawPacing {
    short_seconds: u64,
    medium_seconds: u64,
    long_seconds: u64,
    short_page_budget: u32,
    page_size: u32,
}

impl Default for RawPacing {
    fn default() -> Self {
        let pacing = Pacing::default();
        Self {
            short_seconds: pacing.short.as_secs(),
            medium_seconds: pacing.medium.as_secs(),
            long_seconds: pacing.long.as_secs(),
            short_page_budget: pacing.short_page_budget,
            page_size: pacing.page_size,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawFeed {
    id: FeedId,
    title: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_database_path() -> String {
    "data/feedmirror.db".to_string()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Normalized config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_path: PathBuf,
    pub log_level: String,
    pub source: SourceConfig,
    pub pacing: Pacing,
    pub feeds: Vec<FeedConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub base_url: String,
    pub label: String,
    pub timeout: Duration,
}

/// Delays between pages and page sizes of the pagination engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Delay after each of the first `short_page_budget` pages of a run.
    pub short: Duration,
    /// Delay after every later page.
    pub medium: Duration,
    /// Rest before re-probing a feed whose run ended.
    pub long: Duration,
    pub short_page_budget: u32,
    pub page_size: u32,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(5),
            medium: Duration::from_secs(20),
            long: Duration::from_secs(120),
            short_page_budget: 10,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub id: FeedId,
    pub title: String,
    pub enabled: bool,
}

impl FeedConfig {
    #[cfg(test)]
    pub fn new(id: FeedId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            enabled: true,
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).await?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        normalize(raw)
    }

    pub fn feed(&self, feed_id: FeedId) -> Option<&FeedConfig> {
        self.feeds.iter().find(|f| f.id == feed_id)
    }

    pub fn enabled_feeds(&self) -> impl Iterator<Item = &FeedConfig> {
        self.feeds.iter().filter(|f| f.enabled)
    }
}

fn normalize(raw: RawConfig) -> Result<Config, ConfigError> {
    let base_url = raw.source.base_url.trim().to_string();
    if base_url.is_empty() {
        return Err(ConfigError::Invalid("source.base_url must not be empty".into()));
    }
    if raw.source.timeout_seconds == 0 {
        return Err(ConfigError::Invalid("source.timeout_seconds must be > 0".into()));
    }

    let p = raw.pacing;
    if p.short_seconds == 0 || p.medium_seconds == 0 || p.long_seconds == 0 {
        return Err(ConfigError::Invalid("pacing delays must be > 0".into()));
    }
    if !(p.short_seconds <= p.medium_seconds && p.medium_seconds <= p.long_seconds) {
        return Err(ConfigError::Invalid(format!(
            "pacing delays must satisfy short <= medium <= long (got {}/{}/{})",
            p.short_seconds, p.medium_seconds, p.long_seconds
        )));
    }
    if !(1..=100).contains(&p.page_size) {
        return Err(ConfigError::Invalid(format!(
            "pacing.page_size must be within 1..=100 (got {})",
            p.page_size
        )));
    }

    if raw.feeds.is_empty() {
        return Err(ConfigError::Invalid("at least one [[feeds]] entry is required".into()));
    }
    let mut ids = HashSet::new();
    let mut feeds = Vec::with_capacity(raw.feeds.len());
    for feed in raw.feeds {
        if !ids.insert(feed.id) {
            return Err(ConfigError::Invalid(format!("duplicate feed id {}", feed.id)));
        }
        feeds.push(FeedConfig {
            id: feed.id,
            title: feed.title.unwrap_or_else(|| format!("feed {}", feed.id)),
            enabled: feed.enabled,
        });
    }

    Ok(Config {
        database_path: PathBuf::from(raw.database.path),
        log_level: raw.logging.level.unwrap_or_else(|| "info".to_string()),
        source: SourceConfig {
            label: raw.source.label.unwrap_or_else(|| "http".to_string()),
            base_url,
            timeout: Duration::from_secs(raw.source.timeout_seconds),
        },
        pacing: Pacing {
            short: Duration::from_secs(p.short_seconds),
            medium: Duration::from_secs(p.medium_seconds),
            long: Duration::from_secs(p.long_seconds),
            short_page_budget: p.short_page_budget,
            page_size: p.page_size,
        },
        feeds,
    })
}

/// First CLI argument if given, otherwise the bundled default.
pub fn pick_config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("res/config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [source]
        base_url = "http://127.0.0.1:8088"

        [[feeds]]
        id = -1001
    "#;

    #[test]
    fn minimal_file_gets_defaults() {
        let config = Config::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.database_path, PathBuf::from("data/feedmirror.db"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.source.label, "http");
        assert_eq!(config.source.timeout, Duration::from_secs(30));
        assert_eq!(config.pacing, Pacing::default());
        assert_eq!(config.feeds, vec![FeedConfig::new(-1001, "feed -1001")]);
    }

    #[test]
    fn full_file_is_normalized() {
        let config = Config::from_toml_str(
            r#"
            [database]
            path = "/var/lib/mirror.db"

            [logging]
            level = "debug"

            [source]
            base_url = " http://bridge:9000/ "
            label = "bridge"
            timeout_seconds = 10

            [pacing]
            short_seconds = 1
            medium_seconds = 1
            long_seconds = 60
            short_page_budget = 0
            page_size = 100

            [[feeds]]
            id = 1
            title = "Music"

            [[feeds]]
            id = 2
            title = "Podcasts"
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.source.base_url, "http://bridge:9000/");
        assert_eq!(config.pacing.short_page_budget, 0);
        assert_eq!(config.pacing.page_size, 100);
        let enabled: Vec<_> = config.enabled_feeds().map(|f| f.id).collect();
        assert_eq!(enabled, vec![1]);
        assert_eq!(config.feed(2).map(|f| f.title.as_str()), Some("Podcasts"));
    }

    fn invalid(text: &str) -> String {
        match Config::from_toml_str(text) {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_feeds() {
        let msg = invalid("[source]\nbase_url = \"http://x\"\n");
        assert!(msg.contains("feeds"));
    }

    #[test]
    fn rejects_duplicate_feed_ids() {
        let msg = invalid(&format!("{MINIMAL}\n[[feeds]]\nid = -1001\n"));
        assert!(msg.contains("duplicate"));
    }

    #[test]
    fn rejects_out_of_order_delays() {
        let msg = invalid(&format!(
            "{MINIMAL}\n[pacing]\nshort_seconds = 30\nmedium_seconds = 20\n"
        ));
        assert!(msg.contains("short <= medium"));
    }

    #[test]
    fn rejects_oversized_pages() {
        let msg = invalid(&format!("{MINIMAL}\n[pacing]\npage_size = 500\n"));
        assert!(msg.contains("page_size"));
    }

    #[test]
    fn rejects_empty_base_url() {
        let msg = invalid("[source]\nbase_url = \"  \"\n[[feeds]]\nid = 1\n");
        assert!(msg.contains("base_url"));
    }

    #[test]
    fn syntax_errors_are_toml_errors() {
        assert!(matches!(
            Config::from_toml_str("[source"),
            Err(ConfigError::Toml(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = Config::load(Path::new("/nonexistent/feedmirror.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
