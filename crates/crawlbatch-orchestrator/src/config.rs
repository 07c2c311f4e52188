use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub crawl: CrawlSettings,
    pub paths: PathSettings,
    pub wpt: WptSettings,
    pub tick: TickSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrawlSettings {
    pub archive: String,
    pub location: String,
    /// Failed items are resubmitted until this many passes have run.
    pub max_passes: u32,
    pub parse_shards: u32,
    /// Items tried this many times stay failed instead of being resubmitted.
    pub max_item_attempts: Option<u32>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            archive: "All".to_string(),
            location: "IE8".to_string(),
            max_passes: 2,
            parse_shards: 4,
            max_item_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    pub db_path: PathBuf,
    pub lock_dir: PathBuf,
    pub dump_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./var/crawlbatch.db"),
            lock_dir: PathBuf::from("./var/locks"),
            dump_dir: PathBuf::from("./var/dumps"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WptSettings {
    pub server: String,
    pub api_key: Option<String>,
    pub batch_size: u32,
    pub runs: u32,
    pub request_timeout_secs: u64,
}

impl Default for WptSettings {
    fn default() -> Self {
        Self {
            server: "http://localhost/".to_string(),
            api_key: None,
            batch_size: 100,
            runs: 1,
            request_timeout_secs: 30,
        }
    }
}

impl WptSettings {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TickSettings {
    /// How long the collector waits between progress reports on running tasks.
    pub poll_interval_secs: u64,
}

impl Default for TickSettings {
    fn default() -> Self {
        Self { poll_interval_secs: 10 }
    }
}

impl TickSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Settings {
    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("invalid config {}", path.display()))?
        } else {
            Self::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.crawl.max_passes >= 1, "crawl.max_passes must be at least 1");
        ensure!(self.crawl.parse_shards >= 1, "crawl.parse_shards must be at least 1");
        ensure!(!self.crawl.location.trim().is_empty(), "crawl.location is required");
        ensure!(self.wpt.batch_size >= 1, "wpt.batch_size must be at least 1");
        ensure!(self.wpt.runs >= 1, "wpt.runs must be at least 1");
        ensure!(self.tick.poll_interval_secs >= 1, "tick.poll_interval_secs must be at least 1");
        if let Some(limit) = self.crawl.max_item_attempts {
            ensure!(limit >= 1, "crawl.max_item_attempts must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cron_deployment() {
        let settings = Settings::default();
        assert_eq!(settings.crawl.max_passes, 2);
        assert_eq!(settings.crawl.parse_shards, 4);
        assert_eq!(settings.crawl.max_item_attempts, None);
        assert_eq!(settings.tick.poll_interval(), Duration::from_secs(10));
        settings.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let settings = Settings::from_toml(
            r#"
            [crawl]
            location = "Dulles_Chrome"
            parse_shards = 8

            [wpt]
            server = "https://wpt.example.org/"
            api_key = "secret"
            "#,
        )
        .expect("parse");

        assert_eq!(settings.crawl.location, "Dulles_Chrome");
        assert_eq!(settings.crawl.parse_shards, 8);
        assert_eq!(settings.crawl.archive, "All");
        assert_eq!(settings.wpt.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.wpt.batch_size, 100);
        assert_eq!(settings.paths.lock_dir, PathBuf::from("./var/locks"));
    }

    #[test]
    fn rejects_unknown_keys_and_zero_limits() {
        assert!(Settings::from_toml("[crawl]\nmax_pases = 3\n").is_err());

        let settings = Settings::from_toml("[crawl]\nparse_shards = 0\n").expect("parse");
        assert!(settings.validate().is_err());

        let settings = Settings::from_toml("[crawl]\nmax_item_attempts = 0\n").expect("parse");
        assert!(settings.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(settings.crawl.location, "IE8");
    }
}
