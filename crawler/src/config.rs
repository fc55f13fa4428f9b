use crate::error::{CrawlError, Result};
use crate::models::HostDescriptor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default global crawl-delay floor in milliseconds
pub const DEF_GLOBAL_CRAWL_DELAY_MIN: i64 = 40;

/// HTTP client settings, handed explicitly to whatever issues requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Extra attempts after a transport failure
    pub retries: u32,
    pub follow_redirects: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("semcrawl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_ms: 10_000,
            read_timeout_ms: 20_000,
            retries: 2,
            follow_redirects: true,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Crawler configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// SQLite database; relative paths are resolved against the working
    /// directory
    pub database: PathBuf,

    #[serde(default = "default_threads")]
    pub threads_per_host: usize,

    /// Milliseconds; negative values count as 0
    #[serde(default = "default_delay_min")]
    pub global_crawl_delay_min: i64,

    /// Skip robots policy evaluation
    #[serde(default)]
    pub policy_ignored: bool,

    /// Send the host's base URL as `Referer`
    #[serde(default)]
    pub fake_referrer: bool,

    #[serde(default)]
    pub connection: ConnectionSettings,

    pub hosts: Vec<HostDescriptor>,
}

fn default_threads() -> usize {
    1
}

fn default_delay_min() -> i64 {
    DEF_GLOBAL_CRAWL_DELAY_MIN
}

impl CrawlerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| CrawlError::Config(format!("can't read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text).map_err(|source| CrawlError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Floor applied to every host's crawl delay
    pub fn crawl_delay_floor(&self) -> Duration {
        Duration::from_millis(self.global_crawl_delay_min.max(0) as u64)
    }

    pub fn threads(&self) -> usize {
        self.threads_per_host.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let conf: CrawlerConfig =
            serde_json::from_str(r#"{"database": "crawl.db", "hosts": []}"#).unwrap();
        assert_eq!(conf.threads(), 1);
        assert_eq!(conf.crawl_delay_floor(), Duration::from_millis(40));
        assert!(!conf.policy_ignored);
        assert_eq!(conf.connection.retries, 2);
    }

    #[test]
    fn negative_delay_floor_is_clamped() {
        let conf: CrawlerConfig = serde_json::from_str(
            r#"{"database": "crawl.db", "global_crawl_delay_min": -10, "threads_per_host": 0, "hosts": []}"#,
        )
        .unwrap();
        assert_eq!(conf.crawl_delay_floor(), Duration::ZERO);
        assert_eq!(conf.threads(), 1);
    }

    #[test]
    fn load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            CrawlerConfig::load(&path),
            Err(CrawlError::ConfigFile { .. })
        ));
        assert!(matches!(
            CrawlerConfig::load(dir.path().join("missing.json")),
            Err(CrawlError::Config(_))
        ));
    }
}
