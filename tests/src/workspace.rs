use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const CONF_FILE: &str = "conf.json";

/// Crawl settings written to the configuration file
#[derive(Debug, Clone)]
pub struct CrawlSetup {
    pub base_url: String,
    pub threads: usize,
    pub delay_floor_ms: i64,
    pub policy_ignored: bool,
}

impl CrawlSetup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            threads: 2,
            delay_floor_ms: 0,
            policy_ignored: false,
        }
    }

    pub fn config(&self) -> serde_json::Value {
        json!({
            "database": "crawl.db",
            "threads_per_host": self.threads,
            "global_crawl_delay_min": self.delay_floor_ms,
            "policy_ignored": self.policy_ignored,
            "connection": {
                "connect_timeout_ms": 2000,
                "read_timeout_ms": 2000,
                "retries": 0
            },
            "hosts": [{
                "base_url": self.base_url,
                "name": "test-site",
                "sources": [
                    {"pattern": "/", "update_freq": 3600},
                    {"pattern": "/list/\\d+", "update_freq": 3600}
                ],
                "entities": [{
                    "pattern": "/item/\\d+",
                    "update_freq": 3600,
                    "scrapers": [{"name": "title", "selector": "title"}]
                }]
            }]
        })
    }

    /// Writes the configuration and a bootstrap list with `seeds` into
    /// `dir`
    pub fn write(&self, dir: &Path, seeds: &[String]) -> anyhow::Result<()> {
        fs::write(dir.join(CONF_FILE), serde_json::to_string_pretty(&self.config())?)?;
        fs::write(dir.join("bootstrap.list"), seeds.join("\n"))?;
        Ok(())
    }
}

pub fn scratch_dir() -> anyhow::Result<TempDir> {
    Ok(tempfile::tempdir()?)
}
