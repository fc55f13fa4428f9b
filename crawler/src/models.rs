use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::UNIX_EPOCH;

/// Score below which a URL is considered dead
pub const SCORE_MIN: i16 = -5;

/// Default relative weight of an entity type
pub const DEF_ENTITY_WEIGHT: u32 = 1;

/// One discovered URL and its crawl state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlEntry {
    /// Row id, 0 until stored
    pub id: i64,

    /// Owning host
    pub host_id: i64,

    /// Normalized host address (`http://example.com/`), filled in when read
    /// from the store
    pub host: String,

    /// Path and query, relative to the host
    pub path: String,

    /// Last crawl attempt
    pub last_visited: DateTime<Utc>,

    pub visit_count: u32,

    /// Minimum seconds between two visits
    pub update_freq: u32,

    /// Entity pages are emitted downstream, source pages are only scanned
    /// for links
    pub entity: bool,

    /// The configured pattern this URL matched
    pub pattern: String,

    pub working: bool,

    /// Health score, never above 0
    pub score: i16,
}

impl UrlEntry {
    /// A freshly discovered, never visited URL
    pub fn new(host_id: i64, path: &str, update_freq: u32, entity: bool, pattern: &str) -> Self {
        Self {
            id: 0,
            host_id,
            host: String::new(),
            path: path.to_string(),
            last_visited: epoch(),
            visit_count: 0,
            update_freq,
            entity,
            pattern: pattern.to_string(),
            working: true,
            score: 0,
        }
    }

    /// Absolute URL of this entry
    pub fn url(&self) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), self.path)
    }

    /// Updates score and working flag after a crawl attempt
    pub fn apply_outcome(&mut self, ok: bool) {
        self.score = next_score(self.score, ok);
        self.working = self.score > SCORE_MIN;
    }
}

impl fmt::Display for UrlEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (score {})", self.url(), self.score)
    }
}

/// Success moves the score toward 0 and never above it; failure moves it
/// toward `SCORE_MIN` and never below it
pub fn next_score(score: i16, ok: bool) -> i16 {
    if ok {
        0i16.min(score.saturating_add(1))
    } else {
        score.saturating_sub(1).max(SCORE_MIN)
    }
}

/// The Unix epoch, used as "never visited"
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::from(UNIX_EPOCH)
}

/// Seconds since the epoch to a timestamp; out of range values map to the
/// epoch
pub fn from_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(epoch)
}

/// Source URL pattern with its re-crawl interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePattern {
    pub pattern: String,
    /// Seconds
    pub update_freq: u32,
}

/// A kind of page whose content is extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Regex matched against the whole relative URL
    pub pattern: String,

    /// Seconds
    pub update_freq: u32,

    /// Share of each prefetch batch, relative to the host's other entities
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Extractor configurations, passed through to the documents
    #[serde(default)]
    pub scrapers: Vec<Value>,
}

fn default_weight() -> u32 {
    DEF_ENTITY_WEIGHT
}

/// Crawl configuration of one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub base_url: String,

    pub name: String,

    /// Charset overriding the one pages declare
    #[serde(default)]
    pub charset: Option<String>,

    /// Milliseconds; overrides the robots policy
    #[serde(default)]
    pub crawl_delay: Option<u64>,

    /// Crawl every source page before the first entity
    #[serde(default)]
    pub source_first: bool,

    /// In declaration order
    #[serde(default)]
    pub sources: Vec<SourcePattern>,

    /// In declaration order
    #[serde(default)]
    pub entities: Vec<EntityDescriptor>,
}

/// A crawled entity page, emitted downstream by the crawler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDocument {
    /// URL the page was fetched from
    pub url: String,

    /// `<base href>` of the page if present, otherwise `url`
    pub base_url: String,

    /// Entity pattern the URL matched
    pub pattern: String,

    /// Extractor configurations of the matched entity
    pub scrapers: Vec<Value>,

    pub title: Option<String>,

    /// Decoded page body
    #[serde(skip)]
    pub html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_never_raises_score_above_zero() {
        assert_eq!(next_score(0, true), 0);
        assert_eq!(next_score(-3, true), -2);
        assert_eq!(next_score(-1, true), 0);
    }

    #[test]
    fn failure_is_clamped_at_minimum() {
        assert_eq!(next_score(0, false), -1);
        assert_eq!(next_score(SCORE_MIN, false), SCORE_MIN);
    }

    #[test]
    fn dead_entries_stop_working() {
        let mut entry = UrlEntry::new(1, "/a", 60, true, "/a");
        entry.score = SCORE_MIN + 2;
        entry.apply_outcome(false);
        assert!(entry.working);
        entry.apply_outcome(false);
        assert_eq!(entry.score, SCORE_MIN);
        assert!(!entry.working);
        entry.apply_outcome(true);
        assert!(entry.working);
    }

    #[test]
    fn url_joins_host_and_path() {
        let mut entry = UrlEntry::new(1, "/item?id=3", 60, true, "/item.*");
        entry.host = "http://example.com/".to_string();
        assert_eq!(entry.url(), "http://example.com/item?id=3");
    }

    #[test]
    fn descriptor_defaults() {
        let host: HostDescriptor = serde_json::from_str(
            r#"{"base_url": "http://example.com/", "name": "ex",
                "entities": [{"pattern": "/item/\\d+", "update_freq": 3600}]}"#,
        )
        .unwrap();
        assert_eq!(host.entities[0].weight, DEF_ENTITY_WEIGHT);
        assert!(host.sources.is_empty());
        assert!(!host.source_first);
    }
}
