use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrawlError>;

/// Errors raised by the crawler and its collaborators
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Unreadable or invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// The configuration file could not be deserialized
    #[error("can't read configuration {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The URL store failed
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A request failed at the transport level (timeout, refused connection)
    #[error("I/O error while accessing {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The server answered with an error status
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// A URL could not be parsed
    #[error("invalid URL '{0}'")]
    Url(String),

    /// A document could not be interpreted
    #[error("parse error: {0}")]
    Parse(String),

    /// Local file access (bootstrap list, output)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CrawlError {
    /// Transport failures are the ones that may indicate a connectivity outage
    pub fn is_transport(&self) -> bool {
        matches!(self, CrawlError::Fetch { .. })
    }
}
