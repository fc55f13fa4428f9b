//! Polite multi-host crawler running as a `semcrawl` pipeline source.
//!
//! [`HtmlCrawler`] leases due URLs from a SQLite store, fetches them within
//! each host's crawl delay, follows same-host links matching the configured
//! patterns and emits an [`EntityDocument`] for every entity page.

pub mod config;
pub mod crawler;
pub mod db;
pub mod error;
pub mod fetch;
pub mod host_crawler;
pub mod hosts;
pub mod html;
pub mod models;
pub mod prefetch;
pub mod robots;
pub mod url_store;
pub mod urls;
pub mod writer;

pub use config::{ConnectionSettings, CrawlerConfig};
pub use crawler::{CrawlerParams, HtmlCrawler, HOST_MANAGER_KEY};
pub use db::Database;
pub use error::{CrawlError, Result};
pub use fetch::{FetchedPage, Fetcher, HttpFetcher, PageRequest};
pub use hosts::{HostRegistry, RegisteredHost};
pub use models::{EntityDescriptor, EntityDocument, HostDescriptor, SourcePattern, UrlEntry};
pub use robots::RobotsPolicy;
pub use url_store::{UrlQuery, UrlStore};
pub use writer::{DocumentWriter, WriterParams};
