use crate::config::ConnectionSettings;
use crate::error::{CrawlError, Result};
use encoding_rs::{Encoding, UTF_8};
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, REFERER};

/// A page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub url: String,
    /// Charset overriding whatever the response declares
    pub charset: Option<String>,
    pub referer: Option<String>,
}

impl PageRequest {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            charset: None,
            referer: None,
        }
    }
}

/// A successfully fetched and decoded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Final URL, after redirects
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

/// Source of pages. Implementations must be shareable among the workers of
/// a host. A call is a single request; retries are up to the caller.
#[cfg_attr(test, mockall::automock)]
pub trait Fetcher: Send + Sync {
    /// Fetches a page. Error statuses are [`CrawlError::Status`], transport
    /// failures [`CrawlError::Fetch`].
    fn fetch(&self, request: &PageRequest) -> Result<FetchedPage>;
}

/// Blocking HTTP fetcher
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &ConnectionSettings) -> Result<Self> {
        let redirect = if settings.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .gzip(true)
            .redirect(redirect)
            .connect_timeout(settings.connect_timeout())
            .timeout(settings.read_timeout())
            .build()
            .map_err(|e| CrawlError::Config(format!("can't build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Charset parameter of a `Content-Type` value
fn declared_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Decodes a body with the configured charset, else the declared one, else
/// UTF-8. Unknown labels are skipped.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>, charset: Option<&str>) -> String {
    let configured = charset.and_then(|label| {
        let encoding = Encoding::for_label(label.trim().as_bytes());
        if encoding.is_none() {
            warn!("Unknown charset '{}' configured, ignoring it", label);
        }
        encoding
    });
    let encoding = configured
        .or_else(|| {
            content_type
                .and_then(declared_charset)
                .and_then(|label| Encoding::for_label(label.as_bytes()))
        })
        .unwrap_or(UTF_8);
    let (text, _, malformed) = encoding.decode(bytes);
    if malformed {
        debug!("Body is not valid {}, replaced bad sequences", encoding.name());
    }
    text.into_owned()
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: &PageRequest) -> Result<FetchedPage> {
        let mut builder = self.client.get(&request.url);
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer.as_str());
        }
        let response = builder.send().map_err(|e| CrawlError::Fetch {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlError::Status {
                url: request.url.clone(),
                status: status.as_u16(),
            });
        }

        let url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().map_err(|e| CrawlError::Fetch {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
        let body = decode_body(&bytes, content_type.as_deref(), request.charset.as_deref());
        debug!("Fetched {} ({} bytes)", url, bytes.len());

        Ok(FetchedPage {
            url,
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}
