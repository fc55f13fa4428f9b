//! URL normalization and host comparison.

use crate::error::{CrawlError, Result};
use url::{ParseError, Position, Url};

/// Query parameters dropped during normalization: a name prefix and a
/// name substring
const UNWANTED_PREFIX: &str = "utm_";
const UNWANTED_SUBSTRING: &str = "session";

/// Parses and normalizes a URL string, prefixing `http://` when the input
/// has no scheme
pub fn normalize(raw: &str) -> Result<Url> {
    let raw = raw.trim();
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("http://{}", raw)).map_err(|_| CrawlError::Url(raw.to_string()))?
        }
        Err(_) => return Err(CrawlError::Url(raw.to_string())),
    };
    normalize_url(url)
}

/// Canonical form of an HTTP(S) URL.
///
/// Lower-cases the host, drops the default port and the fragment, resolves
/// dot segments, decodes percent-encoded unreserved characters, upper-cases
/// the remaining escapes, filters tracking parameters and sorts the query.
pub fn normalize_url(mut url: Url) -> Result<Url> {
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CrawlError::Url(url.to_string()));
    }
    url.set_fragment(None);

    let path = decode_unreserved(url.path());
    url.set_path(if path.is_empty() { "/" } else { &path });

    let query = url.query().map(sort_and_clean_params);
    match query {
        Some(q) if !q.is_empty() => url.set_query(Some(&q)),
        _ => url.set_query(None),
    }
    Ok(url)
}

/// Resolves a link found on a page against the page's base URL
pub fn resolve(base: &Url, href: &str) -> Result<Url> {
    let joined = base
        .join(href.trim())
        .map_err(|_| CrawlError::Url(href.to_string()))?;
    normalize_url(joined)
}

/// Scheme and authority with a trailing slash, e.g. `http://example.com/`
pub fn full_host(url: &Url) -> String {
    format!("{}/", url.origin().ascii_serialization())
}

/// With `full`, compares scheme, host and port; otherwise the host name only
pub fn equal_hosts(a: &Url, b: &Url, full: bool) -> bool {
    if full {
        full_host(a) == full_host(b)
    } else {
        a.host_str() == b.host_str()
    }
}

/// Path and query of a URL, the part matched against host patterns
pub fn path_and_query(url: &Url) -> &str {
    &url[Position::BeforePath..Position::AfterQuery]
}

fn sort_and_clean_params(query: &str) -> String {
    let delimiter = if query.contains('&') {
        '&'
    } else if query.contains(';') {
        ';'
    } else {
        '&'
    };

    let mut params: Vec<(String, String)> = query
        .split(delimiter)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((name, value)) => (decode_unreserved(name), Some(decode_unreserved(value))),
            None => (decode_unreserved(p), None),
        })
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !name.starts_with(UNWANTED_PREFIX) && !name.contains(UNWANTED_SUBSTRING)
        })
        .map(|(name, value)| match value {
            Some(value) => (name, format!("={}", value)),
            None => (name, String::new()),
        })
        .collect();
    params.sort();

    params
        .into_iter()
        .map(|(name, value)| name + &value)
        .collect::<Vec<_>>()
        .join(&delimiter.to_string())
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}

/// Decodes `%XX` escapes of unreserved characters and upper-cases the rest
fn decode_unreserved(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = [bytes[i + 1], bytes[i + 2]];
            let value = std::str::from_utf8(&hex)
                .ok()
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            if let Some(value) = value {
                if is_unreserved(value) {
                    out.push(value);
                } else {
                    out.push(b'%');
                    out.extend(hex.iter().map(u8::to_ascii_uppercase));
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
