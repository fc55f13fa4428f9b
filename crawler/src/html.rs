use crate::error::{CrawlError, Result};
use log::trace;
use scraper::{Html, Selector};

/// What the crawler needs from a page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    /// Raw `href` values of anchors, in document order
    pub links: Vec<String>,
    /// `<base href>` of the document head
    pub base_href: Option<String>,
    pub title: Option<String>,
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| CrawlError::Parse(format!("selector '{}': {:?}", css, e)))
}

/// Parses an HTML document and collects its links, base and title
pub fn parse_page(body: &str) -> Result<ParsedPage> {
    let document = Html::parse_document(body);
    let anchors = selector("a[href]")?;
    let base = selector("head base[href]")?;
    let title = selector("title")?;

    let links: Vec<String> = document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#'))
        .filter(|href| {
            let lower = href.to_ascii_lowercase();
            !lower.starts_with("javascript:") && !lower.starts_with("mailto:")
        })
        .map(str::to_string)
        .collect();
    trace!("Found {} links", links.len());

    let base_href = document
        .select(&base)
        .next()
        .and_then(|b| b.value().attr("href"))
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    let title = document
        .select(&title)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    Ok(ParsedPage {
        links,
        base_href,
        title,
    })
}
