//! Page parsing for link discovery
//!
//! Web pages are parsed with `scraper` for links and metadata; stylesheets are
//! scanned for `url(...)` and `@import` references. Every returned link is absolute
//! and normalized.

use crate::url::{resolve_link, CrawlUrl};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use url::Url;

/// Why a body could not be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("body is empty")]
    Empty,

    #[error("body looks binary")]
    Binary,

    #[error("invalid selector {0}")]
    Selector(String),
}

/// Extracted information from a fetched page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    /// The page title (from <title> tag)
    pub title: Option<String>,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    /// Absolute links, in document order, without duplicates
    pub links: Vec<Url>,
    /// False when the page asks robots not to follow its links
    pub follow: bool,
}

/// Turns a fetched body into links and metadata
pub trait PageParser: Send + Sync {
    fn parse(&self, source: &CrawlUrl, body: &[u8]) -> Result<ParsedDocument, ParseError>;
}

/// Default parser for HTML pages and stylesheets
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlParser;

impl PageParser for HtmlParser {
    fn parse(&self, source: &CrawlUrl, body: &[u8]) -> Result<ParsedDocument, ParseError> {
        if body.is_empty() {
            return Err(ParseError::Empty);
        }
        if body.iter().take(1024).any(|&b| b == 0) {
            return Err(ParseError::Binary);
        }

        let text = String::from_utf8_lossy(body);
        if source.is_stylesheet() {
            Ok(ParsedDocument {
                links: extract_css_links(&text, source.url()),
                follow: true,
                ..ParsedDocument::default()
            })
        } else {
            parse_html(&text, source.url())
        }
    }
}

/// Parses HTML content and extracts links and metadata
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href>` and `<area href>`
/// - `<link href>` for stylesheets and canonical links
/// - `<img src>`, `<frame src>`, `<iframe src>`
/// - `url(...)` references inside `<style>` blocks
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` and `data:` links
/// - Fragment-only links
///
/// A `<base href>` replaces the page URL for resolution. `<meta name="robots"
/// content="nofollow">` clears `follow`.
pub fn parse_html(html: &str, page_url: &Url) -> Result<ParsedDocument, ParseError> {
    let document = Html::parse_document(html);

    let base = select_attr(&document, "base[href]", "href")?
        .into_iter()
        .next()
        .and_then(|href| page_url.join(&href).ok())
        .unwrap_or_else(|| page_url.clone());

    let mut links = LinkSet::default();

    let anchors = selector("a[href], area[href]")?;
    for element in document.select(&anchors) {
        if element.value().attr("download").is_some() {
            continue;
        }
        if let Some(href) = element.value().attr("href") {
            links.add(resolve_link(&base, href));
        }
    }

    let link_tags = selector("link[href]")?;
    for element in document.select(&link_tags) {
        let rel = element.value().attr("rel").unwrap_or("").to_ascii_lowercase();
        if rel.contains("stylesheet") || rel.contains("canonical") {
            if let Some(href) = element.value().attr("href") {
                links.add(resolve_link(&base, href));
            }
        }
    }

    for src in select_attr(&document, "img[src], frame[src], iframe[src]", "src")? {
        links.add(resolve_link(&base, &src));
    }

    let styles = selector("style")?;
    for element in document.select(&styles) {
        let css: String = element.text().collect();
        for link in extract_css_links(&css, &base) {
            links.add(Some(link));
        }
    }

    Ok(ParsedDocument {
        title: extract_title(&document),
        description: meta_content(&document, "description")?,
        keywords: meta_content(&document, "keywords")?
            .map(|k| {
                k.split(',')
                    .map(|w| w.trim().to_string())
                    .filter(|w| !w.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        follow: !meta_content(&document, "robots")?
            .map(|r| r.to_ascii_lowercase().contains("nofollow"))
            .unwrap_or(false),
        links: links.into_vec(),
    })
}

/// Finds `url(...)` and `@import` references in a stylesheet
pub fn extract_css_links(css: &str, base: &Url) -> Vec<Url> {
    static URL_FN: OnceLock<Option<Regex>> = OnceLock::new();
    static IMPORT: OnceLock<Option<Regex>> = OnceLock::new();

    let url_fn = URL_FN.get_or_init(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).ok());
    let import = IMPORT.get_or_init(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).ok());

    let mut links = LinkSet::default();
    for re in [url_fn, import].into_iter().flatten() {
        for captures in re.captures_iter(css) {
            if let Some(m) = captures.get(1) {
                links.add(resolve_link(base, m.as_str()));
            }
        }
    }
    links.into_vec()
}

#[derive(Default)]
struct LinkSet {
    seen: HashSet<String>,
    links: Vec<Url>,
}

impl LinkSet {
    fn add(&mut self, link: Option<Url>) {
        if let Some(link) = link {
            if self.seen.insert(link.as_str().to_string()) {
                self.links.push(link);
            }
        }
    }

    fn into_vec(self) -> Vec<Url> {
        self.links
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|_| ParseError::Selector(css.to_string()))
}

fn select_attr(document: &Html, css: &str, attr: &str) -> Result<Vec<String>, ParseError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .filter_map(|e| e.value().attr(attr).map(str::to_string))
        .collect())
}

/// Extracts the page title from the HTML document
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;

    document
        .select(&title_selector)
        .next()
        .map(|element| element.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn meta_content(document: &Html, name: &str) -> Result<Option<String>, ParseError> {
    let sel = selector("meta[name][content]")?;
    Ok(document
        .select(&sel)
        .find(|e| {
            e.value()
                .attr("name")
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
        .and_then(|e| e.value().attr("content"))
        .map(|c| c.trim().to_string()))
}
