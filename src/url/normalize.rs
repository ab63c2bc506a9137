use crate::UrlError;
use url::Url;

/// List of tracking query parameters to remove during normalization
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_eid"];

/// Schemes that never lead to a fetchable resource
const SKIPPED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:", "data:", "ftp:", "file:"];

/// Normalizes a URL so that equivalent spellings share one identity
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or not HTTP(S)
/// 2. Lowercase the host
/// 3. Remove dot segments and duplicate slashes from the path
/// 4. Remove the fragment
/// 5. Remove tracking query parameters (`utm_*`, `fbclid`, ...)
/// 6. Remove an empty query string
///
/// Trailing slashes are kept: `/docs/` and `/docs` are different resources to a server.
///
/// # Examples
///
/// ```
/// use ripple_harvest::url::normalize_url;
///
/// let url = normalize_url("http://EXAMPLE.com/a/../b#top").unwrap();
/// assert_eq!(url.as_str(), "http://example.com/b");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;
    normalize_parsed(url)
}

/// Resolves `href` against `base` and normalizes the result
///
/// Returns `None` for links that cannot be fetched (`mailto:`, `javascript:`, fragments, ...).
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lowered = href.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
        return None;
    }

    let joined = base.join(href).ok()?;
    normalize_parsed(joined).ok()
}

fn normalize_parsed(mut url: Url) -> Result<Url, UrlError> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    let Some(host) = url.host_str() else {
        return Err(UrlError::MissingDomain);
    };
    let lowered = host.to_lowercase();
    if lowered != host {
        url.set_host(Some(&lowered))
            .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;
    }

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);
    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !is_tracking_param(key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    Ok(url)
}

/// Removes dot segments and empty segments, keeping a trailing slash
fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        return "/".to_string();
    }

    let mut result = format!("/{}", segments.join("/"));
    if path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..") {
        result.push('/');
    }
    result
}

/// Checks if a query parameter is a tracking parameter
fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}
