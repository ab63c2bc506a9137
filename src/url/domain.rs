use url::Url;

/// Extracts the lowercase host of a URL
///
/// # Examples
///
/// ```
/// use url::Url;
/// use ripple_harvest::url::extract_domain;
///
/// let url = Url::parse("https://Blog.Example.com/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("blog.example.com".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_lowercase())
}

/// Checks if a domain matches a blacklist pattern
///
/// `"example.com"` matches only itself. `"*.example.com"` matches the bare domain
/// and any subdomain of it.
pub fn matches_wildcard(pattern: &str, candidate: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || (candidate.len() > base.len()
                    && candidate.ends_with(base)
                    && candidate.as_bytes()[candidate.len() - base.len() - 1] == b'.')
        }
        None => candidate == pattern,
    }
}

/// Finds the first server priority entry whose key appears in `domain`
///
/// Server priority keys are fragments, so `"example"` applies to both
/// `docs.example.com` and `example.org`. Keys are visited in sorted order so the
/// result does not depend on map iteration order.
pub fn server_priority<'a, I>(domain: &str, entries: I) -> Option<i32>
where
    I: IntoIterator<Item = (&'a String, &'a i32)>,
{
    let mut sorted: Vec<(&String, &i32)> = entries.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .into_iter()
        .find(|(key, _)| domain.contains(key.as_str()))
        .map(|(_, value)| *value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_extract_with_port() {
        let url = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(extract_domain(&url), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn test_extract_mixed_case() {
        let url = Url::parse("https://Example.COM/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_exact_pattern() {
        assert!(matches_wildcard("example.com", "example.com"));
        assert!(!matches_wildcard("example.com", "blog.example.com"));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(matches_wildcard("*.example.com", "example.com"));
        assert!(matches_wildcard("*.example.com", "blog.example.com"));
        assert!(matches_wildcard("*.example.com", "api.v2.example.com"));
        assert!(!matches_wildcard("*.example.com", "badexample.com"));
        assert!(!matches_wildcard("*.example.com", "example.org"));
    }

    #[test]
    fn test_server_priority_partial_match() {
        let mut servers = HashMap::new();
        servers.insert("example".to_string(), 3);
        servers.insert("other.net".to_string(), 7);

        assert_eq!(server_priority("docs.example.com", &servers), Some(3));
        assert_eq!(server_priority("other.net", &servers), Some(7));
        assert_eq!(server_priority("unrelated.org", &servers), None);
    }
}
