//! Saved-file output
//!
//! Downloaded resources are mirrored under the project directory as
//! `<project>/<host>[_port]/<path>`, with `index.html` standing in for directory URLs.

use crate::storage::traits::{StorageError, StorageResult};
use crate::url::CrawlUrl;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Where downloaded bodies go
#[derive(Debug, Clone)]
pub enum PageSink {
    /// Mirror files under a project directory
    Disk { root: PathBuf },
    /// Count files as saved without writing them
    Discard,
}

impl PageSink {
    pub fn disk(root: impl Into<PathBuf>) -> Self {
        Self::Disk { root: root.into() }
    }

    /// Writes a body and returns where it went (`None` for `Discard`)
    pub async fn save(&self, url: &CrawlUrl, body: &[u8]) -> StorageResult<Option<PathBuf>> {
        match self {
            Self::Discard => Ok(None),
            Self::Disk { root } => {
                let path = local_path(root, url)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, body).await?;
                tracing::trace!(url = %url, path = %path.display(), bytes = body.len(), "saved");
                Ok(Some(path))
            }
        }
    }
}

/// Maps a URL onto a path below `root`
pub fn local_path(root: &Path, url: &CrawlUrl) -> StorageResult<PathBuf> {
    let parsed = url.url();
    let host = parsed
        .host_str()
        .ok_or_else(|| StorageError::InvalidPath(url.full_url().to_string()))?;

    let mut path = root.to_path_buf();
    match parsed.port() {
        Some(port) => path.push(format!("{}_{}", sanitize(host), port)),
        None => path.push(sanitize(host)),
    }

    let segments: Vec<String> = parsed
        .path()
        .split('/')
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .map(sanitize)
        .collect();

    let directory_like = parsed.path().ends_with('/') || segments.is_empty();
    for segment in &segments {
        path.push(segment);
    }
    if directory_like {
        path.push("index.html");
    }

    if let Some(query) = parsed.query() {
        let digest = hex::encode(&Sha256::digest(query.as_bytes())[..4]);
        let file = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.set_file_name(format!("{}_q{}", file, digest));
    }

    Ok(path)
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_path_mapping() {
        let root = Path::new("/out");
        let page = CrawlUrl::seed("http://example.com/docs/").unwrap();
        assert_eq!(
            local_path(root, &page).unwrap(),
            PathBuf::from("/out/example.com/docs/index.html")
        );

        let file = CrawlUrl::seed("http://127.0.0.1:8080/img/logo.png").unwrap();
        assert_eq!(
            local_path(root, &file).unwrap(),
            PathBuf::from("/out/127.0.0.1_8080/img/logo.png")
        );
    }

    #[test]
    fn test_query_gets_distinct_name() {
        let root = Path::new("/out");
        let a = CrawlUrl::seed("http://example.com/list?page=1").unwrap();
        let b = CrawlUrl::seed("http://example.com/list?page=2").unwrap();
        assert_ne!(local_path(root, &a).unwrap(), local_path(root, &b).unwrap());
    }

    #[tokio::test]
    async fn test_disk_sink_writes_file() {
        let dir = TempDir::new().unwrap();
        let sink = PageSink::disk(dir.path());
        let url = CrawlUrl::seed("http://example.com/a/b.txt").unwrap();

        let path = sink.save(&url, b"hello").await.unwrap().unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_discard_sink() {
        let url = CrawlUrl::seed("http://example.com/").unwrap();
        assert!(PageSink::Discard.save(&url, b"x").await.unwrap().is_none());
    }
}
