//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the full crawl cycle end-to-end.

use ripple_harvest::config::Config;
use ripple_harvest::storage::{
    CacheRecord, CacheStore, MemoryCache, SessionStore, SqliteStore, StorageError,
};
use ripple_harvest::{Coordinator, CrawlUrl};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a small, fast configuration with no database and no saved files
fn create_test_config() -> Config {
    let mut config = Config::default();
    config.crawler.workers = 2;
    config.crawler.queue_timeout_ms = 20;
    config.crawler.shutdown_timeout_secs = 5;
    config.network.retries = 0;
    config.pool.poll_interval_ms = 20;
    config.pool.drain_timeout_secs = 5;
    config.limits.controller_interval_ms = 10;
    config.output.database_path = String::new();
    config.output.save_files = false;
    config
}

fn page_with_links(links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|l| format!(r#"<a href="{}">link</a>"#, l))
        .collect();
    format!("<html><body>{}</body></html>", anchors)
}

async fn mount_page(server: &MockServer, at: &str, links: &[&str]) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(page_with_links(links)),
        )
        .mount(server)
        .await;
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        count_files(&path)
                    } else {
                        1
                    }
                })
                .sum()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_full_crawl_filters_and_saves() {
    let server = MockServer::start().await;
    mount_page(&server, "/", &["/a.html", "/b.html", "/c.zip"]).await;
    mount_page(&server, "/a.html", &[]).await;
    mount_page(&server, "/b.html", &[]).await;

    let project = TempDir::new().expect("Failed to create temp dir");
    let mut config = create_test_config();
    config.rules.skip_extensions = vec!["zip".to_string()];
    config.output.save_files = true;
    config.output.project_dir = project.path().display().to_string();

    let mut coordinator = Coordinator::new(config).expect("Failed to create coordinator");
    coordinator
        .configure(&format!("{}/", server.uri()))
        .expect("Failed to configure");
    let report = tokio::time::timeout(Duration::from_secs(20), coordinator.crawl())
        .await
        .expect("Crawl timed out")
        .expect("Crawl failed");

    assert!(report.completed(), "crawl should run dry on its own");
    assert_eq!(report.stats.links_seen, 3);
    assert_eq!(report.stats.filtered, 1);
    assert_eq!(report.stats.files_saved, 3);
    assert_eq!(report.stats.pages_parsed, 3);
    assert!(report.counters.is_balanced());
    assert_eq!(count_files(project.path()), 3);

    // The filtered resource was never requested
    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.iter().all(|r| !r.url.path().ends_with(".zip")));
}

#[tokio::test]
async fn test_fatal_status_ends_crawl_without_children() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut coordinator = Coordinator::new(create_test_config()).expect("coordinator");
    coordinator
        .configure(&format!("{}/", server.uri()))
        .expect("configure");
    let report = tokio::time::timeout(Duration::from_secs(20), coordinator.crawl())
        .await
        .expect("Crawl timed out")
        .expect("Crawl failed");

    assert!(report.completed());
    assert_eq!(report.stats.fatal, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.files_saved, 0);
    assert_eq!(report.stats.links_seen, 1);
    assert!(report.counters.is_balanced());
}

#[tokio::test]
async fn test_cached_page_is_not_modified() {
    let server = MockServer::start().await;
    // A conditional first attempt is a HEAD request
    Mock::given(method("HEAD"))
        .and(path("/"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let seed = format!("{}/", server.uri());
    let cache = Arc::new(MemoryCache::new());
    cache
        .update(
            CrawlUrl::seed(&seed).expect("seed").full_url(),
            &CacheRecord {
                etag: Some("\"v1\"".to_string()),
                last_modified: None,
                checksum: None,
            },
        )
        .expect("cache update");

    let mut coordinator = Coordinator::builder(create_test_config())
        .cache(cache)
        .build()
        .expect("coordinator");
    coordinator.configure(&seed).expect("configure");
    let report = tokio::time::timeout(Duration::from_secs(20), coordinator.crawl())
        .await
        .expect("Crawl timed out")
        .expect("Crawl failed");

    assert!(report.completed());
    assert_eq!(report.stats.up_to_date, 1);
    assert_eq!(report.stats.files_saved, 0);
    assert_eq!(report.stats.pages_parsed, 0);
    assert_eq!(report.stats.links_seen, 1);

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.iter().all(|r| r.method.as_str() == "HEAD"));
}

#[tokio::test]
async fn test_ceiling_stop_then_restart() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/",
        &["/p1.html", "/p2.html", "/p3.html", "/p4.html", "/p5.html"],
    )
    .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/p\d\.html$"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(page_with_links(&[]))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = dir.path().join("harvest.db");
    let seed = format!("{}/", server.uri());

    // First run stops at the file ceiling
    let mut config = create_test_config();
    config.output.database_path = db_path.display().to_string();
    config.limits.max_files = 2;

    let mut coordinator = Coordinator::new(config).expect("coordinator");
    coordinator.configure(&seed).expect("configure");
    let report = tokio::time::timeout(Duration::from_secs(20), coordinator.crawl())
        .await
        .expect("Crawl timed out")
        .expect("Crawl failed");

    assert!(report.forced);
    assert!(!report.completed());
    assert!(report.stats.files_saved >= 2);
    assert!(report.stats.files_saved < 6);

    let ctx = coordinator.context();
    assert_eq!(ctx.gate.count(), 0, "every connection must be released");
    assert!(ctx.gate.writes_blocked());
    drop(coordinator);

    let store = SqliteStore::new(&db_path).expect("open store");
    let saved = store.load_session().expect("session should be saved");
    assert_eq!(saved.seed, CrawlUrl::seed(&seed).expect("seed").full_url());
    assert!(!saved.frontier.is_empty());
    assert!(saved.seen.len() >= 6);
    drop(store);

    // Second run resumes from the saved frontier without ceilings
    let mut config = create_test_config();
    config.output.database_path = db_path.display().to_string();

    let mut coordinator = Coordinator::new(config).expect("coordinator");
    let report = tokio::time::timeout(Duration::from_secs(30), coordinator.restart())
        .await
        .expect("Restart timed out")
        .expect("Restart failed");

    assert!(report.completed());
    assert!(report.stats.files_saved > 2);
    assert_eq!(report.stats.links_seen, 6);
    assert!(report.counters.is_balanced());
    drop(coordinator);

    let store = SqliteStore::new(&db_path).expect("open store");
    assert!(matches!(
        store.load_session(),
        Err(StorageError::NoSession)
    ));
}

#[tokio::test]
async fn test_single_threaded_crawl() {
    let server = MockServer::start().await;
    mount_page(&server, "/", &["/a.html", "/b.html"]).await;
    mount_page(&server, "/a.html", &["/b.html"]).await;
    mount_page(&server, "/b.html", &["/"]).await;

    let mut config = create_test_config();
    config.crawler.single_threaded = true;

    let mut coordinator = Coordinator::new(config).expect("coordinator");
    coordinator
        .configure(&format!("{}/", server.uri()))
        .expect("configure");
    let report = tokio::time::timeout(Duration::from_secs(20), coordinator.crawl())
        .await
        .expect("Crawl timed out")
        .expect("Crawl failed");

    assert!(report.completed());
    assert_eq!(report.stats.files_saved, 3);
    assert_eq!(report.stats.links_seen, 3);
}
