//! Crawl statistics
//!
//! Counters are bumped concurrently by every worker, so each one is an atomic.
//! `snapshot` copies them into a plain struct for reporting and session saving.

use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of one download, as reported to `CrawlStats::update_file_stats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Downloaded and saved
    Saved,
    /// Cache copy is current (304)
    UpToDate,
    /// Download failed
    Failed,
}

/// Live crawl counters
#[derive(Debug, Default)]
pub struct CrawlStats {
    links_seen: AtomicU64,
    files_saved: AtomicU64,
    bytes_downloaded: AtomicU64,
    retried: AtomicU64,
    fatal: AtomicU64,
    failed: AtomicU64,
    filtered: AtomicU64,
    up_to_date: AtomicU64,
    pages_parsed: AtomicU64,
    duplicates_skipped: AtomicU64,
    parts_rescheduled: AtomicU64,
}

/// Point-in-time copy of the crawl counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// URLs accepted for fetching, seed included
    pub links_seen: u64,
    pub files_saved: u64,
    pub bytes_downloaded: u64,
    /// Retry attempts made by the fetcher
    pub retried: u64,
    /// URLs that failed with a non-retryable error
    pub fatal: u64,
    /// URLs that could not be downloaded, fatal or not
    pub failed: u64,
    /// Discovered links rejected by the rules
    pub filtered: u64,
    /// Conditional requests answered with 304
    pub up_to_date: u64,
    pub pages_parsed: u64,
    pub duplicates_skipped: u64,
    pub parts_rescheduled: u64,
}

macro_rules! counter {
    ($inc:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(add_link, links_seen);
    counter!(add_retry, retried);
    counter!(add_fatal, fatal);
    counter!(add_filtered, filtered);
    counter!(add_parsed, pages_parsed);
    counter!(add_duplicate, duplicates_skipped);
    counter!(add_rescheduled_part, parts_rescheduled);

    pub fn update_bytes(&self, n: u64) {
        self.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
    }

    /// Records the outcome of one download
    pub fn update_file_stats(&self, status: FileStatus) {
        let counter = match status {
            FileStatus::Saved => &self.files_saved,
            FileStatus::UpToDate => &self.up_to_date,
            FileStatus::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn files_saved(&self) -> u64 {
        self.files_saved.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            links_seen: self.links_seen.load(Ordering::Relaxed),
            files_saved: self.files_saved.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            up_to_date: self.up_to_date.load(Ordering::Relaxed),
            pages_parsed: self.pages_parsed.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            parts_rescheduled: self.parts_rescheduled.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter
    pub fn reset(&self) {
        self.restore(&[]);
    }

    /// Loads named counters saved with a session; unknown names are ignored
    pub fn restore(&self, values: &[(String, u64)]) {
        for (name, counter) in self.named() {
            let value = values
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .unwrap_or(0);
            counter.store(value, Ordering::Relaxed);
        }
    }

    /// Named counters for session saving
    pub fn to_named(&self) -> Vec<(String, u64)> {
        self.named()
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }

    fn named(&self) -> [(&'static str, &AtomicU64); 11] {
        [
            ("links_seen", &self.links_seen),
            ("files_saved", &self.files_saved),
            ("bytes_downloaded", &self.bytes_downloaded),
            ("retried", &self.retried),
            ("fatal", &self.fatal),
            ("failed", &self.failed),
            ("filtered", &self.filtered),
            ("up_to_date", &self.up_to_date),
            ("pages_parsed", &self.pages_parsed),
            ("duplicates_skipped", &self.duplicates_skipped),
            ("parts_rescheduled", &self.parts_rescheduled),
        ]
    }
}

/// Formats a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &StatsSnapshot) {
    println!("=== Crawl Statistics ===\n");

    println!("Links:");
    println!("  Seen: {}", stats.links_seen);
    println!("  Filtered: {}", stats.filtered);
    println!("  Pages parsed: {}", stats.pages_parsed);
    println!();

    println!("Files:");
    println!("  Saved: {}", stats.files_saved);
    println!("  Up to date: {}", stats.up_to_date);
    println!("  Downloaded: {}", format_bytes(stats.bytes_downloaded));
    println!("  Duplicates skipped: {}", stats.duplicates_skipped);
    println!();

    println!("Errors:");
    println!("  Failed: {} ({} fatal)", stats.failed, stats.fatal);
    println!("  Retries: {}", stats.retried);
    if stats.parts_rescheduled > 0 {
        println!("  Rescheduled parts: {}", stats.parts_rescheduled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let stats = CrawlStats::new();
        stats.add_link();
        stats.add_link();
        stats.add_filtered();
        stats.update_bytes(512);
        stats.update_file_stats(FileStatus::Saved);
        stats.update_file_stats(FileStatus::Failed);
        stats.add_fatal();

        let snap = stats.snapshot();
        assert_eq!(snap.links_seen, 2);
        assert_eq!(snap.filtered, 1);
        assert_eq!(snap.bytes_downloaded, 512);
        assert_eq!(snap.files_saved, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.fatal, 1);
    }

    #[test]
    fn test_named_round_trip() {
        let stats = CrawlStats::new();
        stats.add_link();
        stats.update_bytes(10);
        let named = stats.to_named();

        let restored = CrawlStats::new();
        restored.restore(&named);
        assert_eq!(restored.snapshot(), stats.snapshot());

        restored.reset();
        assert_eq!(restored.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
