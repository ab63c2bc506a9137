//! End-of-crawl report

use crate::output::stats::{format_bytes, print_statistics, StatsSnapshot};
use crate::state::CrawlCounters;
use std::time::Duration;

/// Summary returned by `Coordinator::crawl` and `Coordinator::restart`
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub stats: StatsSnapshot,
    pub counters: CrawlCounters,
    /// Set when the crawl stopped because a role ran out of workers
    pub abort_reason: Option<String>,
    /// True when a resource ceiling or an external request forced the shutdown
    pub forced: bool,
    pub elapsed: Duration,
}

impl CrawlReport {
    /// True when the crawl ran out of work on its own
    pub fn completed(&self) -> bool {
        !self.forced && self.abort_reason.is_none()
    }

    /// One-line summary for logs
    pub fn summary_line(&self) -> String {
        format!(
            "{} files saved, {} downloaded, {} links seen, {} filtered, {} failed in {:.1}s",
            self.stats.files_saved,
            format_bytes(self.stats.bytes_downloaded),
            self.stats.links_seen,
            self.stats.filtered,
            self.stats.failed,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Prints the report to stdout
pub fn print_report(report: &CrawlReport) {
    let outcome = match (&report.abort_reason, report.forced) {
        (Some(reason), _) => format!("aborted ({})", reason),
        (None, true) => "stopped early".to_string(),
        (None, false) => "completed".to_string(),
    };
    println!(
        "Crawl {} after {:.1}s\n",
        outcome,
        report.elapsed.as_secs_f64()
    );

    print_statistics(&report.stats);

    let c = &report.counters;
    println!();
    println!("Queues:");
    println!(
        "  Fetch queue: {} pushed / {} taken",
        c.crawl_pushes, c.fetch_gets
    );
    println!(
        "  Crawl queue: {} pushed / {} taken",
        c.fetch_pushes, c.crawl_gets
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_and_summary() {
        let report = CrawlReport {
            stats: StatsSnapshot {
                files_saved: 3,
                links_seen: 3,
                filtered: 1,
                ..StatsSnapshot::default()
            },
            counters: CrawlCounters::default(),
            abort_reason: None,
            forced: false,
            elapsed: Duration::from_millis(1500),
        };

        assert!(report.completed());
        let line = report.summary_line();
        assert!(line.starts_with("3 files saved"));
        assert!(line.contains("1 filtered"));

        let forced = CrawlReport {
            forced: true,
            ..report
        };
        assert!(!forced.completed());
    }
}
