//! Output module for crawl statistics and end-of-crawl reports

mod report;
pub mod stats;

pub use report::{print_report, CrawlReport};
pub use stats::{format_bytes, print_statistics, CrawlStats, FileStatus, StatsSnapshot};
