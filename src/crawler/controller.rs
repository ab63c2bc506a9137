//! Resource ceiling watchdog
//!
//! Wakes every `controller-interval-ms` and compares the crawl against the configured
//! time, file and byte ceilings. The first breach forces the crawl to end.

use crate::config::LimitsConfig;
use crate::crawler::context::CrawlContext;
use crate::output::StatsSnapshot;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// A ceiling that was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    TimeLimit(Duration),
    MaxFiles(u64),
    MaxBytes(u64),
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeLimit(limit) => write!(f, "time limit of {}s reached", limit.as_secs()),
            Self::MaxFiles(n) => write!(f, "file limit of {} reached", n),
            Self::MaxBytes(n) => write!(f, "byte limit of {} reached", n),
        }
    }
}

/// Returns the first ceiling the crawl has reached; zero limits are ignored
pub fn breach(limits: &LimitsConfig, stats: &StatsSnapshot, elapsed: Duration) -> Option<Breach> {
    let time_limit = Duration::from_secs(limits.time_limit_secs);
    if limits.time_limit_secs > 0 && elapsed >= time_limit {
        return Some(Breach::TimeLimit(time_limit));
    }
    if limits.max_files > 0 && stats.files_saved >= limits.max_files {
        return Some(Breach::MaxFiles(limits.max_files));
    }
    if limits.max_bytes > 0 && stats.bytes_downloaded >= limits.max_bytes {
        return Some(Breach::MaxBytes(limits.max_bytes));
    }
    None
}

/// Handle to the running watchdog task
pub struct CrawlController {
    stop: Arc<Notify>,
    handle: JoinHandle<Option<Breach>>,
}

impl CrawlController {
    /// Starts watching; `started` is when the crawl began
    pub fn spawn(ctx: Arc<CrawlContext>, started: Instant) -> Self {
        let stop = Arc::new(Notify::new());
        let interval = Duration::from_millis(ctx.config.limits.controller_interval_ms.max(1));
        let handle = tokio::spawn(watch(ctx, started, interval, stop.clone()));
        Self { stop, handle }
    }

    /// Ends the watchdog and returns the breach it acted on, if any
    pub async fn stop(self) -> Option<Breach> {
        self.stop.notify_one();
        match self.handle.await {
            Ok(breach) => breach,
            Err(e) => {
                tracing::error!("Controller task failed: {}", e);
                None
            }
        }
    }
}

async fn watch(
    ctx: Arc<CrawlContext>,
    started: Instant,
    interval: Duration,
    stop: Arc<Notify>,
) -> Option<Breach> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.notified() => return None,
            _ = ticker.tick() => {}
        }

        let stats = ctx.stats.snapshot();
        if let Some(found) = breach(&ctx.config.limits, &stats, started.elapsed()) {
            tracing::info!("Stopping crawl: {}", found);
            ctx.end_loop(true);
            return Some(found);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::crawler::context::testing;
    use crate::output::FileStatus;

    fn limits(max_files: u64, max_bytes: u64, time_limit_secs: u64) -> LimitsConfig {
        LimitsConfig {
            max_files,
            max_bytes,
            time_limit_secs,
            controller_interval_ms: 10,
        }
    }

    #[test]
    fn test_zero_limits_never_breach() {
        let stats = StatsSnapshot {
            files_saved: 1_000,
            bytes_downloaded: 1 << 30,
            ..StatsSnapshot::default()
        };
        assert_eq!(
            breach(&limits(0, 0, 0), &stats, Duration::from_secs(86_400)),
            None
        );
    }

    #[test]
    fn test_each_ceiling() {
        let stats = StatsSnapshot {
            files_saved: 5,
            bytes_downloaded: 2048,
            ..StatsSnapshot::default()
        };
        assert_eq!(
            breach(&limits(5, 0, 0), &stats, Duration::ZERO),
            Some(Breach::MaxFiles(5))
        );
        assert_eq!(breach(&limits(6, 0, 0), &stats, Duration::ZERO), None);
        assert_eq!(
            breach(&limits(0, 2048, 0), &stats, Duration::ZERO),
            Some(Breach::MaxBytes(2048))
        );
        assert_eq!(
            breach(&limits(0, 0, 3), &stats, Duration::from_secs(3)),
            Some(Breach::TimeLimit(Duration::from_secs(3)))
        );
    }

    #[tokio::test]
    async fn test_breach_forces_end() {
        let mut config = Config::default();
        config.limits = limits(1, 0, 0);
        let ctx = testing::context(config);

        let controller = CrawlController::spawn(ctx.clone(), Instant::now());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!ctx.exit_requested());

        ctx.stats.update_file_stats(FileStatus::Saved);
        tokio::time::timeout(Duration::from_secs(2), ctx.woken())
            .await
            .unwrap();

        assert!(ctx.is_forced());
        assert!(ctx.gate.writes_blocked());
        assert_eq!(controller.stop().await, Some(Breach::MaxFiles(1)));
    }

    #[tokio::test]
    async fn test_stop_without_breach() {
        let mut config = Config::default();
        config.limits = limits(0, 0, 3600);
        let ctx = testing::context(config);

        let controller = CrawlController::spawn(ctx.clone(), Instant::now());
        assert_eq!(controller.stop().await, None);
        assert!(!ctx.exit_requested());
    }
}
