//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `WorkerState` / `Role` / `WorkerId`: what each worker last reported
//! - `CrawlState`: termination and health tracking across all workers
//! - `CrawlCounters`: the per-role push/get accounting behind end-of-crawl detection

mod crawl_state;
mod worker_state;

// Re-export main types
pub use crawl_state::{CrawlCounters, CrawlState, SUSPEND_WINDOW, THREAD_REDUCTION_REASON};
pub use worker_state::{Role, WorkerId, WorkerState};
