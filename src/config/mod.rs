//! Configuration module for Ripple-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use ripple_harvest::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("harvest.toml")).unwrap();
//! println!("Crawler will use {} workers", config.crawler.workers);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, LimitsConfig, NetworkConfig, OutputConfig, PoolConfig, PriorityConfig,
    RulesConfig, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{
    compute_config_hash, hash_config_text, load_config, load_config_with_hash, parse_config,
};
pub use validation::validate;
