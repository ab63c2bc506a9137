use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Loads and parses a configuration file from the given path
///
/// Every section is optional; missing keys fall back to their defaults.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parses and validates configuration from TOML text
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

/// Computes a SHA-256 hash of the configuration file content
///
/// Stored with every run so a resumed crawl can tell whether its settings changed.
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(hash_config_text(&content))
}

/// Hashes configuration text (hex-encoded SHA-256)
pub fn hash_config_text(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[crawler]
workers = 8
queue-size = 200

[network]
max-connections = 3
retries = 2

[pool]
thread-pool-size = 4
num-parts = 4

[limits]
max-files = 100
time-limit-secs = 60

[user-agent]
crawler-name = "TestCrawler"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[rules]
max-depth = 3
blacklist = ["*.ads.example.com"]

[priority]
extensions = { pdf = 2 }
servers = { "docs.example.com" = 3 }

[output]
project-dir = "./out"
database-path = "./test.db"
"#;

        let file = create_temp_config(config_content);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.crawler.workers, 8);
        assert_eq!(config.crawler.worker_split(), (6, 2));
        assert_eq!(config.network.max_connections, 3);
        assert_eq!(config.pool.num_parts, 4);
        assert_eq!(config.limits.max_files, 100);
        assert!(config.limits.any());
        assert_eq!(config.user_agent.crawler_name, "TestCrawler");
        assert_eq!(config.rules.max_depth, 3);
        assert_eq!(config.priority.extensions.get("pdf"), Some(&2));
        assert_eq!(config.output.project_dir, "./out");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file = create_temp_config("[crawler]\nworkers = 4\n");
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.crawler.workers, 4);
        assert_eq!(config.crawler.queue_size, 1000);
        assert_eq!(config.network.retries, 1);
        assert_eq!(config.pool.thread_pool_size, 10);
        assert!(!config.limits.any());
    }

    #[test]
    fn test_load_config_with_invalid_path() {
        let result = load_config(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_load_config_with_invalid_toml() {
        let file = create_temp_config("this is not valid TOML {{{");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_with_validation_error() {
        let file = create_temp_config("[network]\nmax-connections = 0\n");
        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_compute_config_hash() {
        let file = create_temp_config("test content");

        let hash1 = compute_config_hash(file.path()).unwrap();
        let hash2 = compute_config_hash(file.path()).unwrap();

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
        assert_ne!(hash1, hash_config_text("other content"));
    }
}
