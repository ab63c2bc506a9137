use crate::config::types::{
    Config, CrawlerConfig, NetworkConfig, OutputConfig, PoolConfig, RulesConfig, UserAgentConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_network_config(&config.network)?;
    validate_pool_config(&config.pool)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_rules_config(&config.rules)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates worker and queue configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    // Each role needs at least one live worker or the crawl aborts immediately
    if !config.single_threaded && config.workers < 2 {
        return Err(ConfigError::Validation(format!(
            "workers must be >= 2 unless single-threaded is set, got {}",
            config.workers
        )));
    }

    if config.queue_size < 1 {
        return Err(ConfigError::Validation(
            "queue-size must be >= 1".to_string(),
        ));
    }

    if config.queue_timeout_ms < 10 {
        return Err(ConfigError::Validation(format!(
            "queue-timeout-ms must be >= 10ms, got {}ms",
            config.queue_timeout_ms
        )));
    }

    Ok(())
}

/// Validates connection and retry configuration
fn validate_network_config(config: &NetworkConfig) -> Result<(), ConfigError> {
    if config.max_connections < 1 {
        return Err(ConfigError::Validation(
            "max-connections must be >= 1".to_string(),
        ));
    }

    if config.socket_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "socket-timeout-secs must be >= 1".to_string(),
        ));
    }

    if config.retry_delay_max_ms < config.retry_delay_ms {
        return Err(ConfigError::Validation(format!(
            "retry-delay-max-ms ({}) must not be smaller than retry-delay-ms ({})",
            config.retry_delay_max_ms, config.retry_delay_ms
        )));
    }

    if config.socket_error_threshold < 1 || config.bad_request_threshold < 1 {
        return Err(ConfigError::Validation(
            "error thresholds must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates download pool configuration
fn validate_pool_config(config: &PoolConfig) -> Result<(), ConfigError> {
    if config.thread_pool_size < 1 {
        return Err(ConfigError::Validation(
            "thread-pool-size must be >= 1".to_string(),
        ));
    }

    if config.num_parts < 1 || config.num_parts > 32 {
        return Err(ConfigError::Validation(format!(
            "num-parts must be between 1 and 32, got {}",
            config.num_parts
        )));
    }

    if config.transfer_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "transfer-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Validate crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates filtering rules
fn validate_rules_config(config: &RulesConfig) -> Result<(), ConfigError> {
    for pattern in &config.blacklist {
        validate_domain_pattern(pattern)?;
    }

    for ext in &config.skip_extensions {
        if ext.is_empty() || ext.starts_with('.') {
            return Err(ConfigError::Validation(format!(
                "skip-extensions entries must be bare extensions like 'pdf', got '{}'",
                ext
            )));
        }
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.save_files && config.project_dir.is_empty() {
        return Err(ConfigError::Validation(
            "project-dir cannot be empty when save-files is enabled".to_string(),
        ));
    }

    Ok(())
}

/// Validates a domain pattern (supports wildcards)
fn validate_domain_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Domain pattern cannot be empty".to_string(),
        ));
    }

    let domain = pattern.strip_prefix("*.").unwrap_or(pattern);

    if domain.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Domain cannot be empty".to_string(),
        ));
    }

    if !domain
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' contains invalid characters",
            domain
        )));
    }

    if domain.starts_with('.')
        || domain.ends_with('.')
        || domain.starts_with('-')
        || domain.ends_with('-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' cannot start or end with '.' or '-'",
            domain
        )));
    }

    if domain.contains("..") {
        return Err(ConfigError::InvalidPattern(format!(
            "Domain '{}' cannot contain consecutive dots",
            domain
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') || !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    Ok(())
}
