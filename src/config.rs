use std::time::Duration;
use thiserror::Error;

/// Hosts whose images may be proxied. A request host matches an entry when it
/// is equal to it or is a subdomain of it.
pub const DEFAULT_ALLOWED_HOSTS: &[&str] = &[
    "notion.so",
    "notion-static.com",
    "prod-files-secure.s3.us-west-2.amazonaws.com",
    "s3.us-west-2.amazonaws.com",
];

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub allowed_hosts: Vec<String>,
    pub max_input_size: usize, // bytes
    /// Upper bound on a single fetch attempt, not on the whole retry sequence.
    pub attempt_timeout: Duration,
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    pub max_cache_bytes: u64,
    pub max_dimension: u32,
    pub admin_token: Option<String>,
    pub rate_limit: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: DEFAULT_ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect(),
            max_input_size: 20 * 1024 * 1024,
            attempt_timeout: Duration::from_secs(12),
            cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_cache_entries: 2000,
            max_cache_bytes: 512 * 1024 * 1024,
            max_dimension: 4096,
            admin_token: None,
            rate_limit: false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Allowed host list cannot be empty")] EmptyAllowlist,
    #[error("Max input size must be > 0")] InvalidMaxInput,
    #[error("Attempt timeout must be > 0")] InvalidTimeout,
    #[error("Cache capacity must be > 0")] InvalidCapacity,
    #[error("Max dimension must be > 0")] InvalidMaxDimension,
    #[error("Admin token cannot be empty")] EmptyAdminToken,
    #[error("Invalid value for {name}: {value}")] InvalidVar { name: &'static str, value: String },
}

impl ProxyConfig {
    /// Builds a config from `IMAGE_PROXY_*` environment variables, falling back
    /// to [`ProxyConfig::default`] for anything unset. Rate limiting is on
    /// unless `DISABLE_RATE_LIMIT` is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let allowed_hosts = match std::env::var("IMAGE_PROXY_ALLOWED_HOSTS") {
            Ok(list) => list
                .split(',')
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            Err(_) => defaults.allowed_hosts,
        };

        let cfg = Self {
            allowed_hosts,
            max_input_size: env_parse("IMAGE_PROXY_MAX_INPUT_BYTES", defaults.max_input_size)?,
            attempt_timeout: Duration::from_secs(env_parse(
                "IMAGE_PROXY_ATTEMPT_TIMEOUT_SECS",
                defaults.attempt_timeout.as_secs(),
            )?),
            cache_ttl: Duration::from_secs(env_parse(
                "IMAGE_PROXY_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )?),
            max_cache_entries: env_parse("IMAGE_PROXY_MAX_CACHE_ENTRIES", defaults.max_cache_entries)?,
            max_cache_bytes: env_parse("IMAGE_PROXY_MAX_CACHE_BYTES", defaults.max_cache_bytes)?,
            max_dimension: env_parse("IMAGE_PROXY_MAX_DIMENSION", defaults.max_dimension)?,
            admin_token: std::env::var("IMAGE_PROXY_ADMIN_TOKEN").ok(),
            rate_limit: std::env::var("DISABLE_RATE_LIMIT").is_err(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_hosts.is_empty() { return Err(ConfigError::EmptyAllowlist); }
        if self.max_input_size == 0 { return Err(ConfigError::InvalidMaxInput); }
        if self.attempt_timeout.is_zero() { return Err(ConfigError::InvalidTimeout); }
        if self.max_cache_entries == 0 || self.max_cache_bytes == 0 { return Err(ConfigError::InvalidCapacity); }
        if self.max_dimension == 0 { return Err(ConfigError::InvalidMaxDimension); }
        if let Some(token) = &self.admin_token {
            if token.trim().is_empty() { return Err(ConfigError::EmptyAdminToken); }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { name, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ProxyConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_allowlist() {
        let cfg = ProxyConfig { allowed_hosts: Vec::new(), ..ProxyConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyAllowlist)));
    }

    #[test]
    fn rejects_blank_admin_token() {
        let cfg = ProxyConfig { admin_token: Some("  ".into()), ..ProxyConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyAdminToken)));
    }

    #[test]
    fn rejects_zero_timeout() {
        let cfg = ProxyConfig { attempt_timeout: Duration::ZERO, ..ProxyConfig::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidTimeout)));
    }
}
