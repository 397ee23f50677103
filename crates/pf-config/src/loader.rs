//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "gateway.toml",
    "plateful.toml",
    "./config/config.toml",
    "/etc/plateful/config.toml",
];

/// Prefix for handler address overrides: `PLATEFUL_HANDLER_USERS=http://...`
const HANDLER_ENV_PREFIX: &str = "PLATEFUL_HANDLER_";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("PLATEFUL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&self, config: &mut AppConfig) {
        // HTTP
        if let Ok(val) = env::var("PLATEFUL_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("PLATEFUL_HTTP_HOST") {
            config.http.host = val;
        }

        // Identity provider
        if let Ok(val) = env::var("PLATEFUL_AUTH_ISSUER") {
            config.auth.issuer = val;
        }
        if let Ok(val) = env::var("PLATEFUL_AUTH_CLIENT_ID") {
            config.auth.client_id = val;
        }
        if let Ok(val) = env::var("PLATEFUL_AUTH_JWKS_URL") {
            config.auth.jwks_url = val;
        }
        if let Ok(val) = env::var("PLATEFUL_AUTH_JWKS_TTL_SECS") {
            if let Ok(ttl) = val.parse() {
                config.auth.jwks_cache_ttl_secs = ttl;
            }
        }
        if let Ok(val) = env::var("PLATEFUL_AUTH_JWKS_RPM") {
            if let Ok(rpm) = val.parse() {
                config.auth.jwks_max_requests_per_minute = rpm;
            }
        }

        // Gateway
        if let Ok(val) = env::var("PLATEFUL_STAGE_PREFIX") {
            config.gateway.stage_prefix = val;
        }
        if let Ok(val) = env::var("PLATEFUL_DOWNSTREAM_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                config.gateway.downstream_timeout_ms = timeout;
            }
        }

        // Tracker
        if let Ok(val) = env::var("PLATEFUL_TRACKER_ENABLED") {
            config.tracker.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var("PLATEFUL_TRACKER_USERS_TABLE") {
            config.tracker.users_table = val;
        }
        if let Ok(val) = env::var("PLATEFUL_TRACKER_ACTIVITY_TABLE") {
            config.tracker.activity_table = val;
        }
        if let Ok(val) = env::var("PLATEFUL_TRACKER_LAST_SEEN_INTERVAL_SECS") {
            if let Ok(interval) = val.parse() {
                config.tracker.last_seen_interval_secs = interval;
            }
        }
        if let Ok(val) = env::var("PLATEFUL_TRACKER_TZ_OFFSET_HOURS") {
            if let Ok(offset) = val.parse() {
                config.tracker.timezone_offset_hours = offset;
            }
        }

        // Handler addresses: PLATEFUL_HANDLER_<ID>=<address>
        for (key, value) in env::vars() {
            if let Some(id) = key.strip_prefix(HANDLER_ENV_PREFIX) {
                if !id.is_empty() && !value.is_empty() {
                    config.handlers.insert(id.to_ascii_lowercase(), value);
                }
            }
        }

        // General
        if let Ok(val) = env::var("PLATEFUL_DEV_MODE") {
            config.dev_mode = val.parse().unwrap_or(false);
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
