//! Plateful gateway configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub auth: AuthConfig,
    pub gateway: GatewayConfig,
    pub tracker: TrackerConfig,

    /// Handler id to physical invocation address, e.g.
    /// `users = "http://users-service:8081/invoke"`.
    pub handlers: HashMap<String, String>,

    /// Enable development mode (error details in responses)
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            auth: AuthConfig::default(),
            gateway: GatewayConfig::default(),
            tracker: TrackerConfig::default(),
            handlers: HashMap::new(),
            dev_mode: false,
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub port: u16,
    pub host: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Expected token issuer, e.g. the identity provider pool URL
    pub issuer: String,
    /// Client identifier checked against the kind-appropriate claim
    pub client_id: String,
    /// JWKS endpoint; derived from the issuer when empty
    pub jwks_url: String,
    /// Public key cache lifetime
    pub jwks_cache_ttl_secs: u64,
    /// Upper bound on key-discovery requests per minute
    pub jwks_max_requests_per_minute: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            client_id: String::new(),
            jwks_url: String::new(),
            jwks_cache_ttl_secs: 600,
            jwks_max_requests_per_minute: 10,
        }
    }
}

impl AuthConfig {
    /// The JWKS endpoint to use: explicit when configured, otherwise the
    /// issuer's well-known location.
    pub fn effective_jwks_url(&self) -> String {
        if self.jwks_url.is_empty() {
            format!("{}/.well-known/jwks.json", self.issuer.trim_end_matches('/'))
        } else {
            self.jwks_url.clone()
        }
    }
}

/// Gateway pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub service_name: String,
    /// Deployment-stage path prefix stripped before route matching, e.g. "/prod"
    pub stage_prefix: String,
    /// Downstream invocation timeout in milliseconds
    pub downstream_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_name: "pf-gateway".to_string(),
            stage_prefix: String::new(),
            downstream_timeout_ms: 30000,
        }
    }
}

/// Activity tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    /// Table holding user profiles (conditional last-seen writes)
    pub users_table: String,
    /// Table holding hourly activity buckets
    pub activity_table: String,
    /// Minimum interval between last-seen writes per user
    pub last_seen_interval_secs: u64,
    /// Fixed UTC offset (hours) of the target timezone for bucket keys
    pub timezone_offset_hours: i32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            users_table: String::new(),
            activity_table: String::new(),
            last_seen_interval_secs: 300,
            timezone_offset_hours: -5,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Validate settings the gateway cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.issuer.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.issuer must be set (identity provider URL)".to_string(),
            ));
        }
        if self.auth.client_id.is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.client_id must be set".to_string(),
            ));
        }
        if !(-14..=14).contains(&self.tracker.timezone_offset_hours) {
            return Err(ConfigError::ValidationError(format!(
                "tracker.timezone_offset_hours out of range: {}",
                self.tracker.timezone_offset_hours
            )));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Plateful Gateway Configuration
# Environment variables (PLATEFUL_*) override these settings

dev_mode = false

[http]
port = 8080
host = "0.0.0.0"

[auth]
issuer = "https://idp.example.com/pool-1"
client_id = ""
jwks_url = ""  # derived from issuer when empty
jwks_cache_ttl_secs = 600
jwks_max_requests_per_minute = 10

[gateway]
service_name = "pf-gateway"
stage_prefix = ""  # e.g. "/prod"
downstream_timeout_ms = 30000

[tracker]
enabled = true
users_table = ""
activity_table = ""
last_seen_interval_secs = 300
timezone_offset_hours = -5

[handlers]
# users = "http://users-service:8081/invoke"
# posts = "http://posts-service:8082/invoke"
"#
        .to_string()
    }
}
