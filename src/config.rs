//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::Role;
use crate::websocket::{HubConfig, OriginPolicy, PumpConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub websocket: WebSocketConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hub and connection tuning
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Exact origins allowed to open a socket (empty = development defaults)
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Also admit any localhost / 127.0.0.1 origin
    #[serde(default = "default_allow_localhost")]
    pub allow_localhost: bool,

    #[serde(default = "default_queue_capacity")]
    pub broadcast_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_allow_localhost() -> bool {
    true
}

fn default_queue_capacity() -> usize {
    256
}

fn default_heartbeat() -> u64 {
    54
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_metrics_interval() -> u64 {
    5
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_localhost: default_allow_localhost(),
            broadcast_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            heartbeat_secs: default_heartbeat(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            metrics_interval_secs: default_metrics_interval(),
        }
    }
}

impl WebSocketConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
        }
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            read_timeout: Duration::from_secs(self.read_timeout_secs.max(1)),
            write_timeout: Duration::from_secs(self.write_timeout_secs.max(1)),
        }
    }

    pub fn origin_policy(&self) -> OriginPolicy {
        OriginPolicy::new(&self.allowed_origins, self.allow_localhost)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

/// Static bearer tokens accepted by the built-in identity resolver
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One accepted token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

fn default_role() -> Role {
    Role::User
}

/// Metrics store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// SQLite database with the platform `sessions` table
    pub database_path: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load from default locations or environment
    ///
    /// Returns the file that was used, if any. A default-location file that
    /// exists but cannot be read or parsed is an error, not a silent
    /// fallback to defaults.
    pub fn load_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("streamhub").join("config.toml")),
            Some(PathBuf::from("/etc/streamhub/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths)
    }

    /// Load the first existing file in `paths`, else environment only
    pub fn load_first(paths: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match paths.iter().find(|path| path.exists()) {
            Some(path) => Ok((Self::load_with_env(path)?, Some(path.clone()))),
            None => Ok((Self::from_env(), None)),
        }
    }

    /// Apply environment variable overrides using `lookup` to read them
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server overrides
        if let Some(host) = lookup("STREAMHUB_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("STREAMHUB_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        // WebSocket overrides (same variable as the platform's CORS middleware)
        if let Some(origins) = lookup("CORS_ALLOWED_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                self.websocket.allowed_origins = origins;
            }
        }
        if let Some(allow) = lookup("STREAMHUB_ALLOW_LOCALHOST") {
            self.websocket.allow_localhost = allow.to_lowercase() != "false" && allow != "0";
        }

        // Store overrides
        if let Some(path) = lookup("STREAMHUB_DATABASE") {
            self.store.database_path = Some(path);
        }

        // Logging overrides
        if let Some(level) = lookup("STREAMHUB_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("STREAMHUB_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# StreamHub Configuration
#
# Environment variables override these settings:
# - STREAMHUB_HOST
# - STREAMHUB_PORT
# - CORS_ALLOWED_ORIGINS (comma-separated)
# - STREAMHUB_ALLOW_LOCALHOST
# - STREAMHUB_DATABASE
# - STREAMHUB_LOG_LEVEL
# - STREAMHUB_LOG_FORMAT

[server]
host = "0.0.0.0"
port = 8080

[websocket]
# Origins allowed to open a WebSocket. Empty means
# http://localhost:3000 and http://localhost:8000.
allowed_origins = []

# Admit any localhost / 127.0.0.1 origin (development)
allow_localhost = true

# Hub broadcast queue and per-connection outbound queue sizes
broadcast_capacity = 256
outbound_capacity = 256

# Ping every heartbeat_secs; drop peers that send no pong for read_timeout_secs
heartbeat_secs = 54
read_timeout_secs = 60
write_timeout_secs = 10

# Metrics stream refresh (seconds)
metrics_interval_secs = 5

# Bearer tokens accepted on upgrade requests (Authorization header or ?token=)
# [[auth.tokens]]
# token = "change-me"
# user_id = "admin"
# role = "admin"   # admin, operator or user

[store]
# SQLite database holding the platform's sessions table
# database_path = "/var/lib/streamhub/platform.db"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
