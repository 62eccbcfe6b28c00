use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Tenant key used when a request does not name one
pub const DEFAULT_TENANT_KEY: &str = "default";

/// Main configuration structure for the relay
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tenant used when a request names none
    #[serde(default = "default_tenant_key")]
    pub default_tenant: String,
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Reference cache limits
    #[serde(default)]
    pub references: ReferenceCacheConfig,
    /// Upstream bot profiles keyed by tenant (doctor) identifier
    #[serde(default)]
    pub tenants: BTreeMap<String, TenantConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant_key(),
            server: ServerConfig::default(),
            references: ReferenceCacheConfig::default(),
            tenants: BTreeMap::new(),
        }
    }
}

fn default_tenant_key() -> String {
    DEFAULT_TENANT_KEY.to_string()
}

impl Config {
    /// Load and parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Find a config file in the default locations
    ///
    /// Returns the parsed config together with the path it came from, or
    /// the defaults and `None` when no file exists.
    pub fn discover() -> Result<(Self, Option<PathBuf>)> {
        let default_paths = [
            dirs::home_dir().map(|h| h.join(".medrelay").join("config.toml")),
            dirs::config_dir().map(|c| c.join("medrelay").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Ok((Self::load(path)?, Some(path.clone())));
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok((Self::default(), None))
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Idle time before a liveness frame is written to a stream
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Timeout for non-streaming routes in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            cors_origins: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Bounds for the per-conversation reference cache
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceCacheConfig {
    /// Maximum number of conversations kept; least recently used go first
    #[serde(default = "default_reference_max_entries")]
    pub max_entries: usize,
    /// Seconds an entry stays readable after it was written
    #[serde(default = "default_reference_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for ReferenceCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_reference_max_entries(),
            ttl_secs: default_reference_ttl_secs(),
        }
    }
}

fn default_reference_max_entries() -> usize {
    1000
}

fn default_reference_ttl_secs() -> u64 {
    3600
}

/// One upstream bot profile
#[derive(Debug, Clone, Deserialize)]
pub struct TenantConfig {
    /// Literal API token
    #[serde(default)]
    pub api_token: Option<String>,
    /// Environment variable holding the API token (wins over `api_token`)
    #[serde(default)]
    pub api_token_env: Option<String>,
    /// Provider base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bot identifier on the provider side
    #[serde(default)]
    pub bot_id: String,
    /// User id sent upstream when the request carries none
    #[serde(default = "default_user_id")]
    pub default_user_id: String,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts allowed when opening the upstream stream
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Display name for tenant listings
    #[serde(default)]
    pub name: Option<String>,
    /// Display specialty for tenant listings
    #[serde(default)]
    pub specialty: Option<String>,
    /// Display description for tenant listings
    #[serde(default)]
    pub description: Option<String>,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            api_token_env: None,
            base_url: default_base_url(),
            bot_id: String::new(),
            default_user_id: default_user_id(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            name: None,
            specialty: None,
            description: None,
        }
    }
}

impl TenantConfig {
    /// Look up the API token, reading the environment when configured to
    pub fn resolve_credential(&self) -> Result<String> {
        if let Some(ref var) = self.api_token_env {
            return match std::env::var(var) {
                Ok(token) if !token.trim().is_empty() => Ok(token),
                _ => Err(RelayError::Config(format!(
                    "API token env var '{var}' not set"
                ))),
            };
        }

        match self.api_token {
            Some(ref token) if !token.trim().is_empty() => Ok(token.clone()),
            _ => Err(RelayError::Config("API token is missing".to_string())),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_base_url() -> String {
    "https://api.coze.cn".to_string()
}

fn default_user_id() -> String {
    "default_user".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}
