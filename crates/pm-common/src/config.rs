use serde::Deserialize;

/// Top-level server configuration.
/// Loaded from environment variables (prefix `PM`, `__` separator).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Database settings
    pub database: DatabaseConfig,
    /// Release intake settings
    #[serde(default)]
    pub releases: ReleaseConfig,
    /// Reverse-proxy trust settings for client IP resolution
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP API port (default: 8080)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Log level (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Externally reachable base URL, used in manifest download URLs.
    /// Falls back to a relative path when unset.
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g. `sqlite://printmaster.db`)
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseConfig {
    /// Upstream release feed, `owner/repo` form.
    #[serde(default = "default_release_repo")]
    pub repo: String,
    /// Poll period in seconds (default: 4 hours).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Newest releases kept per component; 0 disables pruning.
    #[serde(default = "default_max_releases")]
    pub max_releases: u32,
    /// Local artifact cache directory.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            repo: default_release_repo(),
            poll_interval_secs: default_poll_interval(),
            max_releases: default_max_releases(),
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// CIDR blocks whose forwarded headers are trusted.
    #[serde(default)]
    pub trusted_cidrs: Vec<String>,
    /// Also trust the published Cloudflare ranges.
    #[serde(default)]
    pub trust_cloudflare: bool,
}

impl AppConfig {
    /// Load config from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_release_repo() -> String {
    "printmaster/printmaster".to_string()
}
fn default_poll_interval() -> u64 {
    4 * 3600
}
fn default_max_releases() -> u32 {
    5
}
fn default_cache_dir() -> String {
    "./release-cache".to_string()
}

/// Agent-side configuration.
/// Loaded from environment variables (prefix `PM_AGENT`, `__` separator).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the server's control channel.
    pub server_url: String,
    /// Bearer token for the control channel.
    pub token: String,
    /// State directory; platform data dir when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Update channel to follow.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Floor for the disk-space pre-flight, in megabytes.
    #[serde(default = "default_min_disk_space_mb")]
    pub min_disk_space_mb: u64,
    /// Download retry attempts per run.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Policy override mode: `never`, `local`, or `inherit`.
    #[serde(default = "default_override_mode")]
    pub policy_override: String,
    /// Pinned Ed25519 manifest verification key (base64). Manifest
    /// signature checks are skipped when unset.
    #[serde(default)]
    pub manifest_public_key: Option<String>,
    /// Service unit name when supervised (e.g. `printmaster-agent`).
    #[serde(default)]
    pub service_name: Option<String>,
}

impl AgentConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PM_AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

fn default_channel() -> String {
    "stable".to_string()
}
fn default_min_disk_space_mb() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    5
}
fn default_override_mode() -> String {
    "inherit".to_string()
}
