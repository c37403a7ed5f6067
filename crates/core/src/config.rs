//! Configuration management for dropline

use crate::batch::{CommitOptions, WriteMode, DEFAULT_POLL_INTERVAL};
use crate::client::{DropboxClient, Endpoints, DEFAULT_API_URL, DEFAULT_CONTENT_URL};
use crate::error::{Error, Result};
use crate::http::DEFAULT_MAX_CONNECTIONS_PER_HOST;
use crate::request::{ExhaustedRetryPolicy, RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use dirs::home_dir;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration directory name
const CONFIG_DIR: &str = "dropline";

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Environment variable overriding the configured token
pub const TOKEN_ENV: &str = "DROPLINE_TOKEN";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub auth: AuthConfig,
    pub endpoints: Option<EndpointsConfig>,
    pub retry: Option<RetryConfig>,
    pub http: Option<HttpConfig>,
    pub upload: Option<UploadConfig>,
    pub logging: Option<LoggingConfig>,
}

/// Where the access token comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    // OR a file holding the token on its first line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
}

/// API hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_content_url")]
    pub content_url: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            content_url: default_content_url(),
        }
    }
}

/// Retry behaviour of the request executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
    #[serde(default)]
    pub on_exhausted: ExhaustedRetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_statuses: default_retry_statuses(),
            on_exhausted: ExhaustedRetryPolicy::default(),
        }
    }
}

/// Connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections_per_host: usize,
    /// Request timeout in seconds, 0 disables it
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: default_max_connections(),
            timeout: default_timeout(),
        }
    }
}

/// Batch upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Seconds between batch job checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub autorename: bool,
    #[serde(default)]
    pub mute: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            mode: default_mode(),
            autorename: false,
            mute: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_content_url() -> String {
    DEFAULT_CONTENT_URL.to_string()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_statuses() -> Vec<u16> {
    vec![429]
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS_PER_HOST
}

fn default_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_mode() -> String {
    "add".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ConfigFile {
    pub fn endpoints(&self) -> Endpoints {
        let endpoints = self.endpoints.clone().unwrap_or_default();
        Endpoints {
            api_url: endpoints.api_url,
            content_url: endpoints.content_url,
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let retry = self.retry.clone().unwrap_or_default();
        let retry_statuses = retry
            .retry_statuses
            .iter()
            .map(|code| {
                StatusCode::from_u16(*code)
                    .map_err(|_| Error::InvalidConfig(format!("Invalid HTTP status: {}", code)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RetryPolicy {
            max_attempts: retry.max_attempts,
            retry_statuses,
            on_exhausted: retry.on_exhausted,
        })
    }

    pub fn commit_options(&self) -> Result<CommitOptions> {
        let upload = self.upload.clone().unwrap_or_default();
        Ok(CommitOptions {
            mode: upload.mode.parse::<WriteMode>()?,
            autorename: upload.autorename,
            mute: upload.mute,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = self
            .upload
            .as_ref()
            .map(|upload| upload.poll_interval)
            .unwrap_or_else(default_poll_interval);
        Duration::from_secs(secs)
    }

    pub fn http(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }

    pub fn log_level(&self) -> String {
        self.logging
            .as_ref()
            .map(|logging| logging.level.clone())
            .unwrap_or_else(default_log_level)
    }

    /// Build a client from this configuration and an already resolved token
    pub fn client(&self, token: String) -> Result<DropboxClient> {
        let http = self.http();
        let timeout = (http.timeout > 0).then(|| Duration::from_secs(http.timeout));

        DropboxClient::builder(token)
            .endpoints(self.endpoints())
            .retry_policy(self.retry_policy()?)
            .max_connections_per_host(http.max_connections_per_host)
            .timeout(timeout)
            .build()
    }
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let home = home_dir().ok_or_else(|| Error::Config("Cannot determine home directory".to_string()))?;
    Ok(home.join(".config").join(CONFIG_DIR))
}

/// Get the configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE))
}

/// Load configuration from the default location
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&get_config_path()?)
}

/// Load configuration from `path`
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Err(Error::ConfigNotFound(path.to_path_buf()));
    }

    let content = fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("Failed to read config file: {}", e))
    })?;

    let config: ConfigFile = toml::from_str(&content).map_err(|e| {
        Error::InvalidConfig(format!("Failed to parse config file: {}", e))
    })?;

    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &ConfigFile) -> Result<PathBuf> {
    let path = get_config_path()?;
    save_config_to(config, &path)?;
    Ok(path)
}

/// Save configuration to `path`, readable by the owner only
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
    }

    let content = toml::to_string_pretty(config).map_err(|e| {
        Error::InvalidConfig(format!("Failed to serialize config: {}", e))
    })?;

    fs::write(path, content).map_err(|e| {
        Error::Config(format!("Failed to write config file: {}", e))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ConfigFile) -> Result<()> {
    let has_token = config
        .auth
        .token
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    let has_token_file = config
        .auth
        .token_file
        .as_deref()
        .is_some_and(|f| !f.trim().is_empty());

    if !has_token && !has_token_file {
        return Err(Error::Config(
            "No token configured. Either auth.token or auth.token_file must be set".to_string(),
        ));
    }

    let endpoints = config.endpoints();
    for url in [&endpoints.api_url, &endpoints.content_url] {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(Error::InvalidInput(format!(
                "Endpoint must be an http(s) URL, got '{}'",
                url
            )));
        }
    }

    if let Some(retry) = &config.retry {
        if retry.max_attempts == 0 {
            return Err(Error::InvalidInput("retry.max_attempts must be at least 1".to_string()));
        }
    }
    config.retry_policy()?;

    if config.http().max_connections_per_host == 0 {
        return Err(Error::InvalidInput(
            "http.max_connections_per_host must be at least 1".to_string(),
        ));
    }

    config.commit_options()?;

    Ok(())
}

/// Check if configuration exists
pub fn config_exists() -> bool {
    get_config_path().map(|p| p.exists()).unwrap_or(false)
}

/// Read a token file, ignoring trailing whitespace
pub fn read_token_file(path: &Path) -> Result<String> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read token file {}: {}", path.display(), e))
    })?;
    let token = content.lines().next().unwrap_or_default().trim_end().to_string();
    if token.is_empty() {
        return Err(Error::Config(format!("Token file {} is empty", path.display())));
    }
    Ok(token)
}

/// Resolve the access token.
///
/// Precedence: explicit token file, `DROPLINE_TOKEN`, `auth.token`,
/// `auth.token_file`.
pub fn resolve_token(config: &ConfigFile, token_file: Option<&Path>) -> Result<String> {
    if let Some(path) = token_file {
        return read_token_file(path);
    }
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    if let Some(token) = config.auth.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return Ok(token.trim().to_string());
    }
    if let Some(file) = config.auth.token_file.as_deref() {
        return read_token_file(&expand_home(file));
    }
    Err(Error::Config(format!(
        "No token available: pass --token-file, set {} or run 'dropline init'",
        TOKEN_ENV
    )))
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
