//! Configuration management for the asset gateway

use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Origin for image requests
    #[serde(default)]
    pub images: StorageConfig,

    /// Origin for css/js/font and other passthrough assets
    #[serde(default)]
    pub assets: StorageConfig,

    #[serde(default)]
    pub not_found: NotFoundConfig,

    #[serde(default)]
    pub caching: CachingConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub multi_domain: MultiDomainConfig,

    #[serde(default)]
    pub geolocation: GeolocationConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and response settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Value of the Cache-Control response header
    #[serde(default = "default_cache_control")]
    pub cache_control: String,

    /// Gzip text responses when the client accepts it (default: true)
    #[serde(default = "default_true")]
    pub gzip: bool,
}

/// Origin storage block for one asset family
///
/// Resolution order is fixed: directory, then remote, then s3.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default)]
    pub directory: DirectoryOrigin,

    #[serde(default)]
    pub remote: RemoteOrigin,

    #[serde(default)]
    pub s3: S3Origin,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DirectoryOrigin {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RemoteOrigin {
    #[serde(default)]
    pub enabled: bool,

    /// Base URL that request paths are joined onto
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct S3Origin {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub access_key: Option<String>,

    #[serde(default)]
    pub secret_key: Option<String>,

    #[serde(default)]
    pub bucket_name: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible services
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Extra buckets a request may name with `s3/<bucket>/<key>`
    #[serde(default)]
    pub allowed_buckets: Vec<String>,
}

impl S3Origin {
    /// Whether a request may read from `bucket`
    pub fn allows_bucket(&self, bucket: &str) -> bool {
        bucket == self.bucket_name || self.allowed_buckets.iter().any(|b| b == bucket)
    }
}

impl StorageConfig {
    /// Number of enabled origins in this block
    pub fn enabled_count(&self) -> usize {
        [self.directory.enabled, self.remote.enabled, self.s3.enabled]
            .iter()
            .filter(|enabled| **enabled)
            .count()
    }
}

/// Fallback served when an origin reports a missing asset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotFoundConfig {
    #[serde(default = "default_not_found_status")]
    pub status_code: u16,

    #[serde(default)]
    pub images: NotFoundImages,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NotFoundImages {
    /// Local path of the fallback image
    #[serde(default)]
    pub path: Option<String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachingConfig {
    /// Global TTL in seconds (default: 3600)
    #[serde(default = "default_cache_ttl")]
    pub ttl: u64,

    /// Whether not-found responses (including the fallback image) are cached
    #[serde(default)]
    pub cache_404: bool,

    #[serde(default)]
    pub directory: CacheDirectory,

    #[serde(default)]
    pub memory: CacheMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheDirectory {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cache_dir")]
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheMemory {
    #[serde(default)]
    pub enabled: bool,
}

impl CachingConfig {
    /// Whether any cache backend is configured
    pub fn is_enabled(&self) -> bool {
        self.directory.enabled || self.memory.enabled
    }
}

/// Upper bounds applied to requested dimensions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityConfig {
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default = "default_max_height")]
    pub max_height: u32,
}

/// Recipe and route directories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    #[serde(default = "default_recipes_dir")]
    pub recipes: String,

    #[serde(default = "default_routes_dir")]
    pub routes: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MultiDomainConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Known domains keyed by host name (without port)
    #[serde(default)]
    pub domains: HashMap<String, DomainConfig>,
}

/// Per-domain overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainConfig {
    /// Overrides `caching.ttl` for this domain
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GeolocationMethod {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeolocationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub method: GeolocationMethod,

    /// CSV database of `start_ip,end_ip,country` rows
    #[serde(default)]
    pub database_path: Option<String>,

    /// Lookup URL, `{ip}` and `{key}` are substituted
    #[serde(default)]
    pub remote_url: Option<String>,

    #[serde(default)]
    pub remote_key: Option<String>,

    /// Slash-separated path to the country code in the remote JSON response
    #[serde(default = "default_country_path")]
    pub country_path: String,

    /// TTL for memoized per-client lookups, in seconds
    #[serde(default = "default_lookup_ttl")]
    pub cache_ttl: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Lookup URL, `{ip}` is substituted
    #[serde(default)]
    pub url: Option<String>,

    /// Slash-separated path to the network type in the JSON response
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformConfig {
    /// Maximum number of codec jobs running at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Upper bound on origin fetch plus transform, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bearer token required on /api calls when set
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8001
}

fn default_cache_control() -> String {
    "public, max-age=3600".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_not_found_status() -> u16 {
    404
}

fn default_cache_ttl() -> u64 {
    3600 // 1 hour
}

fn default_cache_dir() -> String {
    "./cache".to_string()
}

fn default_max_width() -> u32 {
    2048
}

fn default_max_height() -> u32 {
    1024
}

fn default_recipes_dir() -> String {
    "./workspace/recipes".to_string()
}

fn default_routes_dir() -> String {
    "./workspace/routes".to_string()
}

fn default_country_path() -> String {
    "country/iso_code".to_string()
}

fn default_lookup_ttl() -> u64 {
    3600
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cache_control: default_cache_control(),
            gzip: default_true(),
        }
    }
}

impl Default for NotFoundConfig {
    fn default() -> Self {
        Self {
            status_code: default_not_found_status(),
            images: NotFoundImages::default(),
        }
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            cache_404: false,
            directory: CacheDirectory::default(),
            memory: CacheMemory::default(),
        }
    }
}

impl Default for CacheDirectory {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_cache_dir(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            recipes: default_recipes_dir(),
            routes: default_routes_dir(),
        }
    }
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: GeolocationMethod::default(),
            database_path: None,
            remote_url: None,
            remote_key: None,
            country_path: default_country_path(),
            cache_ttl: default_lookup_ttl(),
        }
    }
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            auth_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl GateConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(GateConfig)` if loading and validation succeed
    /// * `Err(GateError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            GateError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(content).map_err(|e| {
            GateError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - caching.ttl must be > 0 when a cache backend is enabled
    /// - security.max_width and security.max_height must be > 0
    /// - enabled origins must name a path, URL or bucket
    /// - geolocation needs a database (local) or URL (remote) when enabled
    /// - network lookups need a URL when enabled
    /// - transform.workers must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.caching.is_enabled() && self.caching.ttl == 0 {
            return Err(GateError::ConfigError(
                "caching.ttl must be greater than 0 when caching is enabled".to_string(),
            ));
        }

        if self.security.max_width == 0 || self.security.max_height == 0 {
            return Err(GateError::ConfigError(format!(
                "security.max_width and security.max_height must be greater than 0, got {}x{}",
                self.security.max_width, self.security.max_height
            )));
        }

        for (name, storage) in [("images", &self.images), ("assets", &self.assets)] {
            Self::validate_storage(name, storage)?;
        }

        if self.geolocation.enabled {
            match self.geolocation.method {
                GeolocationMethod::Local if self.geolocation.database_path.is_none() => {
                    return Err(GateError::ConfigError(
                        "geolocation.database_path is required when method is 'local'".to_string(),
                    ));
                }
                GeolocationMethod::Remote if self.geolocation.remote_url.is_none() => {
                    return Err(GateError::ConfigError(
                        "geolocation.remote_url is required when method is 'remote'".to_string(),
                    ));
                }
                _ => {}
            }
        }

        if self.network.enabled && self.network.url.is_none() {
            return Err(GateError::ConfigError(
                "network.url is required when network lookups are enabled".to_string(),
            ));
        }

        if self.transform.workers == 0 {
            return Err(GateError::ConfigError(
                "transform.workers must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_storage(name: &str, storage: &StorageConfig) -> Result<()> {
        if storage.directory.enabled && storage.directory.path.is_empty() {
            return Err(GateError::ConfigError(format!(
                "{}.directory.path must not be empty",
                name
            )));
        }

        if storage.remote.enabled && storage.remote.path.is_empty() {
            return Err(GateError::ConfigError(format!(
                "{}.remote.path must not be empty",
                name
            )));
        }

        if storage.s3.enabled && storage.s3.bucket_name.is_empty() {
            return Err(GateError::ConfigError(format!(
                "{}.s3.bucket_name must not be empty",
                name
            )));
        }

        if storage.enabled_count() > 1 {
            warn!(
                "More than one origin enabled for {}; the first in directory/remote/s3 order wins",
                name
            );
        }

        Ok(())
    }

    /// Cache TTL for a request host
    ///
    /// In multi-domain mode a domain may override the global TTL.
    pub fn ttl_for_domain(&self, domain: Option<&str>) -> Duration {
        let override_ttl = if self.multi_domain.enabled {
            domain
                .and_then(|d| self.multi_domain.domains.get(d))
                .and_then(|d| d.ttl)
        } else {
            None
        };

        Duration::from_secs(override_ttl.unwrap_or(self.caching.ttl))
    }

    /// Whether a host is served in multi-domain mode
    pub fn is_known_domain(&self, domain: &str) -> bool {
        self.multi_domain.domains.contains_key(domain)
    }
}
