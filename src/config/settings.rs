use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::firewall::analyzer::AnalyzerConfig;
use crate::firewall::collector::CollectorConfig;
use crate::firewall::limiter::LimiterConfig;
use crate::firewall::proxy_resolver::ProxyConfig;
use crate::firewall::scorer::ScoringConfig;

use super::defaults;

/// Top-level configuration for the palisade firewall.
/// Deserializes from a TOML configuration file; every section falls
/// back to its defaults when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub admin_api: AdminApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,
}

impl Settings {
    /// Load configuration from a TOML file at the given path.
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Invalid configuration is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        self.limiter
            .validate()
            .map_err(|reason| anyhow::anyhow!("invalid [limiter] config: {}", reason))?;
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            redis: RedisConfig::default(),
            storage: StorageConfig::default(),
            admin_api: AdminApiConfig::default(),
            logging: LoggingConfig::default(),
            proxy: ProxyConfig::default(),
            collector: CollectorConfig::default(),
            fingerprint: FingerprintConfig::default(),
            scoring: ScoringConfig::default(),
            analyzer: AnalyzerConfig::default(),
            limiter: LimiterConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: defaults::default_bind(),
        }
    }
}

/// State-store connection configuration. With `enabled = false` the
/// firewall coordinates through an in-process store instead; fine for a
/// single controller, no cross-process sharing.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "defaults::default_redis_enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::default_redis_url")]
    pub url: String,

    /// Per-operation timeout; a slow store degrades to neutral defaults
    /// rather than stalling the request.
    #[serde(default = "defaults::default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::default_redis_enabled(),
            url: defaults::default_redis_url(),
            op_timeout_ms: defaults::default_op_timeout_ms(),
        }
    }
}

/// Durable access-log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::default_sqlite_path")]
    pub sqlite_path: String,

    /// Rows older than this are pruned by the hourly maintenance task.
    #[serde(default = "defaults::default_retention_days")]
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: defaults::default_sqlite_path(),
            retention_days: defaults::default_retention_days(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminApiConfig {
    #[serde(default = "defaults::default_api_key")]
    pub api_key: String,
}

impl Default for AdminApiConfig {
    fn default() -> Self {
        Self {
            api_key: defaults::default_api_key(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::default_log_level")]
    pub level: String,

    #[serde(default = "defaults::default_log_file")]
    pub file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::default_log_level(),
            file: defaults::default_log_file(),
        }
    }
}

/// Fingerprint derivation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintConfig {
    #[serde(default = "defaults::default_fingerprint_salt")]
    pub salt: String,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            salt: defaults::default_fingerprint_salt(),
        }
    }
}
