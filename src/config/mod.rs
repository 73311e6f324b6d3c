//! Typed configuration tree. Immutable after load.

mod loader;

use crate::error::ConfigError;
use std::path::Path;

/// Deployment environment, from the `draken.environment` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Local,
    Dev,
    Staging,
    Prod,
}

impl Environment {
    /// Unrecognised values fall back to `Local`.
    pub fn parse(value: &str) -> Self {
        match value {
            "dev" => Environment::Dev,
            "staging" => Environment::Staging,
            "prod" => Environment::Prod,
            _ => Environment::Local,
        }
    }
}

/// Storage backend variant, from `draken.storage.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Sqlite,
    Libsql,
    Postgres,
}

/// Cache backend variant, from `draken.cache.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    #[default]
    Redis,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub environment: Environment,
    pub debug: bool,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub r2: R2Config,
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub port: u16,
    /// Omit the server-identifying banner headers.
    pub hidden: bool,
    /// Enable the security-header middleware.
    pub security: bool,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub endpoint: String,
}

#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub kind: StorageType,
    /// Connection string for the selected variant. Sqlite needs none.
    pub dsn: String,
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub kind: CacheType,
    pub dsn: String,
}

#[derive(Debug, Clone, Default)]
pub struct R2Config {
    pub enabled: bool,
    pub account_id: String,
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl Config {
    /// Load the configuration from the current working directory:
    /// `./.env` (optional) and `./.config/draken.yaml` (required).
    pub fn load() -> Result<Config, ConfigError> {
        Config::load_from(Path::new("."))
    }

    /// Load relative to `dir` instead of the working directory.
    pub fn load_from(dir: &Path) -> Result<Config, ConfigError> {
        loader::load(dir)
    }
}
