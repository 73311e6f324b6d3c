//! Config load pipeline: dotenv, YAML read, env substitution, projection.

use crate::config::{
    CacheConfig, CacheType, Config, Environment, HeartbeatConfig, R2Config, ServerConfig,
    StorageConfig, StorageType,
};
use crate::error::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

const CONFIG_FILE: &str = ".config/draken.yaml";
const ENV_FILE: &str = ".env";

/// `$VAR` or `${VAR}`, where VAR is a POSIX-style identifier.
const ENV_PATTERN: &str = r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))";

// Raw document shape. Unknown keys are ignored by serde; every field is
// optional so a minimal file stays valid.

#[derive(Deserialize, Default)]
struct RawRoot {
    #[serde(default)]
    draken: RawDraken,
}

#[derive(Deserialize, Default)]
struct RawDraken {
    #[serde(default)]
    environment: String,
    #[serde(default)]
    debug: bool,
    #[serde(default)]
    server: RawServer,
    #[serde(default)]
    storage: RawStorage,
    #[serde(default)]
    cache: RawCache,
    #[serde(default)]
    r2: RawR2,
}

#[derive(Deserialize, Default)]
struct RawServer {
    #[serde(default)]
    port: u16,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    security: bool,
    #[serde(default)]
    heartbeat: RawHeartbeat,
}

#[derive(Deserialize, Default)]
struct RawHeartbeat {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    endpoint: String,
}

#[derive(Deserialize, Default)]
struct RawStorage {
    #[serde(default)]
    enabled: bool,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    libsql: RawDsn,
    #[serde(default)]
    postgres: RawDsn,
}

#[derive(Deserialize, Default)]
struct RawCache {
    #[serde(default)]
    enabled: bool,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    redis: RawDsn,
}

#[derive(Deserialize, Default)]
struct RawDsn {
    #[serde(default)]
    dsn: String,
}

#[derive(Deserialize, Default)]
struct RawR2 {
    #[serde(default)]
    enabled: bool,
    #[serde(rename = "accountId", default)]
    account_id: String,
    #[serde(rename = "accessKeyId", default)]
    access_key_id: String,
    #[serde(rename = "accessKeySecret", default)]
    access_key_secret: String,
}

pub(crate) fn load(dir: &Path) -> Result<Config, ConfigError> {
    tracing::debug!("loading environment variables");
    let env_found = dotenvy::from_path(dir.join(ENV_FILE)).is_ok();
    if !env_found {
        tracing::debug!("environment file could not be loaded, defaulting to process environment");
    }

    tracing::debug!("loading config file");
    let raw = std::fs::read_to_string(dir.join(CONFIG_FILE)).map_err(ConfigError::Unavailable)?;

    let substituted = if env_found {
        tracing::debug!("substituting environment variables");
        substitute_env(&raw)?
    } else {
        raw
    };

    tracing::debug!("parsing configuration");
    let root: RawRoot = serde_yaml::from_str(&substituted)
        .map_err(|e| ConfigError::Rejected(format!("parsing config failed: {e}")))?;

    let config = project(root.draken);
    validate(&config)?;
    tracing::info!("configuration loaded");
    Ok(config)
}

/// Replace `$VAR` / `${VAR}` with process environment values.
/// Unset variables expand to the empty string.
fn substitute_env(input: &str) -> Result<String, ConfigError> {
    let pattern = Regex::new(ENV_PATTERN)
        .map_err(|e| ConfigError::Rejected(format!("substituting env variables failed: {e}")))?;
    let replaced = pattern.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_default()
    });
    // Anything left in braced form did not match a valid identifier.
    if replaced.contains("${") {
        return Err(ConfigError::Rejected(
            "substituting env variables failed: malformed ${...} expression".into(),
        ));
    }
    Ok(replaced.into_owned())
}

fn project(raw: RawDraken) -> Config {
    let (storage_kind, storage_dsn) = match raw.storage.kind.as_str() {
        "libsql" => (StorageType::Libsql, raw.storage.libsql.dsn),
        "postgres" => (StorageType::Postgres, raw.storage.postgres.dsn),
        // "sqlite" and anything unrecognised: the embedded file database.
        _ => (StorageType::Sqlite, String::new()),
    };

    // Redis is the only cache backend; unrecognised values fall back to it.
    let (cache_kind, cache_dsn) = (CacheType::Redis, raw.cache.redis.dsn);

    Config {
        environment: Environment::parse(&raw.environment),
        debug: raw.debug,
        server: ServerConfig {
            port: raw.server.port,
            hidden: raw.server.hidden,
            security: raw.server.security,
            heartbeat: HeartbeatConfig {
                enabled: raw.server.heartbeat.enabled,
                endpoint: raw.server.heartbeat.endpoint,
            },
        },
        storage: StorageConfig {
            enabled: raw.storage.enabled,
            kind: storage_kind,
            dsn: storage_dsn,
        },
        cache: CacheConfig {
            enabled: raw.cache.enabled,
            kind: cache_kind,
            dsn: cache_dsn,
        },
        r2: R2Config {
            enabled: raw.r2.enabled,
            account_id: raw.r2.account_id,
            access_key_id: raw.r2.access_key_id,
            access_key_secret: raw.r2.access_key_secret,
        },
    }
}

/// An enabled adapter must carry its credentials. Sqlite needs no DSN.
fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.storage.enabled
        && config.storage.kind != StorageType::Sqlite
        && config.storage.dsn.is_empty()
    {
        return Err(ConfigError::Rejected(
            "storage is enabled but no DSN is configured".into(),
        ));
    }
    if config.cache.enabled && config.cache.dsn.is_empty() {
        return Err(ConfigError::Rejected(
            "cache is enabled but no DSN is configured".into(),
        ));
    }
    if config.r2.enabled
        && (config.r2.account_id.is_empty()
            || config.r2.access_key_id.is_empty()
            || config.r2.access_key_secret.is_empty())
    {
        return Err(ConfigError::Rejected(
            "r2 is enabled but credentials are incomplete".into(),
        ));
    }
    Ok(())
}
