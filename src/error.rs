//! Typed errors for the scaffold.

use thiserror::Error;

/// Errors raised while loading `./.config/draken.yaml`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("loading config file failed: {0}")]
    Unavailable(#[source] std::io::Error),
    #[error("config rejected: {0}")]
    Rejected(String),
}

/// Errors from the router tree.
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("router is frozen; no registrations after serve")]
    Frozen,
    #[error("router not created; call create_router first")]
    Missing,
}

/// Application-level errors: build faults, listener faults, absent backends.
#[derive(Error, Debug)]
pub enum DrakenError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("build failed: {0}")]
    Build(String),
    #[error("backend not initialised")]
    BackendAbsent,
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from cache operations. Transport errors pass through unchanged.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Backend(#[from] redis::RedisError),
    #[error("encoding value failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cache adapter stopped")]
    Stopped,
}

/// Errors from object-store operations.
#[derive(Error, Debug)]
pub enum R2Error {
    #[error(transparent)]
    Request(#[from] aws_sdk_s3::Error),
    #[error("reading object body failed: {0}")]
    Body(#[from] aws_sdk_s3::primitives::ByteStreamError),
}
