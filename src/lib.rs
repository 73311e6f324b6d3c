//! Draken: an opinionated web-application scaffold. One YAML configuration
//! wires a structured logger, a router tree with a curated middleware stack,
//! SQL storage, a Redis cache, and R2 object storage into a single
//! application with graceful shutdown.

pub mod app;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod r2;
pub mod router;
pub mod shutdown;
pub mod storage;

pub use app::{Draken, TlsConfig};
pub use cache::Cache;
pub use config::{CacheType, Config, Environment, StorageType};
pub use error::{CacheError, ConfigError, DrakenError, R2Error, RouterError};
pub use middleware::{RealIp, RequestId, SecurityHeaders, HEADER_REQUEST_ID};
pub use r2::R2;
pub use router::Router;
pub use shutdown::Shutdown;
pub use storage::{SqlHandle, Storage};
