//! Application lifecycle: build, serve, signal-driven graceful shutdown.

use crate::cache::Cache;
use crate::config::Config;
use crate::error::{DrakenError, RouterError};
use crate::logging;
use crate::middleware::{attach_essentials, SecurityHeaders};
use crate::r2::R2;
use crate::router::Router;
use crate::shutdown::wait_for_signal;
use crate::storage::Storage;
use axum::extract::Request;
use axum::ServiceExt;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tower::Layer;
use tower_http::normalize_path::NormalizePathLayer;
use tracing::{debug, error, info};

/// Upper bound for draining in-flight requests and closing backends.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Certificate and key file paths for TLS serving.
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// The application: configuration, backends, router tree, listener.
pub struct Draken {
    pub config: Config,
    pub started_at: DateTime<Utc>,
    storage: Option<Storage>,
    cache: Option<Cache>,
    r2: Option<R2>,
    router: Option<Router>,
    clean_path: bool,
}

impl Draken {
    /// Build the application: load the configuration, set up the logger,
    /// then bring up every enabled backend. Backend construction retries
    /// until live; faults outside the retry loops surface as errors for the
    /// binary to exit non-zero on.
    pub async fn new() -> Result<Draken, DrakenError> {
        let started_at = Utc::now();
        let config = Config::load()?;
        logging::setup(&config);

        let storage = if config.storage.enabled {
            debug!("initializing storage");
            let mut storage = Storage::connect(&config.storage).await?;
            storage.init(config.debug);
            info!("storage initialized");
            Some(storage)
        } else {
            debug!("storage is disabled in the config, skipping");
            None
        };

        let cache = if config.cache.enabled {
            debug!("initializing cache");
            let mut cache = Cache::connect(&config.cache).await;
            cache.init(true);
            info!("cache initialized");
            Some(cache)
        } else {
            debug!("cache is disabled in the config, skipping");
            None
        };

        let r2 = if config.r2.enabled {
            debug!("initializing r2");
            let r2 = R2::connect(&config.r2).await;
            info!("r2 initialized");
            Some(r2)
        } else {
            debug!("r2 is disabled in the config, skipping");
            None
        };

        info!("created draken app");
        Ok(Draken {
            config,
            started_at,
            storage,
            cache,
            r2,
            router: None,
            clean_path: false,
        })
    }

    /// Build the root router group. Returns a handle; the application keeps
    /// one too for serving.
    pub fn create_router(&mut self) -> Router {
        let router = Router::new();
        self.router = Some(router.clone());
        router
    }

    pub fn router(&self) -> Result<&Router, DrakenError> {
        self.router
            .as_ref()
            .ok_or(DrakenError::Router(RouterError::Missing))
    }

    /// The storage backend, or `BackendAbsent` when disabled.
    pub fn storage(&self) -> Result<&Storage, DrakenError> {
        self.storage.as_ref().ok_or(DrakenError::BackendAbsent)
    }

    /// The cache backend, or `BackendAbsent` when disabled.
    pub fn cache(&self) -> Result<&Cache, DrakenError> {
        self.cache.as_ref().ok_or(DrakenError::BackendAbsent)
    }

    /// The object store, or `BackendAbsent` when disabled.
    pub fn r2(&self) -> Result<&R2, DrakenError> {
        self.r2.as_ref().ok_or(DrakenError::BackendAbsent)
    }

    /// Attach the curated middleware stack with the default security headers.
    pub fn essential_middlewares(&mut self) -> Result<(), DrakenError> {
        self.essential_middlewares_with(SecurityHeaders::default())
    }

    /// Attach the curated middleware stack, overriding the security headers.
    pub fn essential_middlewares_with(
        &mut self,
        security: SecurityHeaders,
    ) -> Result<(), DrakenError> {
        let router = self.router()?;
        let clean_path = attach_essentials(router, &self.config.server, security)?;
        self.clean_path = clean_path;
        Ok(())
    }

    /// Serve HTTP on `0.0.0.0:<port>` until a signal arrives and graceful
    /// shutdown completes. Clean termination is success.
    pub async fn serve(&mut self) -> Result<(), DrakenError> {
        self.run(None).await
    }

    /// Serve HTTPS with the given certificate and key files.
    pub async fn serve_tls(&mut self, tls: TlsConfig) -> Result<(), DrakenError> {
        self.run(Some(tls)).await
    }

    async fn run(&mut self, tls: Option<TlsConfig>) -> Result<(), DrakenError> {
        let router = self.router.take().ok_or(RouterError::Missing)?;
        let app = router.freeze();
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));

        let handle = Handle::new();
        tokio::spawn(watch_signals(handle.clone()));

        let rustls = match &tls {
            Some(tls) => Some(RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file).await?),
            None => None,
        };

        info!("listening on port {}", self.config.server.port);
        let served = if self.clean_path {
            let app = NormalizePathLayer::trim_trailing_slash().layer(app);
            let make = ServiceExt::<Request>::into_make_service_with_connect_info::<SocketAddr>(app);
            match rustls {
                Some(rustls) => {
                    axum_server::bind_rustls(addr, rustls)
                        .handle(handle)
                        .serve(make)
                        .await
                }
                None => axum_server::bind(addr).handle(handle).serve(make).await,
            }
        } else {
            let make = app.into_make_service_with_connect_info::<SocketAddr>();
            match rustls {
                Some(rustls) => {
                    axum_server::bind_rustls(addr, rustls)
                        .handle(handle)
                        .serve(make)
                        .await
                }
                None => axum_server::bind(addr).handle(handle).serve(make).await,
            }
        };

        self.stop_backends().await;
        served?;
        info!("graceful shutdown finished");
        Ok(())
    }

    /// Close backends in reverse order of creation, bounded by the shutdown
    /// deadline.
    async fn stop_backends(&mut self) {
        let r2 = self.r2.take();
        let cache = self.cache.take();
        let storage = self.storage.take();

        let closing = async {
            if let Some(mut r2) = r2 {
                r2.stop();
            }
            if let Some(mut cache) = cache {
                cache.stop().await;
            }
            if let Some(mut storage) = storage {
                storage.stop().await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, closing).await.is_err() {
            error!("graceful shutdown deadline exceeded, forcing close");
        }
    }
}

/// Wait for SIGINT or SIGTERM, then start a deadline-bounded graceful
/// shutdown of the listener.
async fn watch_signals(handle: Handle) {
    wait_for_signal().await;
    debug!("graceful shutdown initiated");
    handle.graceful_shutdown(Some(SHUTDOWN_DEADLINE));
}
