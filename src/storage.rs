//! SQL storage adapter: one capability contract, three backends.
//!
//! Construction retries until the backend is live. `connect` probes the
//! connection; `init` materialises the lazy pool and wires SQL statement
//! logging to the logger when debug is on; `handle` exposes an opaque
//! query handle; `stop` cancels the adapter context and releases the pool.

use crate::config::{StorageConfig, StorageType};
use crate::error::DrakenError;
use crate::shutdown::Shutdown;
use log::LevelFilter;
use sqlx::postgres::{PgConnectOptions, PgPool};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Delay between connection attempts.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_secs(10);

const SQLITE_FILE: &str = "main.db";

/// Opaque query handle exposed by a storage backend. Callers pick the arm
/// matching their configured variant and should not assume more than that.
pub enum SqlHandle<'a> {
    Sqlite(&'a SqlitePool),
    Libsql(&'a libsql::Database),
    Postgres(&'a PgPool),
}

/// The configured storage backend.
pub enum Storage {
    Sqlite(SqliteStorage),
    Libsql(LibsqlStorage),
    Postgres(PostgresStorage),
}

impl Storage {
    /// Construct the backend selected by the configuration, retrying until
    /// it is live.
    pub async fn connect(config: &StorageConfig) -> Result<Storage, DrakenError> {
        match config.kind {
            StorageType::Sqlite => Ok(Storage::Sqlite(
                SqliteStorage::connect(&["draken", "data"]).await?,
            )),
            StorageType::Libsql => Ok(Storage::Libsql(LibsqlStorage::connect(&config.dsn).await)),
            StorageType::Postgres => {
                Ok(Storage::Postgres(PostgresStorage::connect(&config.dsn).await))
            }
        }
    }

    /// Idempotent. Builds the connection pool; statements are written to the
    /// logger only when `debug` is true.
    pub fn init(&mut self, debug: bool) {
        match self {
            Storage::Sqlite(s) => s.init(debug),
            Storage::Libsql(s) => s.init(debug),
            Storage::Postgres(s) => s.init(debug),
        }
    }

    /// Release the connection pool and cancel the adapter context. Idempotent.
    pub async fn stop(&mut self) {
        match self {
            Storage::Sqlite(s) => s.stop().await,
            Storage::Libsql(s) => s.stop(),
            Storage::Postgres(s) => s.stop().await,
        }
    }

    /// The opaque query handle. Errors until `init` has run.
    pub fn handle(&self) -> Result<SqlHandle<'_>, DrakenError> {
        match self {
            Storage::Sqlite(s) => s
                .pool
                .as_ref()
                .map(SqlHandle::Sqlite)
                .ok_or(DrakenError::BackendAbsent),
            Storage::Libsql(s) => s
                .db
                .as_ref()
                .map(SqlHandle::Libsql)
                .ok_or(DrakenError::BackendAbsent),
            Storage::Postgres(s) => s
                .pool
                .as_ref()
                .map(SqlHandle::Postgres)
                .ok_or(DrakenError::BackendAbsent),
        }
    }

    /// The adapter's cancellable context; `stop` triggers it.
    pub fn shutdown(&self) -> &Shutdown {
        match self {
            Storage::Sqlite(s) => &s.shutdown,
            Storage::Libsql(s) => &s.shutdown,
            Storage::Postgres(s) => &s.shutdown,
        }
    }
}

/// Embedded single-file database under the user's home directory.
pub struct SqliteStorage {
    options: SqliteConnectOptions,
    pool: Option<SqlitePool>,
    shutdown: Shutdown,
}

impl SqliteStorage {
    /// Open `main.db` under `~/<folders...>`, creating the directory with
    /// mode 0755 if absent.
    pub async fn connect(folders: &[&str]) -> Result<SqliteStorage, DrakenError> {
        debug!("initializing the sqlite database");
        let data_dir = sqlite_data_dir(folders)?;
        create_data_dir(&data_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(SQLITE_FILE))
            .create_if_missing(true);

        loop {
            match options.connect().await {
                Ok(conn) => {
                    let _ = conn.close().await;
                    break;
                }
                Err(e) => {
                    error!("failed to connect to the database: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }

        info!("initialized sqlite database");
        Ok(SqliteStorage {
            options,
            pool: None,
            shutdown: Shutdown::new(),
        })
    }

    pub fn init(&mut self, debug: bool) {
        if self.pool.is_some() {
            return;
        }
        let level = if debug { LevelFilter::Debug } else { LevelFilter::Off };
        let options = self.options.clone().log_statements(level);
        self.pool = Some(SqlitePool::connect_lazy_with(options));
    }

    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

/// Remote SQLite-compatible database (Turso/libsql).
pub struct LibsqlStorage {
    db: Option<libsql::Database>,
    shutdown: Shutdown,
}

impl LibsqlStorage {
    /// Connect against the DSN, honouring an `authToken` query parameter.
    pub async fn connect(dsn: &str) -> LibsqlStorage {
        let db = loop {
            debug!("initializing the libsql database");
            let (url, token) = split_libsql_dsn(dsn);
            match libsql::Builder::new_remote(url, token).build().await {
                Ok(db) => match probe_libsql(&db).await {
                    Ok(()) => break db,
                    Err(e) => {
                        error!("failed to connect to the database: {e}");
                        warn!("waiting for 10 seconds before trying to establish a new connection");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
                Err(e) => {
                    error!("failed to connect to the database: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };

        info!("initialized libsql database");
        LibsqlStorage {
            db: Some(db),
            shutdown: Shutdown::new(),
        }
    }

    pub fn init(&mut self, debug: bool) {
        if debug {
            debug!("the remote driver exposes no statement hook; queries are not logged");
        }
    }

    pub fn stop(&mut self) {
        self.shutdown.trigger();
        self.db = None;
    }
}

async fn probe_libsql(db: &libsql::Database) -> Result<(), libsql::Error> {
    let conn = db.connect()?;
    conn.query("SELECT 1", ()).await?;
    Ok(())
}

/// PostgreSQL over a connection pool.
pub struct PostgresStorage {
    options: PgConnectOptions,
    pool: Option<PgPool>,
    shutdown: Shutdown,
}

impl PostgresStorage {
    /// Connect against the DSN and run one liveness probe.
    pub async fn connect(dsn: &str) -> PostgresStorage {
        let options = loop {
            debug!("initializing the postgres database");
            let options = match PgConnectOptions::from_str(dsn) {
                Ok(options) => options,
                Err(e) => {
                    error!("could not parse dsn: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            match options.connect().await {
                Ok(mut conn) => match conn.ping().await {
                    Ok(()) => {
                        let _ = conn.close().await;
                        break options;
                    }
                    Err(e) => {
                        error!("failed to connect to the database: {e}");
                        warn!("waiting for 10 seconds before trying to establish a new connection");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                },
                Err(e) => {
                    error!("failed to connect to the database: {e}");
                    warn!("waiting for 10 seconds before trying to establish a new connection");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        };

        info!("initialized postgres database");
        PostgresStorage {
            options,
            pool: None,
            shutdown: Shutdown::new(),
        }
    }

    pub fn init(&mut self, debug: bool) {
        if self.pool.is_some() {
            return;
        }
        let level = if debug { LevelFilter::Debug } else { LevelFilter::Off };
        let options = self.options.clone().log_statements(level);
        self.pool = Some(PgPool::connect_lazy_with(options));
    }

    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

fn sqlite_data_dir(folders: &[&str]) -> Result<PathBuf, DrakenError> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| DrakenError::Build("user home directory unavailable".into()))?;
    Ok(join_data_dir(home, folders))
}

fn join_data_dir(home: PathBuf, folders: &[&str]) -> PathBuf {
    let mut dir = home;
    for folder in folders {
        dir.push(folder);
    }
    dir
}

fn create_data_dir(dir: &Path) -> Result<(), DrakenError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|e| DrakenError::Build(format!("creating data directory failed: {e}")))?;
    }
    #[cfg(not(unix))]
    std::fs::create_dir_all(dir)
        .map_err(|e| DrakenError::Build(format!("creating data directory failed: {e}")))?;
    Ok(())
}

/// The remote driver takes the auth token separately; the DSN carries it as
/// an `authToken` query parameter.
fn split_libsql_dsn(dsn: &str) -> (String, String) {
    match Url::parse(dsn) {
        Ok(mut url) => {
            let token = url
                .query_pairs()
                .find(|(key, _)| key == "authToken")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default();
            url.set_query(None);
            (url.to_string(), token)
        }
        // Let the driver report the malformed DSN; the retry loop logs it.
        Err(_) => (dsn.to_string(), String::new()),
    }
}
