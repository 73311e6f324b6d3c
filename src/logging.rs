//! Global logger setup from the loaded configuration.

use crate::config::{Config, Environment};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Unix-seconds timestamps for the structured output.
struct UnixTime;

impl FormatTime for UnixTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        write!(w, "{}", now.as_secs())
    }
}

/// Install the global subscriber: debug level when `config.debug`, console
/// output in the local environment, JSON lines everywhere else. Stderr sink.
/// Repeated calls are tolerated (the first installation wins).
pub fn setup(config: &Config) {
    let level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::new(level);

    if config.environment == Environment::Local {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_timer(UnixTime)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
