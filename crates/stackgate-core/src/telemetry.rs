//! Centralised tracing initialisation for Stackgate binaries.
//!
//! Call [`init_tracing`] once at program start. Filtering comes from
//! `STACKGATE_LOG` (preferred) or `RUST_LOG`, falling back to the supplied
//! default level. Safe to call more than once — the global subscriber can
//! only be set once per process, and later calls are silently ignored.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// * `json` — when `true`, emit newline-delimited JSON log lines for log
///   aggregation pipelines.
/// * `level` — default verbosity when no filter env var is set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = std::env::var("STACKGATE_LOG")
        .ok()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}
