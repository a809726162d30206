use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// sqlx logs every statement at `info`; the ingestion writer would drown
/// everything else.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Install the global tracing subscriber. Call once, from `main`.
///
/// `RUST_LOG` replaces [`DEFAULT_FILTER`], e.g.
/// `RUST_LOG=anomaly_sync::sync=debug` for per-batch ingestion logs.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Logging initialized");
}
