use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the `EnvFilter` directives.
pub const LOG_ENV: &str = "HANDRECEIPT_LOG";

const DEFAULT_FILTER: &str = "handreceipt=info,sqlx=warn";

/// Installs the JSON subscriber on stderr and bridges `log` records into
/// `tracing`. Safe to call more than once; later calls are no-ops.
pub fn init_logging() {
    let _ = tracing_log::LogTracer::init();
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .finish();
    // `try_init` would install its own LogTracer and give up when one exists.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
