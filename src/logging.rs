use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber. `RUST_LOG` wins over `level`; without
/// either, debug builds log at DEBUG and release builds at INFO.
pub fn init_tracing(level: Option<LevelFilter>) -> Result<(), TryInitError> {
    let default_filter = if cfg!(any(test, debug_assertions)) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter_layer = EnvFilter::builder()
        .with_default_directive(level.unwrap_or(default_filter).into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer().with_level(true).with_thread_names(true);
    let fmt_layer = if cfg!(any(test, debug_assertions)) {
        fmt_layer.with_file(true).with_line_number(true)
    } else {
        fmt_layer
    };

    tracing_subscriber::registry().with(filter_layer).with(fmt_layer).try_init()
}
