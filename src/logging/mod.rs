use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LogConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log.level`. With `log.enable_trace` events carry
/// their source location and span close events are emitted. Returns `false`
/// when a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let span_events = if config.enable_trace {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_file(config.enable_trace)
        .with_line_number(config.enable_trace)
        .with_span_events(span_events)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    tracing::subscriber::set_global_default(subscriber).is_ok()
}
