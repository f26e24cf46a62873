//! Telemetry initialization.

use tracing_subscriber::{
    fmt::format::Format, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize tracing.
///
/// With `LOG_ICAP_TRAFFIC` disabled only ERROR-level events are emitted by
/// default; enabling it turns on the full structured logs including ICAP
/// wire traffic at debug level. `RUST_LOG` overrides both.
pub fn init_telemetry(log_icap_traffic: bool) {
    let default_filter = if log_icap_traffic {
        "avgate=debug,tower_http=info"
    } else {
        "error"
    };

    let console_fmt = tracing_subscriber::fmt::layer().event_format(
        Format::default()
            .compact()
            .with_target(false)
            .without_time(),
    );

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(console_fmt)
        .init();
}
