use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the renderer emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "prerender_cache_hit_total",
            Unit::Count,
            "Total number of crawler requests served from the render cache."
        );
        describe_counter!(
            "prerender_cache_miss_total",
            Unit::Count,
            "Total number of crawler requests that required a fresh render."
        );
        describe_counter!(
            "prerender_refresh_failed_total",
            Unit::Count,
            "Total number of stale entries whose refresh failed and were kept."
        );
        describe_histogram!(
            "prerender_render_ms",
            Unit::Milliseconds,
            "Full page render latency in milliseconds."
        );
        describe_counter!(
            "prerender_bridge_request_total",
            Unit::Count,
            "Total number of engine sub-requests served by the bridge."
        );
        describe_counter!(
            "prerender_bridge_fallback_total",
            Unit::Count,
            "Total number of engine sub-requests sent to the outbound client."
        );
    });
}
