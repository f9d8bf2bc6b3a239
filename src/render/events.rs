use std::time::Duration;

use metrics::{counter, histogram};
use tracing::{info, warn};

const METRIC_CACHE_HIT_TOTAL: &str = "prerender_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "prerender_cache_miss_total";
const METRIC_RENDER_MS: &str = "prerender_render_ms";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    CacheHit,
    /// Rendered fresh; `elapsed` covers the full engine run.
    CacheMiss { elapsed: Duration },
}

/// Observable result of one crawler request.
#[derive(Debug, Clone)]
pub struct RenderEvent {
    pub application: String,
    pub url: String,
    /// The crawler's `User-Agent`, when it sent one.
    pub client: Option<String>,
    pub outcome: RenderOutcome,
}

pub trait RenderObserver: Send + Sync {
    fn observe(&self, event: &RenderEvent);
}

/// Reports render events as log lines and metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryObserver;

impl RenderObserver for TelemetryObserver {
    fn observe(&self, event: &RenderEvent) {
        let client = event.client.as_deref().unwrap_or("-");
        match &event.outcome {
            RenderOutcome::CacheHit => {
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                info!(
                    target = "prerender::render",
                    application = %event.application,
                    url = %event.url,
                    client,
                    cache = "render",
                    outcome = "hit",
                    "served cached rendering"
                );
            }
            RenderOutcome::CacheMiss { elapsed } => {
                let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
                counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
                histogram!(METRIC_RENDER_MS).record(elapsed_ms);
                warn!(
                    target = "prerender::render",
                    application = %event.application,
                    url = %event.url,
                    client,
                    cache = "render",
                    outcome = "miss",
                    elapsed_ms,
                    "rendered page for crawler"
                );
            }
        }
    }
}
