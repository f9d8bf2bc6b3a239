use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, StatusCode, header},
    middleware,
    routing::get,
};
use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use prerender::{
    cache::{CacheAction, CacheConfig},
    config::Settings,
    infra::{error::InfraError, http_client::OutboundClient, telemetry},
    lifecycle::{Application, HandlerChain, LifecycleManager, prerender_layer},
    render::{
        BridgeRequest, EngineError, NetworkAccess, PageLoad, RenderEngine, RenderedDocument,
        RouterDispatcher,
    },
    service::RenderService,
};
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use url::Url;

struct Cdn;

#[async_trait]
impl OutboundClient for Cdn {
    async fn execute(
        &self,
        _request: Request<Bytes>,
        _secure: bool,
        _follow_redirects: bool,
    ) -> Result<Response<Bytes>, InfraError> {
        Response::builder()
            .header(header::CONTENT_TYPE, "text/javascript")
            .body(Bytes::from_static(b"boot();"))
            .map_err(|err| InfraError::http(err.to_string()))
    }
}

/// Fetches the page and one external script; fails once `broken` is set.
struct Engine {
    broken: AtomicBool,
}

#[async_trait]
impl RenderEngine for Engine {
    async fn render(
        &self,
        page: PageLoad,
        network: &dyn NetworkAccess,
    ) -> Result<RenderedDocument, EngineError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(EngineError::Script("engine crashed".to_string()));
        }
        let html = network.fetch(page.request).await?;
        let script = Url::parse("https://cdn.test/boot.js").expect("static url");
        network.fetch(BridgeRequest::get(script)).await?;
        Ok(RenderedDocument::Html(
            String::from_utf8_lossy(&html.body).into_owned(),
        ))
    }
}

fn site() -> Router {
    Router::new().route(
        "/",
        get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<p>metrics</p>") }),
    )
}

#[tokio::test]
async fn render_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let mut settings = Settings::defaults().expect("default settings");
    settings.renderer.warmup = false;

    let chain = HandlerChain::new();
    let engine = Arc::new(Engine {
        broken: AtomicBool::new(false),
    });
    let manager = Arc::new(LifecycleManager::new(
        settings.renderer,
        settings.http_client,
        CacheConfig::from(&settings.cache),
        Arc::new(chain.clone()),
        engine.clone(),
        Arc::new(Cdn),
    ));
    manager
        .start(Application::new(
            "metrics",
            Arc::new(RouterDispatcher::for_hosts(site(), ["example.com"])),
        ))
        .await
        .expect("renderer should start");

    // Miss, then hit, through the middleware.
    let app = site().layer(middleware::from_fn_with_state(chain, prerender_layer));
    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/")
            .header(header::HOST, "example.com")
            .header(header::USER_AGENT, "Googlebot/2.1")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // A stale entry whose refresh fails keeps its previous rendering.
    engine.broken.store(true, Ordering::SeqCst);
    let service = RenderService::new(manager);
    let action = service
        .cache_url(
            "metrics",
            "/",
            "http://example.com/",
            Some(OffsetDateTime::now_utc() + Duration::hours(1)),
        )
        .await
        .expect("cache_url should succeed");
    assert_eq!(action, CacheAction::RefreshFailed);
    assert!(
        service
            .is_cached("metrics", "http://example.com/")
            .await
            .expect("cache read")
    );

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "prerender_cache_hit_total",
        "prerender_cache_miss_total",
        "prerender_render_ms",
        "prerender_bridge_request_total",
        "prerender_bridge_fallback_total",
        "prerender_refresh_failed_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
