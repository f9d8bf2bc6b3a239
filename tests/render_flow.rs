use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
    middleware,
    routing::get,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use prerender::{
    cache::CacheConfig,
    config::Settings,
    infra::{error::InfraError, http_client::OutboundClient},
    lifecycle::{Application, HandlerChain, LifecycleManager, prerender_layer},
    render::{
        BridgeRequest, EngineError, MARKER_HEADER, NetworkAccess, PageLoad, RenderEngine,
        RenderedDocument, RouterDispatcher,
    },
};
use tower::ServiceExt;
use url::Url;

const GOOGLEBOT: &str = "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)";

fn site_router() -> Router {
    Router::new()
        .route(
            "/",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/html")],
                    "<html><body>home</body></html>",
                )
            }),
        )
        .route(
            "/empty",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "") }),
        )
}

/// Serves the CDN script the page loads.
struct CdnStub {
    calls: AtomicUsize,
}

#[async_trait]
impl OutboundClient for CdnStub {
    async fn execute(
        &self,
        request: Request<Bytes>,
        _secure: bool,
        _follow_redirects: bool,
    ) -> Result<Response<Bytes>, InfraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request.uri().host() != Some("cdn.test") {
            return Err(InfraError::http("unexpected host"));
        }
        Response::builder()
            .header(header::CONTENT_TYPE, "application/javascript")
            .body(Bytes::from_static(b"render();"))
            .map_err(|err| InfraError::http(err.to_string()))
    }
}

/// Loads the page and its script through the bridge and tags the markup.
struct ScriptedEngine {
    renders: AtomicUsize,
}

#[async_trait]
impl RenderEngine for ScriptedEngine {
    async fn render(
        &self,
        page: PageLoad,
        network: &dyn NetworkAccess,
    ) -> Result<RenderedDocument, EngineError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let html = network.fetch(page.request).await?;
        let script_url = Url::parse("https://cdn.test/app.js").expect("static url");
        network.fetch(BridgeRequest::get(script_url)).await?;

        if html.body.is_empty() {
            return Ok(RenderedDocument::Html(String::new()));
        }
        Ok(RenderedDocument::Html(format!(
            "{}<!--rendered-->",
            String::from_utf8_lossy(&html.body)
        )))
    }
}

struct Harness {
    app: Router,
    engine: Arc<ScriptedEngine>,
    cdn: Arc<CdnStub>,
    manager: LifecycleManager,
}

async fn harness() -> Harness {
    let mut settings = Settings::defaults().expect("default settings");
    settings.renderer.force_path = Some(".*\\$prerender".to_string());
    settings.renderer.warmup = false;

    let chain = HandlerChain::new();
    let engine = Arc::new(ScriptedEngine {
        renders: AtomicUsize::new(0),
    });
    let cdn = Arc::new(CdnStub {
        calls: AtomicUsize::new(0),
    });
    let manager = LifecycleManager::new(
        settings.renderer,
        settings.http_client,
        CacheConfig::from(&settings.cache),
        Arc::new(chain.clone()),
        engine.clone(),
        cdn.clone(),
    );
    let dispatcher = RouterDispatcher::for_hosts(site_router(), ["example.com"]);
    manager
        .start(Application::new("site", Arc::new(dispatcher)))
        .await
        .expect("renderer should start");

    let app = site_router().layer(middleware::from_fn_with_state(chain, prerender_layer));
    Harness {
        app,
        engine,
        cdn,
        manager,
    }
}

fn request(uri: &str, agent: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri).header(header::HOST, "example.com");
    if let Some(agent) = agent {
        builder = builder.header(header::USER_AGENT, agent);
    }
    builder.body(Body::empty()).expect("request should build")
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, header::HeaderMap, Bytes) {
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");
    let status = response.status();
    let headers = response.headers().clone();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    (status, headers, body)
}

#[tokio::test]
async fn browsers_reach_the_application() {
    let harness = harness().await;

    let (status, _, body) = send(&harness.app, request("/", Some("Mozilla/5.0 Firefox/128.0"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from("<html><body>home</body></html>"));
    assert_eq!(harness.engine.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn crawlers_get_a_cached_rendering() {
    let harness = harness().await;

    let (status, headers, first) = send(&harness.app, request("/", Some(GOOGLEBOT))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "text/html");
    assert_eq!(
        headers[header::CONTENT_LENGTH],
        first.len().to_string().as_str()
    );
    assert_eq!(
        first,
        Bytes::from("<html><body>home</body></html><!--rendered-->")
    );
    assert_eq!(harness.cdn.calls.load(Ordering::SeqCst), 1);

    let (_, _, second) = send(&harness.app, request("/", Some(GOOGLEBOT))).await;
    assert_eq!(first, second);
    assert_eq!(harness.engine.renders.load(Ordering::SeqCst), 1);

    let cache = harness.manager.cache("site").expect("cache exists");
    assert!(cache.contains("http://example.com/").await.expect("cache read"));
}

#[tokio::test]
async fn marked_requests_are_never_rendered() {
    let harness = harness().await;
    let mut marked = request("/", Some(GOOGLEBOT));
    marked
        .headers_mut()
        .insert(MARKER_HEADER, "false".parse().expect("header value"));

    let (_, _, body) = send(&harness.app, marked).await;

    assert_eq!(body, Bytes::from("<html><body>home</body></html>"));
    assert_eq!(harness.engine.renders.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn force_path_renders_without_a_crawler() {
    let harness = harness().await;

    let (status, _, body) = send(&harness.app, request("/?$prerender", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.ends_with(b"<!--rendered-->"));
}

#[tokio::test]
async fn empty_rendering_is_no_content() {
    let harness = harness().await;

    let (status, headers, body) = send(&harness.app, request("/empty", Some(GOOGLEBOT))).await;

    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(headers[header::CONTENT_LENGTH], "0");
    assert!(body.is_empty());
}

#[tokio::test]
async fn stopped_renderer_lets_crawlers_through() {
    let harness = harness().await;
    harness.manager.stop("site", "/").expect("renderer should stop");

    let (_, _, body) = send(&harness.app, request("/", Some(GOOGLEBOT))).await;

    assert_eq!(body, Bytes::from("<html><body>home</body></html>"));
    assert_eq!(harness.engine.renders.load(Ordering::SeqCst), 0);
}
