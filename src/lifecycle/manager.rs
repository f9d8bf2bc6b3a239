//! Starts and stops renderers for mounted applications.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

use crate::cache::{
    CacheConfig, CacheError, CacheProvider, CacheRefresher, CacheRegistry, CacheSpec,
    MemoryCacheProvider, RenderCache,
};
use crate::config::{HttpClientSettings, RendererSettings};
use crate::infra::http_client::OutboundClient;
use crate::render::{
    BotGate, Dispatcher, EngineDefaults, GateError, PageRenderer, RenderBridge,
    RenderCoordinator, RenderEngine, RenderObserver, RenderRequest, TelemetryObserver, authority,
};

use super::bus::{HandlerBus, Priority, Subscription, mounted_under, normalize_mount};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("renderer for `{application}` at `{path}` is already started")]
    AlreadyStarted { application: String, path: String },
    #[error("renderer for `{application}` at `{path}` is not started")]
    NotStarted { application: String, path: String },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// A web application the renderer is mounted in front of.
#[derive(Clone)]
pub struct Application {
    pub id: String,
    /// Public host name, used for warm-up and programmatic renders.
    pub virtual_host: Option<String>,
    /// Mount path of the renderer.
    pub server_path: String,
    pub secure: bool,
    /// Locales warmed up on start.
    pub languages: Vec<String>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("virtual_host", &self.virtual_host)
            .field("server_path", &self.server_path)
            .field("secure", &self.secure)
            .field("languages", &self.languages)
            .finish_non_exhaustive()
    }
}

impl Application {
    pub fn new(id: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            id: id.into(),
            virtual_host: None,
            server_path: "/".to_string(),
            secure: false,
            languages: Vec::new(),
            dispatcher,
        }
    }

    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = Some(host.into());
        self
    }

    pub fn with_server_path(mut self, path: impl Into<String>) -> Self {
        self.server_path = path.into();
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// Root page of the mount, when the application has a public host.
    pub fn root_url(&self) -> Option<Url> {
        let host = self.virtual_host.as_deref()?;
        let path = self.server_path.trim_end_matches('/');
        Url::parse(&format!("{}://{host}{path}/", self.scheme())).ok()
    }
}

/// Live renderer for one (application, mount path).
pub(crate) struct Registration {
    pub(crate) application: Application,
    pub(crate) renderer: Arc<PageRenderer>,
    pub(crate) coordinator: Arc<RenderCoordinator>,
    subscription: Box<dyn Subscription>,
}

/// Plain GET used to fill and refresh cache entries.
pub(crate) fn cache_request(url: Url) -> RenderRequest {
    let host = authority(&url).and_then(|host| HeaderValue::from_str(&host).ok());
    let request = RenderRequest::get(url).with_css(false);
    match host {
        Some(host) => request.with_header(header::HOST, host),
        None => request,
    }
}

type Registrations = DashMap<(String, String), Registration>;

/// Renderer of the application whose mount covers `path`, preferring the
/// longest mount. Falls back to any live mount of the application.
fn live_renderer(
    registrations: &Registrations,
    application: &str,
    path: &str,
) -> Option<Arc<PageRenderer>> {
    let mut fallback = None;
    let mut best: Option<(usize, Arc<PageRenderer>)> = None;
    for registration in registrations.iter() {
        if registration.key().0 != application {
            continue;
        }
        let mount = normalize_mount(&registration.application.server_path);
        if !mounted_under(path, &mount) {
            fallback.get_or_insert_with(|| registration.renderer.clone());
            continue;
        }
        if best.as_ref().is_none_or(|(length, _)| mount.len() > *length) {
            best = Some((mount.len(), registration.renderer.clone()));
        }
    }
    best.map(|(_, renderer)| renderer).or(fallback)
}

/// Re-renders stale entries through whichever renderer of the application
/// is live when the refresh runs.
struct PageRefresher {
    application: String,
    registrations: Weak<Registrations>,
}

#[async_trait]
impl CacheRefresher for PageRefresher {
    async fn refresh(&self, key: &str) -> Result<Bytes, CacheError> {
        let url = Url::parse(key).map_err(|err| CacheError::refresh(key, err))?;
        let renderer = self
            .registrations
            .upgrade()
            .and_then(|registrations| live_renderer(&registrations, &self.application, url.path()))
            .ok_or_else(|| {
                CacheError::refresh(
                    key,
                    format!("no renderer is started for `{}`", self.application),
                )
            })?;
        renderer
            .render(cache_request(url))
            .await
            .map_err(|err| CacheError::refresh(key, err))
    }
}

/// Owns every renderer registration and per-application cache.
///
/// Caches live in the manager rather than in a registration, so a renderer
/// that is stopped and started again keeps its renderings.
pub struct LifecycleManager {
    renderer: RendererSettings,
    http_client: HttpClientSettings,
    cache: CacheConfig,
    bus: Arc<dyn HandlerBus>,
    engine: Arc<dyn RenderEngine>,
    outbound: Arc<dyn OutboundClient>,
    /// Named clients a programmatic render may select instead of `outbound`.
    clients: HashMap<String, Arc<dyn OutboundClient>>,
    observer: Arc<dyn RenderObserver>,
    caches: CacheRegistry,
    registrations: Arc<Registrations>,
}

impl LifecycleManager {
    pub fn new(
        renderer: RendererSettings,
        http_client: HttpClientSettings,
        cache: CacheConfig,
        bus: Arc<dyn HandlerBus>,
        engine: Arc<dyn RenderEngine>,
        outbound: Arc<dyn OutboundClient>,
    ) -> Self {
        Self {
            renderer,
            http_client,
            cache,
            bus,
            engine,
            outbound,
            clients: HashMap::new(),
            observer: Arc::new(TelemetryObserver),
            caches: CacheRegistry::new(Arc::new(MemoryCacheProvider::new())),
            registrations: Arc::new(DashMap::new()),
        }
    }

    pub fn with_cache_provider(mut self, provider: Arc<dyn CacheProvider>) -> Self {
        self.caches = CacheRegistry::new(provider);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RenderObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register an outbound client under `id` for programmatic renders.
    pub fn with_outbound_client(
        mut self,
        id: impl Into<String>,
        client: Arc<dyn OutboundClient>,
    ) -> Self {
        self.clients.insert(id.into(), client);
        self
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.renderer
    }

    /// Register a renderer for the application's mount path and warm it up.
    #[instrument(skip_all, fields(application = %application.id, path = %application.server_path))]
    pub async fn start(&self, application: Application) -> Result<(), LifecycleError> {
        let key = (application.id.clone(), application.server_path.clone());
        let (renderer, application) = match self.registrations.entry(key) {
            Entry::Occupied(_) => {
                return Err(LifecycleError::AlreadyStarted {
                    application: application.id,
                    path: application.server_path,
                });
            }
            Entry::Vacant(vacant) => {
                let registration = vacant.insert(self.build(application)?);
                info!(
                    target = "prerender::lifecycle",
                    application = %registration.application.id,
                    path = %registration.application.server_path,
                    cached = registration.coordinator.cache().is_some(),
                    "renderer started"
                );
                (
                    registration.renderer.clone(),
                    registration.application.clone(),
                )
            }
        };

        if self.renderer.warmup && !self.renderer.development {
            self.warm_up(&renderer, &application).await;
        }
        Ok(())
    }

    /// Render pipeline for `dispatcher`, falling back to `outbound`.
    pub(crate) fn page_renderer(
        &self,
        dispatcher: Arc<dyn Dispatcher>,
        outbound: Arc<dyn OutboundClient>,
    ) -> Arc<PageRenderer> {
        let bridge = RenderBridge::new(dispatcher, outbound)
            .with_user_agent(self.renderer.user_agent.clone())
            .with_follow_redirects(self.http_client.follow_redirects)
            .with_max_body_bytes(self.renderer.max_body_bytes.get());
        Arc::new(PageRenderer::new(
            self.engine.clone(),
            Arc::new(bridge),
            EngineDefaults::from(&self.renderer),
        ))
    }

    pub(crate) fn outbound_client(&self, id: &str) -> Option<Arc<dyn OutboundClient>> {
        self.clients.get(id).cloned()
    }

    fn build(&self, application: Application) -> Result<Registration, LifecycleError> {
        let gate = BotGate::from_settings(&self.renderer)?;
        let renderer = self.page_renderer(application.dispatcher.clone(), self.outbound.clone());

        let mut coordinator = RenderCoordinator::new(
            application.id.clone(),
            gate,
            renderer.clone(),
            self.observer.clone(),
        )
        .with_secure(application.secure);

        if self.cache.enabled {
            let cache = self.caches.get_or_create(&application.id, || CacheSpec {
                name: application.id.clone(),
                max_entries: self.cache.max_entries,
                ttl: self.cache.ttl,
                refresher: Arc::new(PageRefresher {
                    application: application.id.clone(),
                    registrations: Arc::downgrade(&self.registrations),
                }),
            })?;
            coordinator = coordinator.with_cache(cache);
        }

        let coordinator = Arc::new(coordinator);
        let subscription = self.bus.subscribe(
            &application.server_path,
            coordinator.clone(),
            Priority::Lowest,
        );

        Ok(Registration {
            application,
            renderer,
            coordinator,
            subscription,
        })
    }

    /// Render the root page once per locale, or once without a locale when
    /// none are configured, so the application's own caches are populated
    /// before crawlers arrive. Failures are logged.
    async fn warm_up(&self, renderer: &PageRenderer, application: &Application) {
        let Some(root) = application.root_url() else {
            return;
        };

        let languages: Vec<Option<&str>> = if application.languages.is_empty() {
            vec![None]
        } else {
            application.languages.iter().map(|language| Some(language.as_str())).collect()
        };

        let renders = languages.into_iter().map(|language| {
            let root = root.clone();
            async move {
                let mut request = RenderRequest::get(root).with_ssr(true).with_css(false);
                if let Some(language) = language {
                    match HeaderValue::from_str(&format!("language={language}")) {
                        Ok(cookie) => request = request.with_header(header::COOKIE, cookie),
                        Err(err) => {
                            warn!(target = "prerender::lifecycle", language, error = %err, "invalid warm-up locale");
                            return;
                        }
                    }
                }
                match renderer.render(request).await {
                    Ok(bytes) => info!(
                        target = "prerender::lifecycle",
                        application = %application.id,
                        language,
                        bytes = bytes.len(),
                        "warm-up render complete"
                    ),
                    Err(err) => warn!(
                        target = "prerender::lifecycle",
                        application = %application.id,
                        language,
                        error = %err,
                        "warm-up render failed"
                    ),
                }
            }
        });
        join_all(renders).await;
    }

    /// Unsubscribe the renderer. Its cache is kept.
    pub fn stop(&self, application: &str, path: &str) -> Result<(), LifecycleError> {
        let Some((_, registration)) = self
            .registrations
            .remove(&(application.to_string(), path.to_string()))
        else {
            return Err(LifecycleError::NotStarted {
                application: application.to_string(),
                path: path.to_string(),
            });
        };
        registration.subscription.unsubscribe();
        info!(target = "prerender::lifecycle", application, path, "renderer stopped");
        Ok(())
    }

    pub fn is_started(&self, application: &str, path: &str) -> bool {
        self.registrations
            .contains_key(&(application.to_string(), path.to_string()))
    }

    pub fn cache(&self, application: &str) -> Option<RenderCache> {
        self.caches.get(application)
    }

    pub(crate) fn renderer(&self, application: &str, path: &str) -> Option<Arc<PageRenderer>> {
        self.registrations
            .get(&(application.to_string(), path.to_string()))
            .map(|registration| registration.renderer.clone())
    }

    /// Any live registration of the application, preferring the root mount.
    pub(crate) fn application(&self, application: &str) -> Option<(Application, Arc<PageRenderer>)> {
        if let Some(registration) = self
            .registrations
            .get(&(application.to_string(), "/".to_string()))
        {
            return Some((registration.application.clone(), registration.renderer.clone()));
        }
        self.registrations
            .iter()
            .find(|registration| registration.key().0 == application)
            .map(|registration| (registration.application.clone(), registration.renderer.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{
        body::Body,
        http::{Request, Response},
    };
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::cache::CacheAction;
    use crate::config::Settings;
    use crate::infra::error::InfraError;
    use crate::lifecycle::HandlerChain;
    use crate::render::{
        DispatchOutcome, EngineError, NetworkAccess, PageLoad, RenderedDocument,
    };

    struct Offline;

    #[async_trait]
    impl Dispatcher for Offline {
        async fn dispatch(&self, _request: Request<Body>) -> Option<DispatchOutcome> {
            None
        }
    }

    #[async_trait]
    impl OutboundClient for Offline {
        async fn execute(
            &self,
            _request: Request<Bytes>,
            _secure: bool,
            _follow_redirects: bool,
        ) -> Result<Response<Bytes>, InfraError> {
            Err(InfraError::http("offline"))
        }
    }

    /// Records the cookie and SSR flag of every page it renders.
    #[derive(Default)]
    struct RecordingEngine {
        pages: Mutex<Vec<(String, Option<String>)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RenderEngine for RecordingEngine {
        async fn render(
            &self,
            page: PageLoad,
            _network: &dyn NetworkAccess,
        ) -> Result<RenderedDocument, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let cookie = page
                .request
                .headers
                .get(header::COOKIE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            self.pages
                .lock()
                .unwrap()
                .push((page.request.url.to_string(), cookie));
            Ok(RenderedDocument::Html("<html/>".to_string()))
        }
    }

    fn manager(
        chain: &HandlerChain,
        engine: Arc<RecordingEngine>,
        development: bool,
    ) -> LifecycleManager {
        let settings = Settings::defaults().unwrap();
        let mut renderer = settings.renderer;
        renderer.development = development;
        renderer.warmup = true;
        LifecycleManager::new(
            renderer,
            settings.http_client,
            CacheConfig::from(&settings.cache),
            Arc::new(chain.clone()),
            engine,
            Arc::new(Offline),
        )
    }

    fn application() -> Application {
        Application::new("shop", Arc::new(Offline))
            .with_virtual_host("shop.example.com")
            .with_secure(true)
            .with_languages(["en", "fr"])
    }

    #[tokio::test]
    async fn start_subscribes_and_warms_each_locale() {
        let chain = HandlerChain::new();
        let engine = Arc::new(RecordingEngine::default());
        let manager = manager(&chain, engine.clone(), false);

        manager.start(application()).await.unwrap();

        assert!(manager.is_started("shop", "/"));
        assert_eq!(chain.len(), 1);
        let mut pages = engine.pages.lock().unwrap().clone();
        pages.sort();
        assert_eq!(
            pages,
            vec![
                (
                    "https://shop.example.com/".to_string(),
                    Some("language=en".to_string())
                ),
                (
                    "https://shop.example.com/".to_string(),
                    Some("language=fr".to_string())
                ),
            ]
        );
    }

    #[tokio::test]
    async fn warm_up_without_locales_renders_root_once() {
        let chain = HandlerChain::new();
        let engine = Arc::new(RecordingEngine::default());
        let manager = manager(&chain, engine.clone(), false);

        manager
            .start(Application::new("shop", Arc::new(Offline)).with_virtual_host("shop.example.com"))
            .await
            .unwrap();

        assert_eq!(
            *engine.pages.lock().unwrap(),
            vec![("http://shop.example.com/".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn development_mode_skips_warm_up() {
        let chain = HandlerChain::new();
        let engine = Arc::new(RecordingEngine::default());
        let manager = manager(&chain, engine.clone(), true);

        manager.start(application()).await.unwrap();

        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let chain = HandlerChain::new();
        let manager = manager(&chain, Arc::new(RecordingEngine::default()), true);

        manager.start(application()).await.unwrap();
        let err = manager.start(application()).await.unwrap_err();

        assert!(matches!(err, LifecycleError::AlreadyStarted { .. }));
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn cache_survives_restart() {
        let chain = HandlerChain::new();
        let manager = manager(&chain, Arc::new(RecordingEngine::default()), true);

        manager.start(application()).await.unwrap();
        manager
            .cache("shop")
            .unwrap()
            .put("https://shop.example.com/", Bytes::from("kept"))
            .await
            .unwrap();

        manager.stop("shop", "/").unwrap();
        assert!(!manager.is_started("shop", "/"));
        assert!(chain.is_empty());

        manager.start(application()).await.unwrap();
        assert_eq!(
            manager
                .cache("shop")
                .unwrap()
                .get("https://shop.example.com/")
                .await
                .unwrap(),
            Some(Bytes::from("kept"))
        );
    }

    /// Claims every request and answers with its label.
    struct Labelled(&'static str);

    #[async_trait]
    impl Dispatcher for Labelled {
        async fn dispatch(&self, _request: Request<Body>) -> Option<DispatchOutcome> {
            Some(DispatchOutcome::Response(Response::new(Body::from(self.0))))
        }
    }

    /// Returns the page body the bridge delivered.
    struct Fetching;

    #[async_trait]
    impl RenderEngine for Fetching {
        async fn render(
            &self,
            page: PageLoad,
            network: &dyn NetworkAccess,
        ) -> Result<RenderedDocument, EngineError> {
            let response = network.fetch(page.request).await?;
            Ok(RenderedDocument::Html(
                String::from_utf8_lossy(&response.body).into_owned(),
            ))
        }
    }

    fn fetching_manager(chain: &HandlerChain) -> LifecycleManager {
        let settings = Settings::defaults().unwrap();
        let mut renderer = settings.renderer;
        renderer.warmup = false;
        LifecycleManager::new(
            renderer,
            settings.http_client,
            CacheConfig::from(&settings.cache),
            Arc::new(chain.clone()),
            Arc::new(Fetching),
            Arc::new(Offline),
        )
    }

    const ROOT: &str = "https://shop.example.com/";

    async fn refresh_root(cache: &RenderCache) -> CacheAction {
        let modified = OffsetDateTime::now_utc() + Duration::hours(1);
        cache
            .ensure_cached(ROOT, Some(modified), || async {
                Err(CacheError::render(ROOT, "entry exists"))
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn refresh_uses_the_renderer_started_last() {
        let chain = HandlerChain::new();
        let manager = fetching_manager(&chain);

        manager
            .start(Application::new("shop", Arc::new(Labelled("old"))))
            .await
            .unwrap();
        manager.stop("shop", "/").unwrap();
        manager
            .start(Application::new("shop", Arc::new(Labelled("new"))))
            .await
            .unwrap();

        let cache = manager.cache("shop").unwrap();
        cache.put(ROOT, Bytes::from("stale")).await.unwrap();

        assert_eq!(refresh_root(&cache).await, CacheAction::Refreshed);
        assert_eq!(cache.get(ROOT).await.unwrap(), Some(Bytes::from("new")));
    }

    #[tokio::test]
    async fn refresh_without_a_live_renderer_keeps_the_entry() {
        let chain = HandlerChain::new();
        let manager = fetching_manager(&chain);

        manager
            .start(Application::new("shop", Arc::new(Labelled("old"))))
            .await
            .unwrap();
        let cache = manager.cache("shop").unwrap();
        cache.put(ROOT, Bytes::from("stale")).await.unwrap();
        manager.stop("shop", "/").unwrap();

        assert_eq!(refresh_root(&cache).await, CacheAction::RefreshFailed);
        assert_eq!(cache.get(ROOT).await.unwrap(), Some(Bytes::from("stale")));
    }

    #[tokio::test]
    async fn refresh_prefers_the_mount_covering_the_page() {
        let chain = HandlerChain::new();
        let manager = fetching_manager(&chain);

        manager
            .start(Application::new("shop", Arc::new(Labelled("root"))))
            .await
            .unwrap();
        manager
            .start(
                Application::new("shop", Arc::new(Labelled("store")))
                    .with_server_path("/store"),
            )
            .await
            .unwrap();

        let cache = manager.cache("shop").unwrap();
        let page = "https://shop.example.com/store/item";
        cache.put(page, Bytes::from("stale")).await.unwrap();
        let modified = OffsetDateTime::now_utc() + Duration::hours(1);
        let action = cache
            .ensure_cached(page, Some(modified), move || async move {
                Err(CacheError::render(page, "entry exists"))
            })
            .await
            .unwrap();

        assert_eq!(action, CacheAction::Refreshed);
        assert_eq!(cache.get(page).await.unwrap(), Some(Bytes::from("store")));
    }

    #[tokio::test]
    async fn stopping_unknown_renderer_fails() {
        let chain = HandlerChain::new();
        let manager = manager(&chain, Arc::new(RecordingEngine::default()), true);

        assert!(matches!(
            manager.stop("shop", "/"),
            Err(LifecycleError::NotStarted { .. })
        ));
    }

    #[test]
    fn root_url_joins_mount_path() {
        let app = application().with_server_path("/store/");
        assert_eq!(
            app.root_url().unwrap().as_str(),
            "https://shop.example.com/store/"
        );
        assert!(Application::new("bare", Arc::new(Offline)).root_url().is_none());
    }
}
