use std::{sync::Arc, time::Duration};

use axum::http::header;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::config::RendererSettings;

use super::bridge::{BridgeConnection, RenderBridge};
use super::engine::{EngineOptions, PageLoad, RenderEngine};
use super::error::RenderError;
use super::types::{BridgeRequest, RENDERER_AGENT, RenderRequest, RenderSession};

/// Engine settings shared by every render of a renderer instance.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    pub page_load_timeout: Duration,
    pub script_drain_timeout: Duration,
    pub throw_on_script_error: bool,
    /// Appended to the caller's `User-Agent` so the application can tell
    /// rendered traffic apart.
    pub agent_suffix: String,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            page_load_timeout: Duration::from_secs(30),
            script_drain_timeout: Duration::from_secs(10),
            throw_on_script_error: true,
            agent_suffix: RENDERER_AGENT.to_string(),
        }
    }
}

impl From<&RendererSettings> for EngineDefaults {
    fn from(settings: &RendererSettings) -> Self {
        Self {
            page_load_timeout: settings.page_load_timeout,
            script_drain_timeout: settings.script_drain_timeout,
            throw_on_script_error: settings.throw_on_script_error,
            agent_suffix: settings.user_agent.clone(),
        }
    }
}

/// Drives the engine over the bridge and returns the serialized page.
pub struct PageRenderer {
    engine: Arc<dyn RenderEngine>,
    bridge: Arc<RenderBridge>,
    defaults: EngineDefaults,
}

impl PageRenderer {
    pub fn new(
        engine: Arc<dyn RenderEngine>,
        bridge: Arc<RenderBridge>,
        defaults: EngineDefaults,
    ) -> Self {
        Self {
            engine,
            bridge,
            defaults,
        }
    }

    /// Render one page with a fresh session.
    #[instrument(skip_all, fields(url = %request.url, ssr = request.ssr))]
    pub async fn render(&self, request: RenderRequest) -> Result<Bytes, RenderError> {
        let session = RenderSession::new(&request);
        let options = self.options(&request);

        let page = PageLoad {
            request: BridgeRequest {
                method: request.method,
                url: request.url,
                headers: request.headers,
                body: request.body,
                parameters: Vec::new(),
            },
            options,
        };

        let connection = BridgeConnection::new(&self.bridge, &session);
        let document = self.engine.render(page, &connection).await?;
        let bytes = document.into_bytes();

        debug!(
            target = "prerender::render",
            session = %session.id(),
            bytes = bytes.len(),
            injected = session.injected(),
            "page rendered"
        );
        Ok(bytes)
    }

    fn options(&self, request: &RenderRequest) -> EngineOptions {
        let caller_agent = request
            .headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|agent| !agent.is_empty());
        let user_agent = match caller_agent {
            Some(agent) => format!("{agent} {}", self.defaults.agent_suffix),
            None => self.defaults.agent_suffix.clone(),
        };

        EngineOptions {
            page_load_timeout: self.defaults.page_load_timeout,
            script_drain_timeout: self.defaults.script_drain_timeout,
            css: request.css,
            throw_on_script_error: self.defaults.throw_on_script_error,
            language: request.language(),
            user_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{HeaderValue, Request, Response},
    };
    use url::Url;

    use super::*;
    use crate::infra::{error::InfraError, http_client::OutboundClient};
    use crate::render::dispatch::{DispatchOutcome, Dispatcher};
    use crate::render::engine::{NetworkAccess, RenderedDocument};
    use crate::render::error::EngineError;

    struct ScriptPage;

    #[async_trait]
    impl Dispatcher for ScriptPage {
        async fn dispatch(&self, request: Request<Body>) -> Option<DispatchOutcome> {
            let content_type = if request.uri().path().ends_with(".js") {
                "application/javascript"
            } else {
                "text/html"
            };
            Some(DispatchOutcome::Response(
                Response::builder()
                    .header(header::CONTENT_TYPE, content_type)
                    .body(Body::from("payload"))
                    .unwrap(),
            ))
        }
    }

    struct NoNetwork;

    #[async_trait]
    impl OutboundClient for NoNetwork {
        async fn execute(
            &self,
            _request: Request<Bytes>,
            _secure: bool,
            _follow_redirects: bool,
        ) -> Result<Response<Bytes>, InfraError> {
            Err(InfraError::http("offline"))
        }
    }

    /// Loads the page and then one script, recording the options it saw.
    #[derive(Default)]
    struct TwoStepEngine {
        seen: Mutex<Option<EngineOptions>>,
    }

    #[async_trait]
    impl RenderEngine for TwoStepEngine {
        async fn render(
            &self,
            page: PageLoad,
            network: &dyn NetworkAccess,
        ) -> Result<RenderedDocument, EngineError> {
            *self.seen.lock().unwrap() = Some(page.options.clone());
            let script_url = page.request.url.join("/app.js").unwrap();
            let html = network.fetch(page.request).await?;
            let script = network.fetch(BridgeRequest::get(script_url)).await?;
            Ok(RenderedDocument::Html(format!(
                "{}|{}",
                String::from_utf8_lossy(&html.body),
                String::from_utf8_lossy(&script.body)
            )))
        }
    }

    fn renderer(engine: Arc<TwoStepEngine>) -> PageRenderer {
        let bridge = RenderBridge::new(Arc::new(ScriptPage), Arc::new(NoNetwork));
        PageRenderer::new(engine, Arc::new(bridge), EngineDefaults::default())
    }

    #[tokio::test]
    async fn renders_with_session_script_and_browser_identity() {
        let engine = Arc::new(TwoStepEngine::default());
        let renderer = renderer(engine.clone());

        let mut request = RenderRequest::get(Url::parse("https://example.com/").unwrap())
            .with_header(header::USER_AGENT, HeaderValue::from_static("Googlebot/2.1"))
            .with_header(
                header::ACCEPT_LANGUAGE,
                HeaderValue::from_static("en-US,en;q=0.5"),
            )
            .with_css(false);
        request.inject_script = Some("init();".to_string());

        let bytes = renderer.render(request).await.unwrap();
        assert_eq!(bytes, Bytes::from("payload|init();\n\npayload"));

        let options = engine.seen.lock().unwrap().clone().unwrap();
        assert_eq!(options.user_agent, "Googlebot/2.1 Prerender/1.0");
        assert_eq!(options.language.as_deref(), Some("en-US"));
        assert!(!options.css);
    }

    #[tokio::test]
    async fn bare_request_uses_renderer_agent() {
        let engine = Arc::new(TwoStepEngine::default());
        let renderer = renderer(engine.clone());

        renderer
            .render(RenderRequest::get(Url::parse("https://example.com/").unwrap()))
            .await
            .unwrap();

        let options = engine.seen.lock().unwrap().clone().unwrap();
        assert_eq!(options.user_agent, RENDERER_AGENT);
        assert!(options.language.is_none());
        assert!(options.css);
    }
}
