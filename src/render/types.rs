use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use url::Url;
use uuid::Uuid;

/// Loop-prevention marker. Present on every request the bridge issues; any
/// inbound request carrying it is never rendered again.
pub const MARKER_HEADER: HeaderName = HeaderName::from_static("x-prerender");
pub const MARKER_VALUE: &str = "false";

/// Tells the application a request belongs to a server-side render.
pub const REQUEST_TYPE_HEADER: HeaderName = HeaderName::from_static("x-request-type");
pub const SSR_REQUEST_TYPE: &str = "ssr";

/// Identifies the renderer on requests that carry no `User-Agent`.
pub const RENDERER_AGENT: &str = "Prerender/1.0";

/// One top-level page render.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub credential: Option<String>,
    pub inject_script: Option<String>,
    pub ssr: bool,
    pub css: bool,
}

impl RenderRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            credential: None,
            inject_script: None,
            ssr: false,
            css: true,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_ssr(mut self, ssr: bool) -> Self {
        self.ssr = ssr;
        self
    }

    pub fn with_css(mut self, css: bool) -> Self {
        self.css = css;
        self
    }

    /// First language of `Accept-Language`, without its quality value.
    pub fn language(&self) -> Option<String> {
        let raw = self.headers.get(header::ACCEPT_LANGUAGE)?.to_str().ok()?;
        raw.split(',')
            .next()
            .and_then(|first| first.split(';').next())
            .map(str::trim)
            .filter(|language| !language.is_empty())
            .map(str::to_string)
    }
}

/// One network request issued by the rendering engine.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Engine-level form parameters. The bridge cannot encode them and
    /// rejects any request that carries some.
    pub parameters: Vec<(String, String)>,
}

impl BridgeRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            parameters: Vec::new(),
        }
    }
}

/// Fully buffered answer to a [`BridgeRequest`].
#[derive(Debug, Clone)]
pub struct BridgeResponse {
    pub status: StatusCode,
    pub reason: String,
    /// Never contains `Content-Encoding` or `Transfer-Encoding`.
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BridgeResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// Per-render state shared by every sub-request of one page render.
#[derive(Debug)]
pub struct RenderSession {
    id: Uuid,
    injected: AtomicBool,
    ssr: bool,
    script: Option<String>,
    credential: Option<String>,
}

impl RenderSession {
    pub fn new(request: &RenderRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            injected: AtomicBool::new(false),
            ssr: request.ssr,
            script: request.inject_script.clone(),
            credential: request.credential.clone(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn ssr(&self) -> bool {
        self.ssr
    }

    pub fn script(&self) -> Option<&str> {
        self.script.as_deref()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn injected(&self) -> bool {
        self.injected.load(Ordering::Acquire)
    }

    /// Claim the single injection slot. Returns `true` for exactly one caller.
    pub(crate) fn claim_injection(&self) -> bool {
        self.injected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
