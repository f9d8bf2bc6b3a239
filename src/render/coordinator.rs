//! End-to-end handling of one inbound request.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    http::{HeaderValue, Response, StatusCode, header, request::Parts},
};
use bytes::Bytes;
use tracing::{debug, instrument};
use url::Url;

use crate::cache::RenderCache;

use super::error::RenderError;
use super::events::{RenderEvent, RenderObserver, RenderOutcome};
use super::gate::BotGate;
use super::page::PageRenderer;
use super::types::{MARKER_HEADER, RenderRequest};

/// What the coordinator did with a request.
pub enum Handled {
    /// Not for us; the host pipeline carries on.
    Pass,
    Rendered(Response<Body>),
}

impl std::fmt::Debug for Handled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handled::Pass => f.write_str("Pass"),
            Handled::Rendered(response) => f
                .debug_tuple("Rendered")
                .field(&response.status())
                .finish(),
        }
    }
}

pub struct RenderCoordinator {
    application: String,
    gate: BotGate,
    renderer: Arc<PageRenderer>,
    cache: Option<RenderCache>,
    observer: Arc<dyn RenderObserver>,
    secure: bool,
}

impl RenderCoordinator {
    pub fn new(
        application: impl Into<String>,
        gate: BotGate,
        renderer: Arc<PageRenderer>,
        observer: Arc<dyn RenderObserver>,
    ) -> Self {
        Self {
            application: application.into(),
            gate,
            renderer,
            cache: None,
            observer,
            secure: false,
        }
    }

    pub fn with_cache(mut self, cache: RenderCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Canonical URLs use `https` when set.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn cache(&self) -> Option<&RenderCache> {
        self.cache.as_ref()
    }

    #[instrument(skip_all, fields(application = %self.application, uri = %parts.uri))]
    pub async fn handle(&self, parts: &Parts) -> Result<Handled, RenderError> {
        if parts.headers.contains_key(MARKER_HEADER) {
            return Ok(Handled::Pass);
        }

        let target = parts
            .uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or("/");
        if !self.gate.should_render(target, &parts.headers) {
            return Ok(Handled::Pass);
        }

        let url = canonical_url(parts, self.secure)?;
        let key = url.as_str().to_string();
        let client = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if let Some(cache) = &self.cache
            && let Some(bytes) = cache.get(&key).await?
        {
            self.observer.observe(&RenderEvent {
                application: self.application.clone(),
                url: key,
                client,
                outcome: RenderOutcome::CacheHit,
            });
            return Ok(Handled::Rendered(wrap_into_response(bytes)));
        }

        let started = Instant::now();
        let request = RenderRequest::get(url).with_headers(parts.headers.clone());
        let bytes = self.renderer.render(request).await?;
        let elapsed = started.elapsed();

        if let Some(cache) = &self.cache {
            cache.put(&key, bytes.clone()).await?;
        }

        debug!(
            target = "prerender::render",
            url = %key,
            bytes = bytes.len(),
            "render complete"
        );
        self.observer.observe(&RenderEvent {
            application: self.application.clone(),
            url: key,
            client,
            outcome: RenderOutcome::CacheMiss { elapsed },
        });
        Ok(Handled::Rendered(wrap_into_response(bytes)))
    }
}

/// Absolute URL of the inbound request, used as the cache key.
///
/// The authority comes from `Host`, falling back to the request URI.
pub fn canonical_url(parts: &Parts, secure: bool) -> Result<Url, RenderError> {
    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
        .ok_or_else(|| RenderError::invalid_url("request has no host"))?;

    let scheme = if secure { "https" } else { "http" };
    let target = parts
        .uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");

    Url::parse(&format!("{scheme}://{authority}{target}"))
        .map_err(|err| RenderError::invalid_url(err.to_string()))
}

/// Rendered bytes as an HTTP response; empty output becomes `204`.
pub fn wrap_into_response(bytes: Bytes) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    let length = HeaderValue::from(bytes.len());

    if bytes.is_empty() {
        *response.status_mut() = StatusCode::NO_CONTENT;
    } else {
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html"),
        );
        *response.body_mut() = Body::from(bytes);
    }
    response.headers_mut().insert(header::CONTENT_LENGTH, length);
    response
}
