//! Programmatic entry points for rendering and cache maintenance.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Method, Response, header},
};
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, instrument};
use url::Url;

use crate::cache::{CacheAction, CacheError};
use crate::lifecycle::{LifecycleManager, cache_request};
use crate::render::{PageRenderer, RenderError, RenderRequest, authority, wrap_into_response};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no renderer is started for `{application}`")]
    NotStarted { application: String },
    #[error("caching is disabled for `{application}`")]
    CacheDisabled { application: String },
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid method `{0}`")]
    InvalidMethod(String),
    #[error("invalid host `{0}`")]
    InvalidHost(String),
    #[error("unknown outbound client `{0}`")]
    UnknownClient(String),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Parameters of a programmatic render.
#[derive(Debug, Clone, Default)]
pub struct RenderInvocation {
    /// HTTP method; `GET` when absent.
    pub method: Option<String>,
    /// Absolute URL, or a path resolved against the application's host.
    pub url: String,
    /// Request headers. When absent only `Host` and `Content-Length: 0` are sent.
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
    pub credential: Option<String>,
    /// Outbound client registered on the manager, used for sub-requests no
    /// internal handler claims. The manager's default client when absent.
    pub outbound_client: Option<String>,
    pub inject_script: Option<String>,
    /// Skip marking the render's sub-requests as server-side.
    pub disable_ssr_bypass: bool,
    pub disable_css: bool,
    pub host_override: Option<String>,
}

impl RenderInvocation {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct RenderService {
    manager: Arc<LifecycleManager>,
}

impl RenderService {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Render a page of a started application. The result is not cached;
    /// empty output answers `204 No Content`.
    #[instrument(skip_all, fields(application = %application, url = %invocation.url))]
    pub async fn render(
        &self,
        application: &str,
        invocation: RenderInvocation,
    ) -> Result<Response<Body>, ServiceError> {
        let (app, renderer) =
            self.manager
                .application(application)
                .ok_or_else(|| ServiceError::NotStarted {
                    application: application.to_string(),
                })?;
        let renderer = match invocation.outbound_client.as_deref() {
            Some(id) => {
                let client = self
                    .manager
                    .outbound_client(id)
                    .ok_or_else(|| ServiceError::UnknownClient(id.to_string()))?;
                self.manager.page_renderer(app.dispatcher.clone(), client)
            }
            None => renderer,
        };

        let url = resolve_url(
            &invocation.url,
            invocation.host_override.as_deref(),
            app.virtual_host.as_deref(),
            app.secure,
        )?;
        let host = invocation
            .host_override
            .clone()
            .or_else(|| authority(&url))
            .or_else(|| app.virtual_host.clone())
            .ok_or_else(|| ServiceError::InvalidHost(invocation.url.clone()))?;
        let host = HeaderValue::from_str(&host).map_err(|_| ServiceError::InvalidHost(host))?;

        let headers = match invocation.headers {
            Some(mut headers) => {
                headers.entry(header::HOST).or_insert(host);
                headers
            }
            None => {
                let mut headers = HeaderMap::new();
                headers.insert(header::HOST, host);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                headers
            }
        };

        let method = match invocation.method.as_deref().map(str::trim) {
            Some(method) if !method.is_empty() => {
                let upper = method.to_ascii_uppercase();
                Method::from_bytes(upper.as_bytes())
                    .map_err(|_| ServiceError::InvalidMethod(method.to_string()))?
            }
            _ => Method::GET,
        };

        let request = RenderRequest {
            method,
            url,
            headers,
            body: invocation.body,
            credential: invocation.credential,
            inject_script: invocation.inject_script,
            ssr: !invocation.disable_ssr_bypass,
            css: !invocation.disable_css,
        };

        let bytes = renderer.render(request).await?;
        Ok(wrap_into_response(bytes))
    }

    /// Make sure `url` has a current rendering in the application's cache.
    ///
    /// `renderer` is the mount path of the renderer that produces missing
    /// entries.
    #[instrument(skip_all, fields(application = %application, renderer = %renderer, url = %url))]
    pub async fn cache_url(
        &self,
        application: &str,
        renderer: &str,
        url: &str,
        last_modified: Option<OffsetDateTime>,
    ) -> Result<CacheAction, ServiceError> {
        let page_renderer =
            self.manager
                .renderer(application, renderer)
                .ok_or_else(|| ServiceError::NotStarted {
                    application: application.to_string(),
                })?;
        let cache = self
            .manager
            .cache(application)
            .ok_or_else(|| ServiceError::CacheDisabled {
                application: application.to_string(),
            })?;
        let parsed = Url::parse(url).map_err(|err| ServiceError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

        let action = cache
            .ensure_cached(url, last_modified, || render_for_cache(page_renderer, parsed))
            .await?;
        debug!(target = "prerender::service", application, url, ?action, "cache_url");
        Ok(action)
    }

    pub async fn is_cached(&self, application: &str, url: &str) -> Result<bool, ServiceError> {
        match self.manager.cache(application) {
            Some(cache) => Ok(cache.contains(url).await?),
            None => Ok(false),
        }
    }
}

async fn render_for_cache(renderer: Arc<PageRenderer>, url: Url) -> Result<Bytes, CacheError> {
    let key = url.to_string();
    renderer
        .render(cache_request(url))
        .await
        .map_err(|err| CacheError::render(key, err))
}

fn resolve_url(
    raw: &str,
    host_override: Option<&str>,
    virtual_host: Option<&str>,
    secure: bool,
) -> Result<Url, ServiceError> {
    let invalid = |reason: String| ServiceError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    match Url::parse(raw) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let host = host_override
                .or(virtual_host)
                .ok_or_else(|| invalid("relative url and no host to resolve it".to_string()))?;
            let scheme = if secure { "https" } else { "http" };
            let base = Url::parse(&format!("{scheme}://{host}/"))
                .map_err(|err| invalid(err.to_string()))?;
            base.join(raw).map_err(|err| invalid(err.to_string()))
        }
        Err(err) => Err(invalid(err.to_string())),
    }
}
