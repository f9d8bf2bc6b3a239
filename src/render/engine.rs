//! Rendering engine contract.
//!
//! The engine loads a page, runs its scripts and serializes the resulting
//! document. Every network call it makes goes through [`NetworkAccess`], which
//! the crate backs with the bridge.

use std::{sync::OnceLock, time::Duration};

use async_trait::async_trait;
use axum::http::{HeaderValue, header};
use bytes::Bytes;
use regex::Regex;
use tracing::debug;

use super::error::{BridgeError, EngineError};
use super::types::{BridgeRequest, BridgeResponse};

/// Network access handed to the engine for the duration of one render.
#[async_trait]
pub trait NetworkAccess: Send + Sync {
    async fn fetch(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError>;
}

/// Browser behaviour for one render.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub page_load_timeout: Duration,
    /// How long to let background scripts settle after load.
    pub script_drain_timeout: Duration,
    pub css: bool,
    pub throw_on_script_error: bool,
    pub language: Option<String>,
    pub user_agent: String,
}

/// Top-level page to render.
#[derive(Debug, Clone)]
pub struct PageLoad {
    pub request: BridgeRequest,
    pub options: EngineOptions,
}

/// Serialized result of a render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedDocument {
    Html(String),
    Xml(String),
    Text(String),
    Binary(Bytes),
}

impl RenderedDocument {
    /// Bytes sent to the crawler. Markup loses the `//<![CDATA[` and `//]]>`
    /// wrappers scripts carry after serialization.
    pub fn into_bytes(self) -> Bytes {
        match self {
            RenderedDocument::Html(markup) | RenderedDocument::Xml(markup) => {
                Bytes::from(strip_cdata_wrappers(&markup))
            }
            RenderedDocument::Text(text) => Bytes::from(text),
            RenderedDocument::Binary(bytes) => bytes,
        }
    }

    /// Classify a response body by its content type.
    pub fn from_response(response: BridgeResponse) -> Self {
        let media = response
            .content_type()
            .and_then(|value| value.split(';').next())
            .map(|media| media.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let text = match String::from_utf8(response.body.to_vec()) {
            Ok(text) => text,
            Err(_) => return RenderedDocument::Binary(response.body),
        };

        if media == "text/html" || media == "application/xhtml+xml" {
            RenderedDocument::Html(text)
        } else if media.ends_with("/xml") || media.ends_with("+xml") {
            RenderedDocument::Xml(text)
        } else if media.starts_with("text/") || media.is_empty() {
            RenderedDocument::Text(text)
        } else {
            RenderedDocument::Binary(response.body)
        }
    }
}

fn strip_cdata_wrappers(markup: &str) -> String {
    static CDATA: OnceLock<Regex> = OnceLock::new();
    let pattern = CDATA.get_or_init(|| {
        Regex::new(r"//\s*<!\[CDATA\[|//\s*\]\]>").expect("cdata wrapper regex is valid")
    });
    pattern.replace_all(markup, "").into_owned()
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn render(
        &self,
        page: PageLoad,
        network: &dyn NetworkAccess,
    ) -> Result<RenderedDocument, EngineError>;
}

/// Engine that fetches the page and returns it as served, without executing
/// scripts. Useful for smoke tests of the bridge and for crawlers of
/// server-rendered sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEngine;

#[async_trait]
impl RenderEngine for PassthroughEngine {
    async fn render(
        &self,
        page: PageLoad,
        network: &dyn NetworkAccess,
    ) -> Result<RenderedDocument, EngineError> {
        let PageLoad {
            mut request,
            options,
        } = page;

        if let Ok(agent) = HeaderValue::from_str(&options.user_agent) {
            request.headers.insert(header::USER_AGENT, agent);
        }
        if let Some(language) = options.language.as_deref() {
            if let Ok(value) = HeaderValue::from_str(language) {
                request.headers.insert(header::ACCEPT_LANGUAGE, value);
            }
        }

        let url = request.url.clone();
        let response = tokio::time::timeout(options.page_load_timeout, network.fetch(request))
            .await
            .map_err(|_| EngineError::Timeout(options.page_load_timeout))??;

        debug!(
            target = "prerender::engine",
            %url,
            status = response.status.as_u16(),
            "page fetched without script execution"
        );
        Ok(RenderedDocument::from_response(response))
    }
}
