//! Serves the rendering engine's network calls through the host's own
//! request pipeline.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Request, Response, Uri, header},
};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Limited};
use metrics::counter;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::infra::http_client::OutboundClient;

use super::dispatch::{
    DispatchOutcome, Dispatcher, ExceptionFormatter, PlainTextFormatter, RequestHook,
    ResponseHook,
};
use super::engine::NetworkAccess;
use super::error::BridgeError;
use super::types::{
    BridgeRequest, BridgeResponse, MARKER_HEADER, MARKER_VALUE, RENDERER_AGENT,
    REQUEST_TYPE_HEADER, RenderSession, SSR_REQUEST_TYPE,
};

const METRIC_BRIDGE_REQUEST_TOTAL: &str = "prerender_bridge_request_total";
const METRIC_BRIDGE_FALLBACK_TOTAL: &str = "prerender_bridge_fallback_total";
const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

const SCRIPT_MEDIA_TYPES: &[&str] = &[
    "application/javascript",
    "text/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "text/ecmascript",
];

pub struct RenderBridge {
    dispatcher: Arc<dyn Dispatcher>,
    outbound: Arc<dyn OutboundClient>,
    formatter: Arc<dyn ExceptionFormatter>,
    user_agent: String,
    follow_redirects: bool,
    max_body_bytes: usize,
}

impl RenderBridge {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, outbound: Arc<dyn OutboundClient>) -> Self {
        Self {
            dispatcher,
            outbound,
            formatter: Arc::new(PlainTextFormatter),
            user_agent: RENDERER_AGENT.to_string(),
            follow_redirects: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn ExceptionFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    /// `User-Agent` for sub-requests that carry none.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Serve one engine sub-request.
    ///
    /// The request is rewritten for the internal pipeline, passed through the
    /// dispatcher hooks and, when nothing claims it, sent over the network.
    /// The first non-empty script response of the session receives the
    /// session's injection text.
    #[instrument(
        skip_all,
        fields(session = %session.id(), method = %request.method, url = %request.url)
    )]
    pub async fn serve(
        &self,
        request: BridgeRequest,
        session: &RenderSession,
    ) -> Result<BridgeResponse, BridgeError> {
        let started_at = Instant::now();
        counter!(METRIC_BRIDGE_REQUEST_TOTAL).increment(1);

        let url = request.url.to_string();
        let secure = request.url.scheme() == "https";
        let mut prepared = self.prepare(request, session)?;

        if let RequestHook::Failed(err) = self.dispatcher.preprocess(&mut prepared).await {
            warn!(
                target = "prerender::bridge",
                error = %err,
                "request hook failed; answering with formatted error"
            );
            return self.finish(self.formatter.format(&*err), session, &url).await;
        }

        let (response, timings) = self.route(prepared, &url, secure).await?;
        let bridged = self.finish(response, session, &url).await?;
        debug!(
            target = "prerender::bridge",
            status = bridged.status.as_u16(),
            bytes = bridged.body.len(),
            internal_ms = timings.internal.map(millis),
            external_ms = timings.external.map(millis),
            altered_ms = timings.altered.map(millis),
            total_ms = millis(started_at.elapsed()),
            "bridge request served"
        );
        Ok(bridged)
    }

    /// Hand the prepared request to the dispatcher, falling back to the
    /// outbound client when no handler claims it.
    async fn route(
        &self,
        prepared: Request<Bytes>,
        url: &str,
        secure: bool,
    ) -> Result<(Response<Body>, Timings), BridgeError> {
        let mut timings = Timings::default();
        let fallback = snapshot(&prepared);

        let dispatch_started = Instant::now();
        let outcome = self.dispatcher.dispatch(prepared.map(Body::from)).await;
        let dispatch_elapsed = dispatch_started.elapsed();

        let response = match outcome {
            Some(DispatchOutcome::Response(response)) => {
                timings.internal = Some(dispatch_elapsed);
                let hook_started = Instant::now();
                match self.dispatcher.postprocess(response).await {
                    ResponseHook::Unchanged(response) => response,
                    ResponseHook::Replaced(response) => {
                        timings.altered = Some(hook_started.elapsed());
                        response
                    }
                    ResponseHook::Failed(err) => {
                        warn!(target = "prerender::bridge", error = %err, "response hook failed");
                        self.formatter.format(&*err)
                    }
                }
            }
            Some(DispatchOutcome::Failed(err)) => {
                timings.internal = Some(dispatch_elapsed);
                warn!(target = "prerender::bridge", error = %err, "internal handler failed");
                self.formatter.format(&*err)
            }
            None => {
                counter!(METRIC_BRIDGE_FALLBACK_TOTAL).increment(1);
                let external_started = Instant::now();
                let response = self
                    .outbound
                    .execute(fallback, secure, self.follow_redirects)
                    .await
                    .map_err(|source| BridgeError::Fallback {
                        url: url.to_string(),
                        source,
                    })?;
                timings.external = Some(external_started.elapsed());
                response.map(Body::from)
            }
        };
        Ok((response, timings))
    }

    fn prepare(
        &self,
        request: BridgeRequest,
        session: &RenderSession,
    ) -> Result<Request<Bytes>, BridgeError> {
        if !request.parameters.is_empty() {
            return Err(BridgeError::UnsupportedParameters {
                count: request.parameters.len(),
            });
        }

        let uri: Uri = request
            .url
            .as_str()
            .parse()
            .map_err(|err| BridgeError::invalid(request.url.as_str(), format!("{err}")))?;
        let authority = authority(&request.url)
            .ok_or_else(|| BridgeError::invalid(request.url.as_str(), "url has no host"))?;
        let host = HeaderValue::from_str(&authority)
            .map_err(|err| BridgeError::invalid(request.url.as_str(), format!("host: {err}")))?;

        let mut prepared = Request::new(request.body.unwrap_or_default());
        *prepared.method_mut() = request.method;
        *prepared.uri_mut() = uri;
        *prepared.headers_mut() = request.headers;

        let headers = prepared.headers_mut();
        if headers.get(header::HOST) != Some(&host) {
            headers.insert(header::HOST, host);
        }
        if !headers.contains_key(header::USER_AGENT) {
            let agent = HeaderValue::from_str(&self.user_agent).map_err(|err| {
                BridgeError::invalid(request.url.as_str(), format!("user agent: {err}"))
            })?;
            headers.insert(header::USER_AGENT, agent);
        }
        headers.insert(MARKER_HEADER, HeaderValue::from_static(MARKER_VALUE));
        if session.ssr() {
            headers.insert(
                REQUEST_TYPE_HEADER,
                HeaderValue::from_static(SSR_REQUEST_TYPE),
            );
        }
        if let Some(credential) = session.credential() {
            let value = HeaderValue::from_str(credential).map_err(|err| {
                BridgeError::invalid(request.url.as_str(), format!("credential: {err}"))
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(prepared)
    }

    async fn finish(
        &self,
        response: Response<Body>,
        session: &RenderSession,
        url: &str,
    ) -> Result<BridgeResponse, BridgeError> {
        let (parts, body) = response.into_parts();
        let collected = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|err| BridgeError::Body {
                url: url.to_string(),
                reason: err.to_string(),
            })?;

        let mut body = collected.to_bytes();
        let mut headers = parts.headers;

        if !body.is_empty() && is_script(&headers) {
            if let Some(script) = session.script() {
                if session.claim_injection() {
                    body = inject(script, &body);
                    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                    debug!(target = "prerender::bridge", url, "injected session script");
                }
            }
        }

        headers.remove(header::CONTENT_ENCODING);
        headers.remove(header::TRANSFER_ENCODING);

        Ok(BridgeResponse {
            status: parts.status,
            reason: parts
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers,
            body,
        })
    }
}

/// Time spent in each leg of one bridged request. A leg that did not run
/// stays `None`.
#[derive(Debug, Default, Clone, Copy)]
struct Timings {
    internal: Option<Duration>,
    external: Option<Duration>,
    altered: Option<Duration>,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Binds a bridge to one render session for the engine.
pub struct BridgeConnection<'a> {
    bridge: &'a RenderBridge,
    session: &'a RenderSession,
}

impl<'a> BridgeConnection<'a> {
    pub fn new(bridge: &'a RenderBridge, session: &'a RenderSession) -> Self {
        Self { bridge, session }
    }
}

#[async_trait]
impl NetworkAccess for BridgeConnection<'_> {
    async fn fetch(&self, request: BridgeRequest) -> Result<BridgeResponse, BridgeError> {
        self.bridge.serve(request, self.session).await
    }
}

/// `host[:port]`, with the port only when the URL states it explicitly.
pub(crate) fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn snapshot(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}

fn is_script(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|media| media.trim().to_ascii_lowercase())
        .is_some_and(|media| SCRIPT_MEDIA_TYPES.contains(&media.as_str()))
}

fn inject(script: &str, body: &Bytes) -> Bytes {
    let mut buffer = BytesMut::with_capacity(script.len() + 2 + body.len());
    buffer.extend_from_slice(script.as_bytes());
    buffer.extend_from_slice(b"\n\n");
    buffer.extend_from_slice(body);
    buffer.freeze()
}
