//! Seams between the bridge and the host's request pipeline.

use std::error::Error as StdError;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
    response::IntoResponse,
};
use bytes::Bytes;
use tower::ServiceExt;

use crate::error::HttpError;

pub type HookError = Box<dyn StdError + Send + Sync>;

/// Result of the request-phase hook.
pub enum RequestHook {
    Continue,
    Failed(HookError),
}

/// Result of handing a request to the pipeline.
pub enum DispatchOutcome {
    Response(Response<Body>),
    Failed(HookError),
}

/// Result of the response-transform hook.
pub enum ResponseHook {
    Unchanged(Response<Body>),
    Replaced(Response<Body>),
    Failed(HookError),
}

/// The host's internal request pipeline.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Inspect or amend a request before it is handled.
    async fn preprocess(&self, _request: &mut Request<Bytes>) -> RequestHook {
        RequestHook::Continue
    }

    /// Handle a request. `None` means nothing in the pipeline claims it.
    async fn dispatch(&self, request: Request<Body>) -> Option<DispatchOutcome>;

    /// Post-process a produced response.
    async fn postprocess(&self, response: Response<Body>) -> ResponseHook {
        ResponseHook::Unchanged(response)
    }
}

/// Turns pipeline failures into responses the engine can consume.
pub trait ExceptionFormatter: Send + Sync {
    fn format(&self, error: &(dyn StdError + 'static)) -> Response<Body>;
}

/// Answers every failure with a plain `500`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextFormatter;

impl ExceptionFormatter for PlainTextFormatter {
    fn format(&self, error: &(dyn StdError + 'static)) -> Response<Body> {
        HttpError::from_error(
            "render::dispatch::PlainTextFormatter",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            error,
        )
        .into_response()
    }
}

/// Claims nothing, so every sub-request goes out over the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkOnly;

#[async_trait]
impl Dispatcher for NetworkOnly {
    async fn dispatch(&self, _request: Request<Body>) -> Option<DispatchOutcome> {
        None
    }
}

/// [`Dispatcher`] over an axum [`Router`].
///
/// Requests for hosts outside `hosts` are left unclaimed so the bridge falls
/// back to the network. An empty host list claims everything.
#[derive(Clone)]
pub struct RouterDispatcher {
    router: Router,
    hosts: Vec<String>,
}

impl RouterDispatcher {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            hosts: Vec::new(),
        }
    }

    pub fn for_hosts<I, S>(router: Router, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            router,
            hosts: hosts
                .into_iter()
                .map(|host| host.into().to_ascii_lowercase())
                .collect(),
        }
    }

    fn serves(&self, request: &Request<Body>) -> bool {
        if self.hosts.is_empty() {
            return true;
        }
        let host = request.uri().host().map(str::to_string).or_else(|| {
            request
                .headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .map(|value| strip_port(value).to_string())
        });
        host.is_some_and(|host| {
            self.hosts
                .iter()
                .any(|served| served.eq_ignore_ascii_case(&host))
        })
    }
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return authority
            .split_once(']')
            .map_or(authority, |(host, _)| host.trim_start_matches('['));
    }
    authority
        .rsplit_once(':')
        .map_or(authority, |(host, _)| host)
}

#[async_trait]
impl Dispatcher for RouterDispatcher {
    async fn dispatch(&self, request: Request<Body>) -> Option<DispatchOutcome> {
        if !self.serves(&request) {
            return None;
        }
        match self.router.clone().oneshot(request).await {
            Ok(response) => Some(DispatchOutcome::Response(response)),
            Err(never) => match never {},
        }
    }
}
