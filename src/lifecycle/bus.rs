//! Host request bus: ordered handlers consulted before the application.

use std::{
    cmp::Reverse,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::State,
    http::{Request, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{instrument, warn};

use crate::cache::lock::{rw_read, rw_write};
use crate::render::{Handled, RenderError, RenderCoordinator};

const SOURCE: &str = "prerender::lifecycle::bus";

/// Handlers with higher priority run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, parts: &Parts) -> Result<Handled, RenderError>;
}

#[async_trait]
impl RequestHandler for RenderCoordinator {
    async fn handle(&self, parts: &Parts) -> Result<Handled, RenderError> {
        RenderCoordinator::handle(self, parts).await
    }
}

/// Live registration on a [`HandlerBus`].
pub trait Subscription: Send + Sync {
    /// Remove the handler. Returns `false` when it was already gone.
    fn unsubscribe(&self) -> bool;
}

pub trait HandlerBus: Send + Sync {
    /// Register `handler` for requests under `mount`.
    fn subscribe(
        &self,
        mount: &str,
        handler: Arc<dyn RequestHandler>,
        priority: Priority,
    ) -> Box<dyn Subscription>;
}

struct Registration {
    id: u64,
    mount: String,
    priority: Priority,
    handler: Arc<dyn RequestHandler>,
}

#[derive(Default)]
struct ChainInner {
    next_id: AtomicU64,
    handlers: RwLock<Vec<Registration>>,
}

/// In-process [`HandlerBus`], mounted into axum with [`prerender_layer`].
#[derive(Clone, Default)]
pub struct HandlerChain {
    inner: Arc<ChainInner>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.inner.handlers, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer the request to each matching handler in priority order. The
    /// first rendering wins; `None` lets the request through.
    pub async fn dispatch(&self, parts: &Parts) -> Option<Response> {
        let path = parts.uri.path();
        let handlers: Vec<Arc<dyn RequestHandler>> = {
            let guard = rw_read(&self.inner.handlers, SOURCE, "dispatch");
            guard
                .iter()
                .filter(|registration| mounted_under(path, &registration.mount))
                .map(|registration| registration.handler.clone())
                .collect()
        };

        for handler in handlers {
            match handler.handle(parts).await {
                Ok(Handled::Pass) => continue,
                Ok(Handled::Rendered(response)) => return Some(response),
                Err(err) => {
                    warn!(
                        target = "prerender::lifecycle",
                        uri = %parts.uri,
                        error = %err,
                        "render failed"
                    );
                    return Some(err.into_response());
                }
            }
        }
        None
    }

    fn remove(&self, id: u64) -> bool {
        let mut handlers = rw_write(&self.inner.handlers, SOURCE, "unsubscribe");
        let before = handlers.len();
        handlers.retain(|registration| registration.id != id);
        handlers.len() != before
    }
}

impl HandlerBus for HandlerChain {
    fn subscribe(
        &self,
        mount: &str,
        handler: Arc<dyn RequestHandler>,
        priority: Priority,
    ) -> Box<dyn Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handlers = rw_write(&self.inner.handlers, SOURCE, "subscribe");
        handlers.push(Registration {
            id,
            mount: normalize_mount(mount),
            priority,
            handler,
        });
        // Stable sort keeps registration order within a priority.
        handlers.sort_by_key(|registration| Reverse(registration.priority));

        Box::new(ChainSubscription {
            chain: self.clone(),
            id,
        })
    }
}

struct ChainSubscription {
    chain: HandlerChain,
    id: u64,
}

impl Subscription for ChainSubscription {
    fn unsubscribe(&self) -> bool {
        self.chain.remove(self.id)
    }
}

pub(super) fn normalize_mount(mount: &str) -> String {
    let trimmed = mount.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub(super) fn mounted_under(path: &str, mount: &str) -> bool {
    if mount == "/" {
        return true;
    }
    path.strip_prefix(mount)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// Middleware running the handler chain ahead of the wrapped routes.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn prerender_layer(
    State(chain): State<HandlerChain>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if chain.is_empty() {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    if let Some(response) = chain.dispatch(&parts).await {
        return response;
    }
    next.run(Request::from_parts(parts, body)).await
}
