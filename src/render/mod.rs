//! Crawler detection, the engine bridge and request coordination.

mod bridge;
mod coordinator;
mod dispatch;
mod engine;
mod error;
mod events;
mod gate;
mod page;
mod types;

pub use bridge::{BridgeConnection, RenderBridge};
pub(crate) use bridge::authority;
pub use coordinator::{Handled, RenderCoordinator, canonical_url, wrap_into_response};
pub use dispatch::{
    DispatchOutcome, Dispatcher, ExceptionFormatter, HookError, NetworkOnly, PlainTextFormatter,
    RequestHook, ResponseHook, RouterDispatcher,
};
pub use engine::{
    EngineOptions, NetworkAccess, PageLoad, PassthroughEngine, RenderEngine, RenderedDocument,
};
pub use error::{BridgeError, EngineError, GateError, RenderError};
pub use events::{RenderEvent, RenderObserver, RenderOutcome, TelemetryObserver};
pub use gate::{BotGate, BotRule, DEFAULT_AGENTS, DEVELOPMENT_FORCE_PATH, GateMatch};
pub use page::{EngineDefaults, PageRenderer};
pub use types::{
    BridgeRequest, BridgeResponse, MARKER_HEADER, MARKER_VALUE, RENDERER_AGENT,
    REQUEST_TYPE_HEADER, RenderRequest, RenderSession, SSR_REQUEST_TYPE,
};
