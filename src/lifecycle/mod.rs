//! Renderer registration on the host request bus.

mod bus;
mod manager;

pub use bus::{
    HandlerBus, HandlerChain, Priority, RequestHandler, Subscription, prerender_layer,
};
pub use manager::{Application, LifecycleError, LifecycleManager};
pub(crate) use manager::cache_request;
