//! On-demand server-side rendering for crawlers.
//!
//! Requests from known crawlers are rendered by an engine whose network calls
//! are served through the application's own request pipeline, and the
//! resulting pages are cached per application.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;
pub mod lifecycle;
pub mod render;
pub mod service;
