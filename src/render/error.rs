use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{cache::CacheError, error::HttpError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("engine request parameters are not supported ({count} present)")]
    UnsupportedParameters { count: usize },
    #[error("invalid bridge request for `{url}`: {reason}")]
    InvalidRequest { url: String, reason: String },
    #[error("no handler answered `{url}` and the outbound request failed")]
    Fallback {
        url: String,
        #[source]
        source: InfraError,
    },
    #[error("failed to read response body for `{url}`: {reason}")]
    Body { url: String, reason: String },
}

impl BridgeError {
    pub(crate) fn invalid(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Network(#[from] BridgeError),
    #[error("script error: {0}")]
    Script(String),
    #[error("page load exceeded {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed: {0}")]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("cannot build canonical url: {0}")]
    InvalidUrl(String),
}

impl RenderError {
    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::InvalidUrl(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            RenderError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            RenderError::Engine(EngineError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            RenderError::Engine(EngineError::Network(BridgeError::Fallback { .. })) => {
                StatusCode::BAD_GATEWAY
            }
            RenderError::Engine(_) | RenderError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            RenderError::InvalidUrl(_) => "Request could not be processed",
            RenderError::Engine(EngineError::Timeout(_)) => "Page render timed out",
            RenderError::Engine(_) => "Page could not be rendered",
            RenderError::Cache(_) => "Render cache unavailable",
        }
    }
}

impl IntoResponse for RenderError {
    fn into_response(self) -> Response {
        HttpError::from_error(
            "render::error::RenderError",
            self.status_code(),
            self.presentation_message(),
            &self,
        )
        .into_response()
    }
}
