//! Outbound HTTP used when no internal handler answers a bridge sub-request.

use std::time::Instant;

use async_trait::async_trait;
use axum::http::{HeaderMap, Request, Response, header};
use bytes::{Bytes, BytesMut};
use reqwest::{Client, redirect::Policy};
use tracing::debug;
use url::Url;

use crate::config::HttpClientSettings;

use super::error::InfraError;

const MAX_REDIRECTS: usize = 10;

/// Executes requests against real network endpoints.
#[async_trait]
pub trait OutboundClient: Send + Sync {
    /// Send `request` (absolute URI) and buffer the full response.
    ///
    /// `secure` forces TLS even when the URI carries a plain `http` scheme.
    async fn execute(
        &self,
        request: Request<Bytes>,
        secure: bool,
        follow_redirects: bool,
    ) -> Result<Response<Bytes>, InfraError>;
}

/// [`OutboundClient`] backed by two prebuilt `reqwest` clients, one per redirect policy.
#[derive(Clone)]
pub struct ReqwestClient {
    following: Client,
    direct: Client,
    max_body_bytes: usize,
}

impl ReqwestClient {
    pub fn new(settings: &HttpClientSettings, max_body_bytes: usize) -> Result<Self, InfraError> {
        let following = Client::builder()
            .timeout(settings.timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|err| InfraError::http(format!("failed to create HTTP client: {err}")))?;
        let direct = Client::builder()
            .timeout(settings.timeout)
            .redirect(Policy::none())
            .build()
            .map_err(|err| InfraError::http(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            following,
            direct,
            max_body_bytes,
        })
    }
}

#[async_trait]
impl OutboundClient for ReqwestClient {
    async fn execute(
        &self,
        request: Request<Bytes>,
        secure: bool,
        follow_redirects: bool,
    ) -> Result<Response<Bytes>, InfraError> {
        let started_at = Instant::now();
        let (parts, body) = request.into_parts();

        let mut url = Url::parse(&parts.uri.to_string())
            .map_err(|err| InfraError::http(format!("invalid outbound url `{}`: {err}", parts.uri)))?;
        if secure && url.scheme() == "http" {
            url.set_scheme("https")
                .map_err(|()| InfraError::http(format!("cannot switch `{url}` to https")))?;
        }

        let client = if follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let mut response = client
            .request(parts.method, url.clone())
            .headers(outbound_headers(parts.headers))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if buffer.len() + chunk.len() > self.max_body_bytes {
                return Err(InfraError::http(format!(
                    "response from `{url}` exceeds {} bytes",
                    self.max_body_bytes
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        debug!(
            target = "prerender::http_client",
            %url,
            status = status.as_u16(),
            bytes = buffer.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "outbound request complete"
        );

        let mut rebuilt = Response::new(buffer.freeze());
        *rebuilt.status_mut() = status;
        *rebuilt.headers_mut() = headers;
        Ok(rebuilt)
    }
}

/// Drop headers the client derives itself. Responses are never decompressed,
/// so no encoding is advertised.
fn outbound_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::ACCEPT_ENCODING);
    headers
}
