// =============================================================================
// Consumer Identity — Axum extractor
// =============================================================================
//
// Resolves who a request should be rate-limited as:
//   1. the `X-Consumer-Id` header, when `trust_consumer_header` is on and the
//      header is present and well-formed
//   2. otherwise the peer IP address (requires `ConnectInfo<SocketAddr>`)
//   3. otherwise the literal `anonymous`
//
// The header is ignored by default: a client that can pick its own id can
// pick a new one per request and never hit its limit.
//
// Usage as an Axum extractor:
//
//   async fn handler(ConsumerId(consumer): ConsumerId, ...) { ... }
//
// The extractor never rejects; a malformed header falls through to the IP.
// =============================================================================

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use tracing::debug;

use crate::app_state::AppState;

pub const CONSUMER_HEADER: &str = "x-consumer-id";
pub const ANONYMOUS: &str = "anonymous";

const MAX_CONSUMER_ID_LEN: usize = 64;

pub struct ConsumerId(pub String);

fn from_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(CONSUMER_HEADER)?.to_str().ok()?.trim();
    let valid = !raw.is_empty()
        && raw.len() <= MAX_CONSUMER_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !valid {
        debug!("ignoring malformed {CONSUMER_HEADER} header");
        return None;
    }
    Some(raw.to_string())
}

fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>, trust_header: bool) -> String {
    trust_header
        .then(|| from_header(headers))
        .flatten()
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| ANONYMOUS.to_string())
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for ConsumerId {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let trust_header = state.config.trust_consumer_header;
        Ok(ConsumerId(resolve(&parts.headers, peer, trust_header)))
    }
}

// =============================================================================
// Tests
// =============================================================================
