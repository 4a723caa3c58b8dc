// =============================================================================
// Admin Token — Axum extractor for operator-only endpoints
// =============================================================================
//
// Validates `Authorization: Bearer <token>` against `admin_token` from the
// service config (env `GATEWAY_ADMIN_TOKEN`). Comparison runs in constant
// time.
//
// Usage as an Axum extractor:
//
//   async fn handler(_: AdminToken, ...) { ... }
//
// With no token configured every admin request is refused, so the admin
// surface is off unless an operator turns it on.
// =============================================================================

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use tracing::warn;

use crate::app_state::AppState;
use crate::error::ApiError;

/// Compare two byte slices without stopping at the first difference.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn check(headers: &HeaderMap, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        warn!("admin request refused: no admin token configured");
        return Err(ApiError::forbidden("admin endpoints are disabled"));
    };
    let Some(token) = bearer(headers) else {
        warn!("admin request without a bearer token");
        return Err(ApiError::forbidden("missing or invalid authorization token"));
    };
    if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
        warn!("invalid admin token presented");
        return Err(ApiError::forbidden("missing or invalid authorization token"));
    }
    Ok(())
}

/// Proof that the request carried the configured admin token.
pub struct AdminToken;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminToken {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        check(&parts.headers, state.config.admin_token.as_deref())?;
        Ok(AdminToken)
    }
}

// =============================================================================
// Tests
// =============================================================================
