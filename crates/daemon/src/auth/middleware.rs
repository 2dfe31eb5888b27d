//! Token-checking decorator for protected operations.
//!
//! [`require_auth`] is the only way an authenticated identity reaches
//! downstream code: it verifies the `X-Auth` header and hands the wrapped
//! operation an explicit [`RequestContext`]. When verification fails the
//! wrapped operation is never called.

use std::future::Future;

use hyper::{HeaderMap, Request};
use protocol::{ApiError, UserId};
use uuid::Uuid;

use super::token::TokenCodec;

/// Header carrying the raw signed token (no scheme prefix).
pub const AUTH_HEADER: &str = "X-Auth";

/// Identity and bookkeeping for one authenticated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            request_id: Uuid::new_v4(),
        }
    }
}

/// Verify the token in `headers` and build a context for it.
pub fn authenticate(codec: &TokenCodec, headers: &HeaderMap) -> Result<RequestContext, ApiError> {
    let token = headers
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::auth_failure("missing auth header"))?;

    codec
        .verify(token)
        .map(RequestContext::new)
        .ok_or_else(|| ApiError::auth_failure("invalid token"))
}

/// Run `next` only if the request carries a valid token.
pub async fn require_auth<B, F, Fut, T>(
    codec: &TokenCodec,
    req: Request<B>,
    next: F,
) -> Result<T, ApiError>
where
    F: FnOnce(RequestContext, Request<B>) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let ctx = authenticate(codec, req.headers())?;
    tracing::debug!(user_id = ctx.user_id, request_id = %ctx.request_id, "Request authenticated");
    next(ctx, req).await
}
