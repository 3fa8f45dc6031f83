//! Token header authentication.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use super::AppState;
use crate::errors::AppError;
use crate::models::Token;

pub const TOKEN_HEADER: &str = "token";

/// The caller's token, placed in request extensions by `require_token`.
#[derive(Debug, Clone)]
pub struct AuthenticatedToken(pub Token);

/// Middleware: resolves the `token` header to a live token.
/// Missing, unknown, and expired tokens are all 401.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let secret = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AppError::Unauthorized)?;

    let token = match state.store.get_token(secret).await {
        Ok(token) => token,
        Err(AppError::NotFound(_)) => {
            tracing::warn!(path = %req.uri().path(), "rejected unknown token");
            return Err(AppError::Unauthorized);
        }
        Err(e) => return Err(e),
    };
    if token.is_expired(state.clock.now()) {
        tracing::warn!(token = token.name_suffix(), "rejected expired token");
        return Err(AppError::Unauthorized);
    }

    req.extensions_mut().insert(AuthenticatedToken(token));
    Ok(next.run(req).await)
}

/// Middleware: must run inside `require_token`.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AppError> {
    let is_admin = req
        .extensions()
        .get::<AuthenticatedToken>()
        .map(|caller| caller.0.is_admin)
        .unwrap_or(false);
    if !is_admin {
        return Err(AppError::Forbidden);
    }
    Ok(next.run(req).await)
}
