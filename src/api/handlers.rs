use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::AuthenticatedToken;
use super::AppState;
use crate::errors::{AppError, Result};
use crate::lifecycle::{CreateEndpointRequest, ProvisionedEndpoint, TokenStatus};
use crate::models::Token;

const DEFAULT_PAGE_LIMIT: i64 = 100;
const MAX_PAGE_LIMIT: i64 = 1000;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct CreateTokenRequest {
    pub funds: Decimal,
    pub days_till_expiration: i64,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
    pub funds_available: Decimal,
    pub expiration: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct PaginationParams {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct TokenSummary {
    pub token: String,
    pub is_admin: bool,
    pub funds_available: Decimal,
    pub expiration: DateTime<Utc>,
    pub endpoint_count: i32,
}

impl From<Token> for TokenSummary {
    fn from(t: Token) -> Self {
        Self {
            token: t.id,
            is_admin: t.is_admin,
            funds_available: t.funds_available,
            expiration: t.expiration,
            endpoint_count: t.endpoint_count,
        }
    }
}

#[derive(Deserialize)]
pub struct DeleteTokenParams {
    pub token_to_delete: String,
}

#[derive(Deserialize)]
pub struct DeleteEndpointParams {
    pub endpoint_name: String,
}

// ── Admin ────────────────────────────────────────────────────

/// POST /tokens
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTokenRequest>,
) -> Result<(StatusCode, Json<CreateTokenResponse>)> {
    let token = state
        .store
        .create_token(payload.admin, payload.funds, payload.days_till_expiration)
        .await?;
    tracing::info!(
        token = token.name_suffix(),
        admin = token.is_admin,
        funds = %token.funds_available,
        "token created"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token: token.id,
            funds_available: token.funds_available,
            expiration: token.expiration,
        }),
    ))
}

/// GET /tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<Vec<TokenSummary>>> {
    let skip = params.skip.unwrap_or(0);
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if skip < 0 || limit < 0 {
        return Err(AppError::Validation(
            "skip and limit must not be negative".to_string(),
        ));
    }

    let tokens = state
        .store
        .list_tokens(skip, limit.min(MAX_PAGE_LIMIT))
        .await?;
    Ok(Json(tokens.into_iter().map(TokenSummary::from).collect()))
}

/// DELETE /tokens?token_to_delete=
pub async fn delete_token(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteTokenParams>,
) -> Result<StatusCode> {
    state.lifecycle.delete_token(&params.token_to_delete).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Endpoints ────────────────────────────────────────────────

/// POST /create
pub async fn create_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthenticatedToken>,
    Json(payload): Json<CreateEndpointRequest>,
) -> Result<Json<ProvisionedEndpoint>> {
    // Runs to completion even if the client disconnects.
    let lifecycle = state.lifecycle.clone();
    let token_id = caller.0.id;
    let endpoint = tokio::spawn(async move { lifecycle.create_endpoint(&token_id, &payload).await })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("provisioning task failed: {}", e)))??;
    Ok(Json(endpoint))
}

/// GET /datacenters
pub async fn list_datacenters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>> {
    let available = state.lifecycle.list_datacenters().await?;
    Ok(Json(json!({ "available": available })))
}

/// GET /status
pub async fn token_status(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthenticatedToken>,
) -> Result<Json<TokenStatus>> {
    Ok(Json(state.lifecycle.token_status(&caller.0.id).await?))
}

/// DELETE /endpoint?endpoint_name=
pub async fn delete_endpoint(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<AuthenticatedToken>,
    Query(params): Query<DeleteEndpointParams>,
) -> Result<StatusCode> {
    state
        .lifecycle
        .delete_endpoint(&caller.0.id, &params.endpoint_name)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
