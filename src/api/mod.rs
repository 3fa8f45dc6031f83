use std::sync::Arc;

use axum::{
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::clock::Clock;
use crate::lifecycle::EndpointManager;
use crate::metrics;
use crate::store::LedgerStore;

pub mod auth;
pub mod handlers;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub lifecycle: Arc<EndpointManager>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    pub fn new(lifecycle: Arc<EndpointManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: lifecycle.store().clone(),
            lifecycle,
            clock,
        }
    }
}

/// Build the public router. Every route except `/healthz` and `/metrics`
/// requires a `token` header; `/tokens` additionally requires an admin token.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .route(
            "/tokens",
            get(handlers::list_tokens)
                .post(handlers::create_token)
                .delete(handlers::delete_token),
        )
        .route_layer(middleware::from_fn(auth::require_admin));

    let user = Router::new()
        .route("/create", post(handlers::create_endpoint))
        .route("/datacenters", get(handlers::list_datacenters))
        .route("/status", get(handlers::token_status))
        .route("/endpoint", delete(handlers::delete_endpoint));

    let authenticated = admin
        .merge(user)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .merge(authenticated)
        .fallback(fallback_404)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

/// Middleware: tags every response with a fresh `x-request-id`, and the
/// request span with the same id.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", request_id = %req_id);

    let mut resp = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    // Responses carry balances and token secrets.
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    resp
}
