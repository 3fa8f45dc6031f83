//! HTTP surface: auth, status codes, and bodies.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{harness, Harness};
use yourvpn::api::{router, AppState};
use yourvpn::clock::Clock;
use yourvpn::store::LedgerStore;

fn app(h: &Harness) -> Router {
    router(Arc::new(AppState::new(
        h.lifecycle.clone(),
        h.clock.clone() as Arc<dyn Clock>,
    )))
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("token", token);
    }
    builder.body(Body::empty()).unwrap()
}

fn delete(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header("token", token)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("token", token)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn decimal(v: &Value) -> Decimal {
    match v {
        Value::String(s) => s.parse().unwrap(),
        other => other.to_string().parse().unwrap(),
    }
}

#[tokio::test]
async fn test_healthz_needs_no_token_and_tags_request_id() {
    let h = harness();
    let resp = app(&h).oneshot(get("/healthz", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let h = harness();
    let resp = app(&h).oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_or_unknown_token_is_unauthorized() {
    let h = harness();

    let resp = app(&h).oneshot(get("/status", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(resp).await;
    assert_eq!(body["error"]["code"], "invalid_token");

    let resp = app(&h).oneshot(get("/status", Some("deadbeef"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expired_token_is_unauthorized() {
    let h = harness();
    let token = h.store.create_token(false, Decimal::new(10, 0), 1).await.unwrap();

    h.clock.advance(chrono::Duration::days(1) + chrono::Duration::seconds(1));
    let resp = app(&h).oneshot(get("/status", Some(&token.id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_routes_reject_user_tokens() {
    let h = harness();
    let user = h.store.create_token(false, Decimal::new(10, 0), 30).await.unwrap();

    let resp = app(&h).oneshot(get("/tokens", Some(&user.id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = app(&h)
        .oneshot(post_json(
            "/tokens",
            &user.id,
            json!({"funds": 5, "days_till_expiration": 30}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_creates_lists_and_deletes_tokens() {
    let h = harness();
    let admin = h.store.create_token(true, Decimal::ZERO, 30).await.unwrap();

    let resp = app(&h)
        .oneshot(post_json(
            "/tokens",
            &admin.id,
            json!({"funds": "12.50", "days_till_expiration": 7}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = json_body(resp).await;
    let new_token = created["token"].as_str().unwrap().to_string();
    assert_eq!(new_token.len(), 64);
    assert_eq!(decimal(&created["funds_available"]), Decimal::new(1250, 2));

    let resp = app(&h).oneshot(get("/tokens?limit=10", Some(&admin.id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let listed = json_body(resp).await;
    assert_eq!(listed.as_array().unwrap().len(), 2);

    let resp = app(&h)
        .oneshot(delete(&format!("/tokens?token_to_delete={}", new_token), &admin.id))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(h.store.get_token(&new_token).await.is_err());

    let resp = app(&h)
        .oneshot(delete(&format!("/tokens?token_to_delete={}", new_token), &admin.id))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_negative_funds_are_rejected() {
    let h = harness();
    let admin = h.store.create_token(true, Decimal::ZERO, 30).await.unwrap();

    let resp = app(&h)
        .oneshot(post_json(
            "/tokens",
            &admin.id,
            json!({"funds": -1, "days_till_expiration": 7}),
        ))
        .await
        .unwrap();
    assert!(resp.status().is_client_error());
    assert_eq!(h.store.list_tokens(0, 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_datacenters_lists_available_regions() {
    let h = harness();
    let user = h.store.create_token(false, Decimal::new(10, 0), 30).await.unwrap();

    let resp = app(&h).oneshot(get("/datacenters", Some(&user.id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        json_body(resp).await,
        json!({"available": ["ams3", "nyc1", "sfo3"]})
    );
}

#[tokio::test]
async fn test_endpoint_create_status_delete_flow() {
    let h = harness();
    let user = h.store.create_token(false, Decimal::new(10, 0), 30).await.unwrap();

    let resp = app(&h)
        .oneshot(post_json(
            "/create",
            &user.id,
            json!({"region": "sfo3", "ssh_pub_key": "ssh-ed25519 AAAA user@host"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = json_body(resp).await;
    let name = created["endpoint_name"].as_str().unwrap().to_string();
    assert!(name.ends_with("-1-sfo3"));
    assert!(created["server_ip"].as_str().unwrap().starts_with("203.0.113."));

    let resp = app(&h).oneshot(get("/status", Some(&user.id))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let status = json_body(resp).await;
    assert_eq!(status["endpoints"][0]["endpoint_name"], name.as_str());
    assert_eq!(decimal(&status["funds"]), Decimal::new(10, 0));
    assert!(!status["est_depletion"].is_null());

    let resp = app(&h)
        .oneshot(delete(&format!("/endpoint?endpoint_name={}", name), &user.id))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(h.provider.live_instances().is_empty());

    let resp = app(&h)
        .oneshot(delete(&format!("/endpoint?endpoint_name={}", name), &user.id))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp = app(&h).oneshot(get("/status", Some(&user.id))).await.unwrap();
    let status = json_body(resp).await;
    assert!(status["est_depletion"].is_null());
}

#[tokio::test]
async fn test_invalid_region_is_404() {
    let h = harness();
    let user = h.store.create_token(false, Decimal::new(10, 0), 30).await.unwrap();

    let resp = app(&h)
        .oneshot(post_json(
            "/create",
            &user.id,
            json!({"region": "mars1", "ssh_pub_key": "ssh-ed25519 AAAA"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("mars1"));
}

#[tokio::test]
async fn test_broke_token_cannot_create() {
    let h = harness();
    let user = h.store.create_token(false, Decimal::ZERO, 30).await.unwrap();

    let resp = app(&h)
        .oneshot(post_json(
            "/create",
            &user.id,
            json!({"region": "random", "ssh_pub_key": "ssh-ed25519 AAAA"}),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(resp).await["error"]["code"], "insufficient_funds");
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let h = harness();
    let resp = app(&h).oneshot(get("/nope", None)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
