//! Router tests against in-memory billing doubles

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Request, StatusCode},
    Router,
};
use retreat_billing::testing::{
    fixtures, payloads, signature_for, RecordingNotifier, ScriptedGateway, WEBHOOK_SECRET,
};
use retreat_billing::types::BookingStatus;
use retreat_billing::{BillingConfig, BillingService, BillingStore, Environment, MemoryStore};
use serde_json::Value;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::config::Config;
use crate::state::AppState;

const CRON_SECRET: &str = "cron-test-secret";

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
}

fn test_app(cron_secret: Option<&str>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let billing = BillingService::new(
        store.clone(),
        Arc::new(ScriptedGateway::new()),
        Arc::new(RecordingNotifier::new()),
        Some(WEBHOOK_SECRET.to_string()),
        BillingConfig {
            environment: Environment::Test,
            ..BillingConfig::default()
        },
    );
    let config = Config {
        database_url: "postgres://unused".to_string(),
        bind_address: "127.0.0.1:0".to_string(),
        cron_secret: cron_secret.map(str::to_string),
        run_migrations: false,
    };

    TestApp {
        router: create_router(AppState::new(billing, config)),
        store,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn signed_webhook(body: &str) -> Request<Body> {
    let signature = signature_for(body, OffsetDateTime::now_utc());
    Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", signature)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn cron_request(token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/cron/reconcile");
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = test_app(None);
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_checkout_webhook_processed_then_duplicate() {
    let app = test_app(None);
    let (booking, _) = fixtures::seed_booking_with_room(&app.store, 2, 4).await;
    let body = payloads::checkout_completed("evt_checkout_1", booking.id, "pi_first", 30_000);

    let (status, first) = send(&app.router, signed_webhook(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["outcome"], "processed");

    let (status, second) = send(&app.router, signed_webhook(&body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["outcome"], "duplicate");

    let stored = app.store.booking(booking.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);
    assert!(stored.inventory_applied);
}

#[tokio::test]
async fn test_bad_signature_returns_category_only() {
    let app = test_app(None);
    let body = payloads::checkout_completed("evt_forged", Uuid::new_v4(), "pi_forged", 30_000);
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .header("stripe-signature", "t=1,v1=deadbeef")
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(matches!(
        body["error"].as_str(),
        Some("invalid_signature") | Some("stale_timestamp")
    ));
}

#[tokio::test]
async fn test_missing_signature_rejected() {
    let app = test_app(None);
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/stripe")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_signature");
}

#[tokio::test]
async fn test_cron_requires_bearer_secret() {
    let app = test_app(Some(CRON_SECRET));

    let (status, _) = send(&app.router, cron_request(None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app.router, cron_request(Some("wrong"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, summary) = send(&app.router, cron_request(Some(CRON_SECRET))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["due"]["processed"], 0);
    assert!(summary["started_at"].is_string());
}

#[tokio::test]
async fn test_cron_rejected_when_secret_unset() {
    let app = test_app(None);
    let (status, _) = send(&app.router, cron_request(Some(""))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app.router, cron_request(Some("anything"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_event_listing_and_reset() {
    let app = test_app(Some(CRON_SECRET));
    let (booking, _) = fixtures::seed_booking_with_room(&app.store, 1, 4).await;
    let body = payloads::checkout_completed("evt_listed", booking.id, "pi_listed", 30_000);
    send(&app.router, signed_webhook(&body)).await;

    let request = Request::builder()
        .uri("/admin/webhook-events?result=success&limit=10")
        .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
        .body(Body::empty())
        .unwrap();
    let (status, events) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["gateway_event_id"], "evt_listed");

    let request = Request::builder()
        .method("POST")
        .uri("/admin/webhook-events/evt_unknown/reset")
        .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_event_limit_validated() {
    let app = test_app(Some(CRON_SECRET));
    let request = Request::builder()
        .uri("/admin/webhook-events?limit=0")
        .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invariant_report() {
    let app = test_app(Some(CRON_SECRET));
    fixtures::seed_booking_with_room(&app.store, 1, 4).await;

    let request = Request::builder()
        .uri("/admin/invariants")
        .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
        .body(Body::empty())
        .unwrap();
    let (status, report) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["healthy"], true);
    assert_eq!(report["checks_run"], 4);
}

#[tokio::test]
async fn test_email_webhook_unverified_outside_production() {
    let app = test_app(None);
    let body = r#"{"type":"email.delivered","data":{"email_id":"msg_1","to":["ada@example.com"]}}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/email")
        .header("svix-id", "msg_evt_1")
        .body(Body::from(body))
        .unwrap();

    let (status, ack) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["outcome"], "recorded");
}
