//! HTTP surface tests against in-memory backends.
//!
//! Each test builds the production router over a [`TestEnv`] and drives it
//! with `oneshot`, so status mapping and response bodies are checked without
//! a database.

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderMap, Request, StatusCode},
    Router,
};
use courier_api::{create_router, server::REQUEST_ID_HEADER, AppState};
use courier_core::models::DeliveryStatus;
use courier_testing::{
    sample_payload, MockReceiver, MockResponse, SubscriptionBuilder, TestEnv, TEST_EVENT,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

fn app(env: &TestEnv) -> Router {
    let state = AppState::new(env.service.clone(), None, Arc::new(env.clock.clone()));
    create_router(state, Duration::from_secs(5))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.oneshot(request).await.expect("request should complete");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read response body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("response should be JSON")
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn liveness_reports_alive_with_request_id() {
    let env = TestEnv::new().unwrap();

    let (status, headers, body) = send(app(&env), get("/live")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "courier-api");
    let request_id = headers.get(REQUEST_ID_HEADER).expect("request id header").to_str().unwrap();
    assert!(Uuid::parse_str(request_id).is_ok());
}

#[tokio::test]
async fn health_skips_database_for_in_memory_backends() {
    let env = TestEnv::new().unwrap();

    let (status, _, body) = send(app(&env), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "skipped");
}

#[tokio::test]
async fn event_fan_out_is_accepted_and_reports_rejections() {
    let env = TestEnv::new().unwrap();
    let good = env.subscribe("https://203.0.114.10/hook").await;
    let bad = env
        .add_subscription(SubscriptionBuilder::with_defaults("ftp://203.0.114.11/hook").build())
        .await;

    let request = post_json("/events", &json!({ "event": TEST_EVENT, "data": sample_payload() }));
    let (status, _, body) = send(app(&env), request).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["event"], TEST_EVENT);
    assert_eq!(body["enqueued"].as_array().unwrap().len(), 1);
    assert_eq!(body["rejected"][0]["subscription_id"], bad.id.to_string());
    assert_eq!(env.queue.jobs().await.len(), 1);
    assert_ne!(good.id, bad.id);
}

#[tokio::test]
async fn malformed_event_body_is_bad_request() {
    let env = TestEnv::new().unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/events")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = send(app(&env), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _, _) = send(app(&env), post_json("/events", &json!({ "event": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn single_delivery_is_created_pending_and_readable() {
    let env = TestEnv::new().unwrap();
    let sub = env.subscribe("https://203.0.114.10/hook").await;

    let uri = format!("/subscriptions/{}/deliveries", sub.id);
    let (status, _, created) =
        send(app(&env), post_json(&uri, &json!({ "event": TEST_EVENT, "data": {"n": 1} }))).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["attempts"], 0);

    let id = created["id"].as_str().unwrap();
    let (status, _, fetched) = send(app(&env), get(&format!("/deliveries/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], created["id"]);
    assert_eq!(fetched["payload"], json!({"n": 1}));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let env = TestEnv::new().unwrap();
    let missing = Uuid::new_v4();

    let (status, _, body) = send(app(&env), get(&format!("/deliveries/{missing}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "delivery_not_found");

    let uri = format!("/subscriptions/{missing}/deliveries");
    let (status, _, body) = send(app(&env), post_json(&uri, &json!({ "event": TEST_EVENT }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "subscription_not_found");
}

#[tokio::test]
async fn malformed_ids_answer_json_bad_request() {
    let env = TestEnv::new().unwrap();

    let requests = [
        get("/deliveries/not-a-uuid"),
        post_empty("/deliveries/not-a-uuid/retry"),
        post_json("/subscriptions/not-a-uuid/deliveries", &json!({ "event": TEST_EVENT })),
        get("/subscriptions/not-a-uuid/stats"),
    ];
    for request in requests {
        let uri = request.uri().to_string();
        let (status, _, body) = send(app(&env), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"]["code"], "bad_request", "{uri}");
        assert_eq!(body["error"]["message"], "invalid id: not-a-uuid", "{uri}");
    }
}

#[tokio::test]
async fn malformed_stats_query_answers_json_bad_request() {
    let env = TestEnv::new().unwrap();
    let sub = env.subscribe("https://203.0.114.10/hook").await;

    let uri = format!("/subscriptions/{}/stats?window_secs=soon", sub.id);
    let (status, _, body) = send(app(&env), get(&uri)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn unsafe_target_is_unprocessable() {
    let env = TestEnv::builder().strict_guard().build().unwrap();
    let sub = env.subscribe("http://10.0.0.5/hook").await;

    let uri = format!("/subscriptions/{}/deliveries", sub.id);
    let (status, _, body) = send(app(&env), post_json(&uri, &json!({ "event": TEST_EVENT }))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "unsafe_target");
    assert!(env.queue.jobs().await.is_empty());
}

#[tokio::test]
async fn inactive_subscription_conflicts() {
    let env = TestEnv::new().unwrap();
    let inactive = SubscriptionBuilder::with_defaults("https://203.0.114.10/hook").inactive();
    let sub = env.add_subscription(inactive.build()).await;

    let uri = format!("/subscriptions/{}/deliveries", sub.id);
    let (status, _, body) = send(app(&env), post_json(&uri, &json!({ "event": TEST_EVENT }))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "subscription_inactive");
}

#[tokio::test]
async fn retry_requires_failed_delivery() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(500)).await;
    let sub = env
        .add_subscription(SubscriptionBuilder::with_defaults(receiver.url()).max_retries(0).build())
        .await;
    let delivery = env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();

    let retry_uri = format!("/deliveries/{}/retry", delivery.id);
    let (status, _, body) = send(app(&env), post_empty(&retry_uri)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");

    env.run_until_settled(5).await.unwrap();
    assert_eq!(env.delivery(delivery.id).await.unwrap().status, DeliveryStatus::Failed);

    let (status, _, body) = send(app(&env), post_empty(&retry_uri)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["attempts"], 0);
    assert!(body["error"].is_null());
    assert_eq!(env.queue.jobs().await.len(), 1);
}

#[tokio::test]
async fn stats_summarize_window() {
    let env = TestEnv::new().unwrap();
    let receiver = MockReceiver::start().await;
    receiver.always(MockResponse::Status(200)).await;
    let sub = env.subscribe(receiver.url()).await;
    for _ in 0..2 {
        env.service.enqueue_delivery(sub.id, TEST_EVENT, sample_payload()).await.unwrap();
    }
    env.run_until_settled(5).await.unwrap();

    let uri = format!("/subscriptions/{}/stats?window_secs=3600", sub.id);
    let (status, _, body) = send(app(&env), get(&uri)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["delivered"], 2);
    assert_eq!(body["success_rate"], 100.0);

    let uri = format!("/subscriptions/{}/stats?window_secs=0", sub.id);
    let (status, _, _) = send(app(&env), get(&uri)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
