use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use oracle_coordinator::app_state::AppState;
use oracle_coordinator::callback::LoggingDispatcher;
use oracle_coordinator::config::CoordinatorConfig;
use oracle_coordinator::coordinator::Coordinator;
use oracle_coordinator::models::{OracleValue, RequestId, SignedResponse};
use oracle_coordinator::node::{Ed25519Signer, ResponseSigner};
use oracle_coordinator::routes;
use oracle_coordinator::time::{ManualClock, TimeSource};
use oracle_coordinator::treasury::InMemoryTreasury;

fn t0() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

struct TestApp {
    router: Router,
    coordinator: Arc<Coordinator>,
    clock: Arc<ManualClock>,
    nodes: Vec<Ed25519Signer>,
}

fn test_app() -> TestApp {
    let clock = Arc::new(ManualClock::new(t0()));
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorConfig::default(),
        clock.clone(),
        Arc::new(InMemoryTreasury::new()),
        Arc::new(LoggingDispatcher),
    ));

    let nodes: Vec<Ed25519Signer> = (1..=4)
        .map(|seed| {
            let signer = Ed25519Signer::from_seed([seed; 32]);
            coordinator.registry().admit(signer.node_id()).unwrap();
            signer
        })
        .collect();

    TestApp {
        router: routes::router(AppState::new(coordinator.clone())),
        coordinator,
        clock,
        nodes,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn submission(fee: u64) -> Value {
    json!({
        "payload": {
            "source": { "type": "inline", "body": { "price": "101.5" } },
            "path": "/price"
        },
        "requester": "contract",
        "callback": "on_price",
        "fee": fee,
        "deadline": (t0() + Duration::seconds(60)).to_rfc3339(),
    })
}

async fn submit(app: &TestApp) -> RequestId {
    let (status, json) = send(&app.router, post_json("/api/requests", &submission(100))).await;
    assert_eq!(status, StatusCode::CREATED);
    json["data"]["id"].as_str().unwrap().parse().unwrap()
}

fn signed(app: &TestApp, node: usize, id: RequestId, value: i64) -> Value {
    let response: SignedResponse = app.nodes[node].sign(id, OracleValue::from(value), t0());
    serde_json::to_value(response).unwrap()
}

#[tokio::test]
async fn test_health_check_responds() {
    let app = test_app();
    let response = app.router.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_submit_and_fetch_request() {
    let app = test_app();
    let id = submit(&app).await;

    let (status, json) = send(&app.router, get(&format!("/api/requests/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["state"], "pending");
    assert_eq!(json["data"]["fee_reserved"], 100);

    let (_, json) = send(&app.router, get("/api/requests?state=pending")).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 1);

    let (_, json) = send(&app.router, get("/api/requests?state=fulfilled")).await;
    assert!(json["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_rejects_bad_requests() {
    let app = test_app();

    let (status, json) = send(&app.router, post_json("/api/requests", &submission(5))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "insufficient_fee");

    let mut past = submission(100);
    past["deadline"] = json!((t0() - Duration::seconds(1)).to_rfc3339());
    let (status, json) = send(&app.router, post_json("/api/requests", &past)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "invalid_deadline");

    let mut anonymous = submission(100);
    anonymous["requester"] = json!("");
    let (status, json) = send(&app.router, post_json("/api/requests", &anonymous)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "validation_error");

    assert!(app.coordinator.ledger().is_empty());
}

#[tokio::test]
async fn test_unknown_request_is_not_found() {
    let app = test_app();
    let id = RequestId::new();

    let (status, json) = send(&app.router, get(&format!("/api/requests/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["success"], false);

    let (status, _) = send(&app.router, get(&format!("/api/requests/{id}/consensus"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app.router, post_json("/api/responses", &signed(&app, 0, id, 1))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_responses_reach_consensus() {
    let app = test_app();
    let id = submit(&app).await;

    let (status, json) = send(&app.router, post_json("/api/responses", &signed(&app, 0, id, 100))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["data"]["status"], "counted");
    assert_eq!(json["data"]["responders"], 1);

    let (status, json) = send(&app.router, post_json("/api/responses", &signed(&app, 0, id, 100))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "duplicate");

    let (status, _) = send(&app.router, get(&format!("/api/requests/{id}/consensus"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    send(&app.router, post_json("/api/responses", &signed(&app, 1, id, 102))).await;
    let (status, _) = send(&app.router, post_json("/api/responses", &signed(&app, 2, id, 101))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, json) = send(&app.router, get(&format!("/api/requests/{id}/consensus"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["value"]["kind"], "numeric");
    assert_eq!(json["data"]["value"]["value"], "101");
    assert_eq!(json["data"]["method"], "median");
    assert_eq!(json["data"]["contributing_nodes"].as_array().unwrap().len(), 3);

    let (_, json) = send(&app.router, get(&format!("/api/requests/{id}"))).await;
    assert_eq!(json["data"]["state"], "fulfilled");

    let (status, json) = send(&app.router, post_json("/api/responses", &signed(&app, 3, id, 5))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], "audited");

    let (_, json) = send(&app.router, get(&format!("/api/requests/{id}/responses"))).await;
    assert_eq!(json["data"]["counted"].as_array().unwrap().len(), 3);
    assert_eq!(json["data"]["audit"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_forged_and_unknown_signers_are_unauthorized() {
    let app = test_app();
    let id = submit(&app).await;

    let mut forged = signed(&app, 0, id, 100);
    forged["value"]["value"] = json!("999");
    let (status, json) = send(&app.router, post_json("/api/responses", &forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "invalid_signature");

    let stranger = Ed25519Signer::from_seed([200; 32]);
    let body = serde_json::to_value(stranger.sign(id, OracleValue::from(1), t0())).unwrap();
    let (status, json) = send(&app.router, post_json("/api/responses", &body)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "unknown_node");
}

#[tokio::test]
async fn test_responses_to_expired_requests_conflict() {
    let app = test_app();
    let id = submit(&app).await;

    app.clock.advance(Duration::seconds(61));
    app.coordinator.tick(app.clock.utc_now()).await;

    let (status, json) = send(&app.router, post_json("/api/responses", &signed(&app, 0, id, 100))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["code"], "request_closed");

    let (_, json) = send(&app.router, get(&format!("/api/requests/{id}"))).await;
    assert_eq!(json["data"]["state"], "expired");
    assert_eq!(json["data"]["failure_reason"], "deadline_passed");
}
