//! Integration coverage for the HTTP binding (spec §6): requests go through
//! the real `axum::Router` built by `ApiServer::build_router`, including
//! the auth and rate-limit layers, rather than calling service methods
//! directly the way `end_to_end.rs` does.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::api::ApiServer;
use crate::config::{Config, DatabaseConfig, SchedulerConfig, ServerConfig};
use crate::context::Context;
use crate::monitoring::{MonitoringConfig, SystemMonitor};

const API_KEY: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_key: API_KEY.to_string(),
            allowed_origins: vec![],
            default_wait_timeout_secs: 2,
            min_wait_timeout_secs: 1,
            max_wait_timeout_secs: 10,
        },
        database: DatabaseConfig { path: String::new() },
        scheduler: SchedulerConfig {
            tick_interval_secs: 1,
            log_retention_days: 7,
            waiting_drop_threshold_secs: 300,
        },
        seed_path: None,
    }
}

async fn test_server() -> ApiServer {
    let context = Context::build_in_memory(test_config()).await.unwrap();
    let monitor = Arc::new(SystemMonitor::new(
        MonitoringConfig::default(),
        context.db.clone(),
        context.registry.clone(),
        context.tick_latency.clone(),
    ));
    ApiServer::new(context, monitor)
}

fn with_connect_info(mut req: Request<Body>, octet: u8) -> Request<Body> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, octet)), 0);
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

fn authed_json(method: &str, uri: &str, body: Value, octet: u8) -> Request<Body> {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-api-key", API_KEY)
        .body(Body::from(body.to_string()))
        .unwrap();
    with_connect_info(req, octet)
}

fn authed_get(uri: &str, octet: u8) -> Request<Body> {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    with_connect_info(req, octet)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_reachable_without_an_api_key() {
    let server = test_server().await;
    let router = server.build_router();

    let req = with_connect_info(
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
        1,
    );
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_route_without_api_key_is_rejected() {
    let server = test_server().await;
    let router = server.build_router();

    let req = with_connect_info(
        Request::builder().uri("/agents").body(Body::empty()).unwrap(),
        2,
    );
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_assign_and_ack_flow_round_trips_through_http() {
    let server = test_server().await;
    let router = server.build_router();

    let register_req = authed_json(
        "POST",
        "/agents",
        json!({
            "id": "agent-1",
            "display_name": "Agent One",
            "capabilities": ["code-writing"],
        }),
        10,
    );
    let response = router.clone().oneshot(register_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let assign_req = authed_json(
        "POST",
        "/tasks",
        json!({
            "prompt": "write a function",
            "to": {"required_capabilities": ["code-writing"]},
            "from": {"type": "user", "id": "u1", "name": "u1"},
        }),
        11,
    );
    let response = router.clone().oneshot(assign_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let assigned = body_json(response).await;
    let task_id = assigned["task_id"].as_str().unwrap().to_string();

    let wait_req = authed_json(
        "POST",
        "/agents/agent-1/wait",
        json!({"capabilities": ["code-writing"], "timeout_sec": 2}),
        12,
    );
    let response = router.clone().oneshot(wait_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let delivery = body_json(response).await;
    assert_eq!(delivery["kind"], "task");
    assert_eq!(delivery["id"], task_id);
    assert_eq!(delivery["status"], "pending_ack");

    let ack_req = authed_json(
        "POST",
        &format!("/tasks/{task_id}/ack"),
        json!({"agent_id": "agent-1"}),
        13,
    );
    let response = router.clone().oneshot(ack_req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let acked = body_json(response).await;
    assert_eq!(acked["status"], "assigned");
    assert_eq!(acked["assigned_to"], "agent-1");
}

#[tokio::test]
async fn ack_with_the_wrong_agent_is_rejected_over_http() {
    let server = test_server().await;
    let router = server.build_router();

    router
        .clone()
        .oneshot(authed_json(
            "POST",
            "/agents",
            json!({"id": "agent-1", "capabilities": ["code-writing"]}),
            20,
        ))
        .await
        .unwrap();

    let assign_req = authed_json(
        "POST",
        "/tasks",
        json!({
            "prompt": "write a function",
            "to": {"required_capabilities": ["code-writing"]},
            "from": {"type": "user", "id": "u1", "name": "u1"},
        }),
        21,
    );
    let response = router.clone().oneshot(assign_req).await.unwrap();
    let assigned = body_json(response).await;
    let task_id = assigned["task_id"].as_str().unwrap().to_string();

    router
        .clone()
        .oneshot(authed_json(
            "POST",
            "/agents/agent-1/wait",
            json!({"capabilities": ["code-writing"], "timeout_sec": 2}),
            22,
        ))
        .await
        .unwrap();

    let bad_ack = authed_json(
        "POST",
        &format!("/tasks/{task_id}/ack"),
        json!({"agent_id": "someone-else"}),
        23,
    );
    let response = router.oneshot(bad_ack).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn listing_agents_reports_registered_capabilities() {
    let server = test_server().await;
    let router = server.build_router();

    router
        .clone()
        .oneshot(authed_json(
            "POST",
            "/agents",
            json!({"id": "agent-1", "capabilities": ["code-writing", "review"]}),
            30,
        ))
        .await
        .unwrap();

    let response = router.oneshot(authed_get("/agents", 31)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let agents = body_json(response).await;
    let list = agents.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], "agent-1");
    assert_eq!(list[0]["status"], "OFFLINE");
}
