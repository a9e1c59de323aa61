// tests/api.rs
// HTTP surface driven in-process through the router; no listener is bound.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tempfile::TempDir;
use tower::ServiceExt;

use ouro_validator::api;
use ouro_validator::chain::Transaction;
use ouro_validator::config::NodeConfig;
use ouro_validator::crypto::{self, keys::signing_key_from_seed};
use ouro_validator::node::ValidatorNode;
use ouro_validator::telemetry::Telemetry;
use ouro_validator::NodeHandle;

const API_KEY: &str = "4f6e2b1d9a0c7e3f5b8d2a6c1e9f0b7d3a5c8e2f6b1d4a9c7e0f3b5d8a2c6e1f";

async fn start_node(max_requests: u32) -> (TempDir, NodeHandle) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NodeConfig::default();
    config.node_id = "api-test".to_string();
    config.network.listen_addr = "127.0.0.1:0".to_string();
    config.storage.data_dir = dir.path().to_path_buf();
    // keep submitted transactions pending for the whole test
    config.consensus.block_interval_ms = 600_000;
    config.api.api_keys = vec![API_KEY.to_string()];
    config.api.max_requests = max_requests;
    config.api.window_secs = 60;
    let sender = signing_key_from_seed(&[2u8; 32]);
    config.genesis.balances.insert(crypto::address_of(&sender), 1_000);

    let telemetry = Telemetry::new(&config.node_id).unwrap();
    let node = ValidatorNode::new(config, telemetry)
        .with_signing_key(signing_key_from_seed(&[1u8; 32]))
        .start()
        .await
        .unwrap();
    (dir, node)
}

fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: Option<String>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let body = match body {
        Some(b) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(b)
        }
        None => Body::empty(),
    };
    let mut req = builder.body(body).unwrap();
    let peer: SocketAddr = "10.0.0.7:40000".parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(peer));
    req
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn transfer(nonce: u64) -> Value {
    let sender = signing_key_from_seed(&[2u8; 32]);
    let to = crypto::address_of(&signing_key_from_seed(&[3u8; 32]));
    let tx = Transaction::new_signed(&sender, &to, 10, nonce, 1);
    serde_json::to_value(tx).unwrap()
}

#[tokio::test]
async fn public_routes_report_node_state() {
    let (_dir, node) = start_node(1_000).await;
    let app = api::router(node.clone());

    let (status, _, body) = send(&app, request("GET", "/health", &[], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["nodeId"], "api-test");

    let (status, _, body) = send(&app, request("GET", "/status", &[], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "running");
    assert_eq!(body["isValidator"], true);

    let (status, headers, _) = send(&app, request("GET", "/metrics?format=prometheus", &[], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));

    let (status, _, body) = send(&app, request("GET", "/blocks/999", &[], None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_found");

    let (status, _, body) = send(&app, request("GET", "/accounts/nope", &[], None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "invalid_address");

    node.stop().await;
}

#[tokio::test]
async fn transaction_submission_statuses() {
    let (_dir, node) = start_node(1_000).await;
    let app = api::router(node.clone());

    let partial = json!({ "from": "0x00", "value": 5 }).to_string();
    let (status, _, body) = send(&app, request("POST", "/transactions", &[], Some(partial))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "missing_fields");
    assert!(body["error"].as_str().unwrap().contains("signature"));

    let (status, _, body) =
        send(&app, request("POST", "/transactions", &[], Some("{not json".into()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "malformed_body");

    let mut forged = transfer(0);
    forged["value"] = json!(11);
    let (status, _, body) =
        send(&app, request("POST", "/transactions", &[], Some(forged.to_string()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "invalid_transaction");

    let tx = transfer(0);
    let (status, _, body) =
        send(&app, request("POST", "/transactions", &[], Some(tx.to_string()))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["hash"], tx["hash"]);

    let (status, _, body) =
        send(&app, request("POST", "/transactions", &[], Some(tx.to_string()))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "duplicate_transaction");

    let bearer = format!("Bearer {}", API_KEY);
    let (status, _, body) = send(
        &app,
        request("GET", "/mempool?limit=5", &[("authorization", bearer.as_str())], None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["size"], 1);
    assert_eq!(body["transactions"][0]["hash"], tx["hash"]);

    let from = tx["from"].as_str().unwrap();
    let (status, _, body) = send(&app, request("GET", &format!("/accounts/{}", from), &[], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 1_000);
    assert_eq!(body["pending"], 1);

    node.stop().await;
}

#[tokio::test]
async fn operator_routes_require_api_key() {
    let (_dir, node) = start_node(1_000).await;
    let app = api::router(node.clone());

    let (status, _, body) = send(&app, request("GET", "/mempool", &[], None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["reason"], "unauthorized");

    let (status, _, _) = send(
        &app,
        request("GET", "/mempool", &[("authorization", "Bearer wrong-key")], None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(&app, request("GET", "/config", &[("x-api-key", API_KEY)], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api"]["api_keys"][0], "***");
    assert!(!body.to_string().contains(API_KEY));

    node.stop().await;
}

#[tokio::test]
async fn keystore_routes_need_a_keystore() {
    let (_dir, node) = start_node(1_000).await;
    let app = api::router(node.clone());

    let (status, _, _) = send(&app, request("POST", "/admin/keystore/lock", &[], None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // this node signs with an injected key
    let (status, _, body) = send(
        &app,
        request("POST", "/admin/keystore/lock", &[("x-api-key", API_KEY)], None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "keystore_not_configured");

    let (status, _, body) = send(
        &app,
        request(
            "POST",
            "/admin/keystore/unlock",
            &[("x-api-key", API_KEY)],
            Some(json!({ "password": "pw" }).to_string()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "keystore_not_configured");

    node.stop().await;
}

#[tokio::test]
async fn requests_over_the_window_limit_get_429() {
    let (_dir, node) = start_node(3).await;
    let app = api::router(node.clone());

    for _ in 0..3 {
        let (status, _, _) = send(&app, request("GET", "/health", &[], None)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = send(&app, request("GET", "/health", &[], None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["reason"], "rate_limited");
    let retry: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!(retry >= 1 && retry <= 60);

    node.stop().await;
}

#[tokio::test]
async fn stopped_node_reports_unavailable() {
    let (_dir, node) = start_node(1_000).await;
    let app = api::router(node.clone());
    node.stop().await;

    let (status, _, body) = send(&app, request("GET", "/status", &[], None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["reason"], "not_running");
}
