// src/api.rs
// Axum router for node status, transaction submission and operator actions.
// Every route is rate limited per client IP; operator routes also require an
// API key when keys are configured.

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Extension, Path, Query};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::chain::Transaction;
use crate::crypto;
use crate::error::{ErrorKind, NodeError};
use crate::node::NodeHandle;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_MEMPOOL_LIMIT: usize = 100;
const MAX_MEMPOOL_LIMIT: usize = 1000;

/// Fixed-window request counter per client IP.
pub struct FixedWindowLimiter {
    windows: Mutex<HashMap<IpAddr, (u32, Instant)>>,
    max_requests: u32,
    window: Duration,
    last_cleanup: Mutex<Instant>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window: Duration::from_secs(window_secs),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), Duration> {
        self.check_at(ip, Instant::now())
    }

    /// `Err` carries the time left in the current window.
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> Result<(), Duration> {
        self.maybe_cleanup(now);

        let mut windows = self.windows.lock();
        let (count, start) = windows.entry(ip).or_insert((0, now));
        if now.saturating_duration_since(*start) >= self.window {
            *count = 1;
            *start = now;
            Ok(())
        } else if *count < self.max_requests {
            *count += 1;
            Ok(())
        } else {
            Err(self.window - now.saturating_duration_since(*start))
        }
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < CLEANUP_INTERVAL {
                return;
            }
            *last = now;
        }
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, (_, start)| now.saturating_duration_since(*start) < self.window * 2);
        if windows.len() != before {
            info!(
                "rate limiter cleanup: removed {} stale entries ({} remaining)",
                before - windows.len(),
                windows.len()
            );
        }
    }
}

#[derive(Clone)]
struct ApiKeys(Arc<Vec<String>>);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { message: String, reason: &'static str },

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>, reason: &'static str) -> Self {
        ApiError::BadRequest {
            message: message.into(),
            reason,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Node(e) => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::Protocol | ErrorKind::Resource | ErrorKind::Fatal => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::BadRequest { reason, .. } => reason,
            ApiError::Unauthorized => "unauthorized",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::NotFound(_) => "not_found",
            ApiError::Node(e) => e.reason(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("internal error ({}): {}", self.reason(), self);
        }
        let body = json!({ "error": self.to_string(), "reason": self.reason() });
        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            let secs = ((retry_after.as_millis() as u64 + 999) / 1000).max(1);
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

type ApiResult = Result<Response, ApiError>;

fn client_ip<B>(req: &Request<B>) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

///////////////////////////////////////////////////////////////////////////
// Read-only snapshots
///////////////////////////////////////////////////////////////////////////

async fn health(Extension(node): Extension<NodeHandle>) -> ApiResult {
    let s = node.status().await?;
    let status = if s.halted.is_some() { "halted" } else { "ok" };
    Ok(Json(json!({
        "status": status,
        "nodeId": s.node_id,
        "chainId": s.chain_id,
        "height": s.height,
        "peers": s.peers,
        "uptime": s.uptime,
    }))
    .into_response())
}

async fn status(Extension(node): Extension<NodeHandle>) -> ApiResult {
    Ok(Json(node.status().await?).into_response())
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    format: Option<String>,
}

async fn metrics(
    Extension(node): Extension<NodeHandle>,
    Query(q): Query<MetricsQuery>,
) -> Response {
    let m = &node.telemetry().metrics;
    match q.format.as_deref() {
        Some("prometheus") | Some("text") => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            m.export_prometheus(),
        )
            .into_response(),
        _ => Json(m.export_json()).into_response(),
    }
}

async fn peers(Extension(node): Extension<NodeHandle>) -> ApiResult {
    let peers = node.peers().await?;
    Ok(Json(json!({ "count": peers.len(), "peers": peers })).into_response())
}

async fn consensus(Extension(node): Extension<NodeHandle>) -> ApiResult {
    Ok(Json(node.consensus().await?).into_response())
}

async fn validator(Extension(node): Extension<NodeHandle>) -> ApiResult {
    Ok(Json(node.validator().await?).into_response())
}

async fn latest_block(Extension(node): Extension<NodeHandle>) -> ApiResult {
    match node.latest_block().await? {
        Some(block) => Ok(Json(block).into_response()),
        None => Err(ApiError::NotFound("block".into())),
    }
}

async fn block_at(Extension(node): Extension<NodeHandle>, Path(height): Path<u64>) -> ApiResult {
    match node.block_at(height).await? {
        Some(block) => Ok(Json(block).into_response()),
        None => Err(ApiError::NotFound(format!("block {}", height))),
    }
}

async fn account(Extension(node): Extension<NodeHandle>, Path(address): Path<String>) -> ApiResult {
    if !crypto::is_valid_address(&address) {
        return Err(ApiError::bad_request(
            format!("'{}' is not a valid address", address),
            "invalid_address",
        ));
    }
    Ok(Json(node.account(&address).await?).into_response())
}

///////////////////////////////////////////////////////////////////////////
// POST /transactions
///////////////////////////////////////////////////////////////////////////

/// Submitted transfer. Every field is optional here so that missing fields
/// are reported together instead of as a generic decode failure.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTransaction {
    from: Option<String>,
    to: Option<String>,
    value: Option<u64>,
    nonce: Option<u64>,
    gas_price: Option<u64>,
    public_key: Option<String>,
    signature: Option<String>,
    hash: Option<String>,
}

impl SubmitTransaction {
    fn into_transaction(self) -> Result<Transaction, ApiError> {
        let mut missing = Vec::new();
        if self.from.is_none() {
            missing.push("from");
        }
        if self.to.is_none() {
            missing.push("to");
        }
        if self.value.is_none() {
            missing.push("value");
        }
        if self.nonce.is_none() {
            missing.push("nonce");
        }
        if self.public_key.is_none() {
            missing.push("publicKey");
        }
        if self.signature.is_none() {
            missing.push("signature");
        }
        if !missing.is_empty() {
            return Err(ApiError::bad_request(
                format!("missing required fields: {}", missing.join(", ")),
                "missing_fields",
            ));
        }

        let mut tx = Transaction {
            from: self.from.unwrap_or_default(),
            to: self.to.unwrap_or_default(),
            value: self.value.unwrap_or_default(),
            nonce: self.nonce.unwrap_or_default(),
            gas_price: self.gas_price.unwrap_or_default(),
            public_key: self.public_key.unwrap_or_default(),
            signature: self.signature.unwrap_or_default(),
            hash: String::new(),
        };
        tx.hash = self.hash.unwrap_or_else(|| tx.compute_hash());
        Ok(tx)
    }
}

async fn submit_transaction(
    Extension(node): Extension<NodeHandle>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> ApiResult {
    let Json(value) = body.map_err(|e| ApiError::bad_request(e.body_text(), "malformed_body"))?;
    let req: SubmitTransaction = serde_json::from_value(value)
        .map_err(|e| ApiError::bad_request(e.to_string(), "malformed_body"))?;
    let tx = req.into_transaction()?;
    let hash = node.submit_transaction(tx).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "hash": hash, "status": "pending" })),
    )
        .into_response())
}

///////////////////////////////////////////////////////////////////////////
// Operator routes
///////////////////////////////////////////////////////////////////////////

#[derive(Debug, Deserialize)]
struct MempoolQuery {
    limit: Option<usize>,
}

async fn mempool(
    Extension(node): Extension<NodeHandle>,
    Query(q): Query<MempoolQuery>,
) -> ApiResult {
    let limit = q.limit.unwrap_or(DEFAULT_MEMPOOL_LIMIT).min(MAX_MEMPOOL_LIMIT);
    Ok(Json(node.mempool(limit).await?).into_response())
}

async fn config(Extension(node): Extension<NodeHandle>) -> Response {
    Json(node.config().redacted()).into_response()
}

async fn admin_stop(Extension(node): Extension<NodeHandle>) -> Response {
    warn!("stop requested over the API");
    // respond before the API itself is torn down
    tokio::spawn(async move { node.stop().await });
    (StatusCode::ACCEPTED, Json(json!({ "status": "stopping" }))).into_response()
}

async fn admin_lock_keystore(Extension(node): Extension<NodeHandle>) -> ApiResult {
    let state = node.lock_keystore().await?;
    warn!("validator keystore locked over the API");
    Ok(Json(json!({ "keystore": state })).into_response())
}

#[derive(Debug, Deserialize)]
struct UnlockRequest {
    password: String,
}

async fn admin_unlock_keystore(
    Extension(node): Extension<NodeHandle>,
    body: Result<Json<UnlockRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text(), "malformed_body"))?;
    let state = node.unlock_keystore(&req.password).await?;
    Ok(Json(json!({ "keystore": state })).into_response())
}

///////////////////////////////////////////////////////////////////////////
// Middleware
///////////////////////////////////////////////////////////////////////////

/// API key check for operator routes. Accepts `Authorization: Bearer <key>`
/// or `X-API-Key: <key>`.
async fn auth_middleware<B>(
    Extension(keys): Extension<ApiKeys>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    if keys.0.is_empty() {
        return Ok(next.run(req).await);
    }
    let headers = req.headers();
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|h| h.to_str().ok()));

    if let Some(key) = presented {
        let key = key.trim().as_bytes();
        // length is not secret, the bytes are compared in constant time
        let valid = keys
            .0
            .iter()
            .any(|k| k.len() == key.len() && bool::from(k.as_bytes().ct_eq(key)));
        if valid {
            return Ok(next.run(req).await);
        }
    }
    warn!(
        "unauthorized request to {} from {}",
        req.uri().path(),
        client_ip(&req)
    );
    Err(ApiError::Unauthorized)
}

async fn rate_limit_middleware<B>(
    Extension(limiter): Extension<Arc<FixedWindowLimiter>>,
    req: Request<B>,
    next: Next<B>,
) -> Result<Response, ApiError> {
    let ip = client_ip(&req);
    match limiter.check(ip) {
        Ok(()) => Ok(next.run(req).await),
        Err(retry_after) => {
            warn!("rate limit exceeded for {}", ip);
            Err(ApiError::RateLimited { retry_after })
        }
    }
}

/// Request log line plus HTTP counters.
async fn logging_middleware<B>(
    Extension(node): Extension<NodeHandle>,
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let metrics = &node.telemetry().metrics;
    metrics.http_requests.inc();
    if status.is_client_error() || status.is_server_error() {
        metrics.http_errors.inc();
    }
    info!(
        "{} {} {} - {:.3}s",
        method,
        path,
        status.as_u16(),
        start.elapsed().as_secs_f64()
    );
    response
}

pub fn router(node: NodeHandle) -> Router {
    let api = &node.config().api;
    let limiter = Arc::new(FixedWindowLimiter::new(api.max_requests, api.window_secs));
    let keys = ApiKeys(Arc::new(api.api_keys.clone()));
    info!(
        "api rate limit {} requests per {}s, auth {}",
        api.max_requests,
        api.window_secs,
        if keys.0.is_empty() { "disabled" } else { "enabled" }
    );

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/peers", get(peers))
        .route("/consensus", get(consensus))
        .route("/validator", get(validator))
        .route("/blocks/latest", get(latest_block))
        .route("/blocks/:height", get(block_at))
        .route("/accounts/:address", get(account))
        .route("/transactions", post(submit_transaction));

    let protected_routes = Router::new()
        .route("/mempool", get(mempool))
        .route("/config", get(config))
        .route("/admin/stop", post(admin_stop))
        .route("/admin/keystore/lock", post(admin_lock_keystore))
        .route("/admin/keystore/unlock", post(admin_unlock_keystore))
        .layer(middleware::from_fn(auth_middleware))
        .layer(Extension(keys));

    // layers run bottom to top
    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn(rate_limit_middleware))
        .layer(Extension(limiter))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(logging_middleware))
        .layer(Extension(node))
}

/// Serve the API until the node stops.
pub async fn serve(node: NodeHandle, addr: SocketAddr) -> anyhow::Result<()> {
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    let watcher = node.clone();
    tokio::spawn(async move {
        watcher.stopped().await;
        shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!("api listening on http://{}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(router(node).into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    info!("api server stopped");
    Ok(())
}
