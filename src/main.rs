mod amazon;
mod fallback;
mod gateway;
mod http;
mod idempotency;
mod ident;
mod jobs;
mod metrics;
mod models;
mod reconcile;
mod scan;
mod scoring;
mod security;
mod summary;

use amazon::lookup::{BulkLookupClient, LookupField};
use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use gateway::{ClientIdentity, GatewayError, LookupCall, RequestCost, TokenGuard};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, LiveLookupResult, MarketplaceId, RetryRequest, ScanRequest, ScanResponse,
    TokenGuardMode,
};
use scan::{ScanError, ScanErrorKind, Scanner};
use security::{AuthState, OrgContext, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "sourcer.api", "server crashed: {err}");
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    init_tracing();

    let auth_state = AuthState::from_env();
    let scanner = Scanner::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(scanner.clone());
    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(serde_json::json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());
    let state = AppState {
        scanner,
        queue,
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/scans", post(create_scan))
        .route("/scans/retry", post(retry_scan))
        .route("/scans/compare", post(compare_summaries))
        .route("/lookup", post(direct_lookup))
        .nest(
            "/jobs",
            Router::new()
                .route("/scans", post(enqueue_scan_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "sourcer.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    scanner: Scanner<BulkLookupClient>,
    queue: jobs::JobQueue,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, ScanResponse>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
///
/// Returns a small JSON payload with `status` and `service`.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "sourcer-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Scan(ScanError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Sourcer API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4 * 1024 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(axum::http::StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

/// Run a full scan synchronously.
///
/// - Method: `POST`
/// - Path: `/scans`
/// - Auth: `Authorization: Bearer <key>` or `X-Sourcer-Key: <key>`
/// - Body: `ScanRequest`
/// - Response: `ScanResponse` (products + summary + per-stage transcript)
///
/// An `Idempotency-Key` header replays the stored response for repeat
/// submissions (redis when configured, in-memory otherwise).
async fn create_scan(
    State(state): State<AppState>,
    Extension(context): Extension<OrgContext>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    crate::metrics::inc_requests("/scans");
    info!(
        target = "sourcer.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        rows = payload.supplier_rows.len(),
        "scan invoked",
    );

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let response = state.scanner.run(payload, Some(context)).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &response, ttl).await;
            return Ok(Json(response));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let response = state.scanner.run(payload, Some(context)).await?;
        state.idempotency.lock().await.insert(key, response.clone());
        return Ok(Json(response));
    }

    let response = state.scanner.run(payload, Some(context)).await?;
    Ok(Json(response))
}

/// Re-run matching for unmatched rows with identifier overrides.
///
/// - Method: `POST`
/// - Path: `/scans/retry`
/// - Body: `RetryRequest`
/// - Response: `ScanResponse` over the recombined row set
async fn retry_scan(
    State(state): State<AppState>,
    Extension(context): Extension<OrgContext>,
    Json(payload): Json<RetryRequest>,
) -> Result<Json<ScanResponse>, AppError> {
    crate::metrics::inc_requests("/scans/retry");
    let response = state.scanner.retry_unmatched(payload, Some(context)).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct CompareRequest {
    earlier: summary::RunSummary,
    later: summary::RunSummary,
}

/// Run-over-run movement between two stored summaries. Pure; nothing is
/// persisted server-side.
async fn compare_summaries(
    Json(payload): Json<CompareRequest>,
) -> Json<summary::SummaryDelta> {
    crate::metrics::inc_requests("/scans/compare");
    Json(summary::compare(&payload.earlier, &payload.later))
}

#[derive(Debug, Deserialize)]
struct LookupRequest {
    field: LookupField,
    values: Vec<String>,
    #[serde(default)]
    marketplace: MarketplaceId,
    #[serde(default)]
    gateway_token: Option<String>,
    #[serde(default)]
    token_guard_mode: TokenGuardMode,
    #[serde(default)]
    token_guard_floor: i64,
}

#[derive(Debug, Serialize)]
struct LookupResponse {
    records: Vec<LiveLookupResult>,
    cost: RequestCost,
}

/// Direct gateway invocation for interactive identifier checks. A token
/// guard block comes back as 429 here rather than a deferral.
async fn direct_lookup(
    State(state): State<AppState>,
    Extension(context): Extension<OrgContext>,
    Json(payload): Json<LookupRequest>,
) -> Result<Json<LookupResponse>, AppError> {
    crate::metrics::inc_requests("/lookup");
    let (asins, codes) = match payload.field {
        LookupField::Asin => (payload.values, Vec::new()),
        LookupField::Code => (Vec::new(), payload.values),
    };
    let call = LookupCall {
        client: ClientIdentity::new(context.org_id.clone(), context.api_key_id.clone()),
        auth_token: payload.gateway_token,
        asins,
        codes,
        marketplace: payload.marketplace,
        guard: TokenGuard {
            mode: payload.token_guard_mode,
            floor: payload.token_guard_floor,
        },
    };
    let reply = state.scanner.gateway().execute(call).await?;
    if reply.guard_blocked() {
        return Err(AppError::GuardBlocked {
            tokens_remaining: reply.cost.tokens_remaining,
        });
    }
    Ok(Json(LookupResponse {
        records: reply.records,
        cost: reply.cost,
    }))
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_scan_job(
    State(state): State<AppState>,
    Extension(context): Extension<OrgContext>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/scans");
    let id = state
        .queue
        .enqueue_scan(payload, context)
        .await
        .map_err(|err| AppError::Scan(ScanError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Scan(ScanError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Scan(ScanError::invalid_input("jobs", "not_found")))
    }
}

#[derive(Debug)]
enum AppError {
    Scan(ScanError),
    Gateway(GatewayError),
    GuardBlocked { tokens_remaining: Option<i64> },
}

impl From<ScanError> for AppError {
    fn from(value: ScanError) -> Self {
        Self::Scan(value)
    }
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Scan(err) => {
                let status = match err.kind() {
                    ScanErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    ScanErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Gateway(err) => {
                let (status, retry_after) = match &err {
                    GatewayError::Unauthorized => (StatusCode::UNAUTHORIZED, None),
                    GatewayError::RateLimited { retry_after_secs } => {
                        (StatusCode::TOO_MANY_REQUESTS, Some(*retry_after_secs))
                    }
                    GatewayError::PayloadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, None),
                    GatewayError::CircuitOpen { retry_after_secs } => {
                        (StatusCode::SERVICE_UNAVAILABLE, Some(*retry_after_secs))
                    }
                    GatewayError::Upstream(_) => (StatusCode::BAD_GATEWAY, None),
                };
                let payload = ApiError {
                    error: "gateway".to_string(),
                    detail: Some(err.to_string()),
                };
                let mut response = (status, Json(payload)).into_response();
                if let Some(secs) = retry_after
                    && let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string())
                {
                    response
                        .headers_mut()
                        .insert(axum::http::header::RETRY_AFTER, value);
                }
                response
            }
            AppError::GuardBlocked { tokens_remaining } => {
                let payload = ApiError {
                    error: "token_guard".to_string(),
                    detail: Some(match tokens_remaining {
                        Some(remaining) => {
                            format!("token budget exhausted ({remaining} remaining)")
                        }
                        None => "token budget exhausted".to_string(),
                    }),
                };
                (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
