//! HTTP service for the NexusX gateway. Wires an [`axum::Router`] around a
//! shared [`gateway_core::GatewayCore`]: the admin/read endpoints are thin
//! handlers that call straight into the core's components, while the
//! `/v1/:listingSlug/*` hot path hands the whole request to
//! [`gateway_core::Pipeline`] and copies its [`PipelineResponse`] back out —
//! the framework adapter stays thin, with all orchestration logic living in
//! `gateway-core`.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use chrono::Utc;
use gateway_config::GatewayConfig;
use gateway_core::{GatewayCore, InboundCall, InboundRequest, Pipeline};
use gateway_types::{BundleRegisterRequest, GatewayError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";
const HEADER_FORWARDED_PROTO: &str = "x-forwarded-proto";
const HEADER_HOST: &str = "host";
const HEADER_AUTHORIZATION: &str = "authorization";
const HEADER_NEXUSX_KEY: &str = "x-nexusx-key";

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<GatewayCore>,
    started_at: Instant,
}

/// A [`GatewayError`] that knows how to render itself as the JSON error
/// shape. Defined locally (rather than implementing `IntoResponse` on the
/// foreign `GatewayError` directly) purely to satisfy the orphan rule — the
/// mapping itself is exactly the one `PipelineResponse::from_error` uses.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        (status, axum::Json(body)).into_response()
    }
}

/// Builds the full router described in "HTTP surface".
pub fn build_router(core: Arc<GatewayCore>) -> Router {
    let state = AppState {
        core: Arc::clone(&core),
        started_at: Instant::now(),
    };

    let cors = cors_layer(&core.config);
    let body_limit = core.config.service.max_request_body_bytes as usize;

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/pricing/:slug", get(pricing))
        .route("/reliability/:slug", get(reliability))
        .route("/bundle-sessions/register", post(register_bundle_session))
        .route("/bundle-sessions/:id", get(get_bundle_session))
        .route("/bundle-sessions/:id/finalize", post(finalize_bundle_session))
        .route("/v1/:listing_slug/*rest", any(proxy_hot_path))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let mut layer = CorsLayer::new().allow_methods(tower_http::cors::Any);
    layer = if config.service.cors.allowed_origins.iter().any(|o| o == "*") {
        layer.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = config
            .service
            .cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    };
    if config.service.cors.allow_credentials {
        layer = layer.allow_credentials(true);
    }
    layer
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
}

async fn health() -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(rename = "uptimeS")]
    uptime_s: u64,
    #[serde(rename = "cacheStats")]
    cache_stats: gateway_core::CacheStats,
}

async fn ready(State(state): State<AppState>) -> axum::Json<ReadyResponse> {
    axum::Json(ReadyResponse {
        status: "ready",
        uptime_s: state.started_at.elapsed().as_secs(),
        cache_stats: state.core.resolver.stats(),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    #[serde(rename = "uptimeSeconds")]
    uptime_seconds: i64,
    #[serde(rename = "cacheStats")]
    cache_stats: gateway_core::CacheStats,
}

async fn status(State(state): State<AppState>) -> axum::Json<StatusResponse> {
    axum::Json(StatusResponse {
        service: "nexusx-gateway",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.core.uptime_seconds(),
        cache_stats: state.core.resolver.stats(),
    })
}

#[derive(Serialize)]
struct FeeSplitView {
    #[serde(rename = "buyerPays")]
    buyer_pays: rust_decimal::Decimal,
    #[serde(rename = "providerReceives")]
    provider_receives: rust_decimal::Decimal,
    #[serde(rename = "platformFee")]
    platform_fee: rust_decimal::Decimal,
    #[serde(rename = "feeRate")]
    fee_rate: rust_decimal::Decimal,
}

#[derive(Serialize)]
struct CapacityView {
    #[serde(rename = "requestsPerMinute")]
    requests_per_minute: u32,
}

#[derive(Serialize)]
struct PricingResponse {
    #[serde(rename = "currentPriceUsdc")]
    current_price_usdc: rust_decimal::Decimal,
    #[serde(rename = "floorPriceUsdc")]
    floor_price_usdc: rust_decimal::Decimal,
    #[serde(rename = "feeSplit")]
    fee_split: FeeSplitView,
    capacity: CapacityView,
}

/// `GET /pricing/:slug`.
async fn pricing(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<axum::Json<PricingResponse>, ApiError> {
    let route = state
        .core
        .resolver
        .resolve_by_slug(&slug)
        .await?
        .ok_or(GatewayError::ListingNotFound)?;

    let fee_rate = state.core.config.billing.platform_fee_rate;
    let (platform_fee, provider_amount) = gateway_types::fee_split(route.current_price, fee_rate);

    Ok(axum::Json(PricingResponse {
        current_price_usdc: route.current_price,
        floor_price_usdc: route.floor_price,
        fee_split: FeeSplitView {
            buyer_pays: route.current_price,
            provider_receives: provider_amount,
            platform_fee,
            fee_rate,
        },
        capacity: CapacityView {
            requests_per_minute: route.capacity_requests_per_minute,
        },
    }))
}

#[derive(Serialize)]
struct ReliabilityResponse {
    slug: String,
    reliability: gateway_types::ReliabilityScore,
}

/// `GET /reliability/:slug`.
async fn reliability(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<axum::Json<ReliabilityResponse>, ApiError> {
    state
        .core
        .resolver
        .resolve_by_slug(&slug)
        .await?
        .ok_or(GatewayError::ListingNotFound)?;

    let score = state.core.reliability.get_score(&slug);
    Ok(axum::Json(ReliabilityResponse {
        slug,
        reliability: score,
    }))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    peer_addr: &str,
) -> Result<gateway_types::RequestContext, ApiError> {
    let inbound = InboundRequest {
        bearer_header: header_str(headers, HEADER_AUTHORIZATION),
        nexusx_key_header: header_str(headers, HEADER_NEXUSX_KEY),
        api_key_query_param: None,
        forwarded_for_header: header_str(headers, HEADER_FORWARDED_FOR),
        peer_addr,
    };
    Ok(state.core.authenticator.authenticate(&inbound).await?)
}

#[derive(Deserialize)]
struct BundleRegisterHttpRequest {
    #[serde(rename = "bundleSlug")]
    bundle_slug: String,
    #[serde(rename = "toolSlugs")]
    tool_slugs: Vec<String>,
    #[serde(rename = "targetBundlePriceUsdc")]
    target_bundle_price: rust_decimal::Decimal,
    #[serde(rename = "expiresAt", default)]
    expires_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

/// `POST /bundle-sessions/register` (authenticated).
async fn register_bundle_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<BundleRegisterHttpRequest>,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers, &peer.ip().to_string()).await?;
    let api_key_id = ctx.api_key_id.ok_or(GatewayError::Unauthorized)?;

    let request = BundleRegisterRequest {
        buyer_id: ctx.buyer_id,
        api_key_id,
        bundle_slug: body.bundle_slug,
        tool_slugs: body.tool_slugs,
        target_bundle_price: body.target_bundle_price,
        platform_fee_rate: state.core.config.bundle.platform_fee_rate,
        expires_at: body.expires_at,
        metadata: body.metadata,
    };

    let session = state.core.bundle_engine.register(request, Utc::now()).await?;
    Ok((StatusCode::CREATED, axum::Json(session)).into_response())
}

/// `GET /bundle-sessions/:id` (authenticated).
async fn get_bundle_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers, &peer.ip().to_string()).await?;
    let session = state
        .core
        .bundle_engine
        .get(id)
        .await?
        .filter(|s| s.buyer_id == ctx.buyer_id)
        .ok_or(GatewayError::BundleSessionNotFound)?;
    Ok(axum::Json(session).into_response())
}

/// `POST /bundle-sessions/:id/finalize` (authenticated).
async fn finalize_bundle_session(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers, &peer.ip().to_string()).await?;
    let outcome = state
        .core
        .bundle_engine
        .finalize(id, ctx.buyer_id, Utc::now())
        .await?;
    Ok(axum::Json(outcome.result).into_response())
}

/// The `ALL /v1/:listingSlug/*` proxy hot path. Extracts everything
/// [`InboundCall`] needs from the raw axum request and hands the whole call
/// to [`Pipeline::handle_call`]; the pipeline's `PipelineResponse` is copied
/// straight into an axum `Response`.
async fn proxy_hot_path(
    State(state): State<AppState>,
    Path((listing_slug, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let sub_path = format!("/{rest}");
    let resource_url = build_resource_url(&headers, &listing_slug, &rest, query.as_deref());
    let peer_addr = peer.ip().to_string();

    let call = InboundCall {
        listing_slug: &listing_slug,
        sub_path: &sub_path,
        query: query.as_deref(),
        method,
        headers: &headers,
        body: body.to_vec(),
        peer_addr: &peer_addr,
        resource_url: &resource_url,
    };

    let pipeline = Pipeline::new(&state.core);
    let response = pipeline.handle_call(call).await;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = response.headers;
    }
    builder
        .body(axum::body::Body::from(response.body))
        .unwrap_or_else(|err| {
            error!(%err, "failed to build proxy response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        })
}

fn build_resource_url(headers: &HeaderMap, listing_slug: &str, rest: &str, query: Option<&str>) -> String {
    let scheme = header_str(headers, HEADER_FORWARDED_PROTO).unwrap_or("https");
    let host = header_str(headers, HEADER_HOST).unwrap_or("gateway.invalid");
    match query {
        Some(query) if !query.is_empty() => {
            format!("{scheme}://{host}/v1/{listing_slug}/{rest}?{query}")
        }
        _ => format!("{scheme}://{host}/v1/{listing_slug}/{rest}"),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Starts the HTTP service and blocks until a shutdown signal is received.
pub async fn start_service(core: Arc<GatewayCore>) -> anyhow::Result<()> {
    let bind_address = core.config.service.bind_address.clone();
    let port = core.config.service.port;
    let addr: SocketAddr = format!("{bind_address}:{port}").parse()?;

    let app = build_router(Arc::clone(&core));

    info!(%addr, "starting NexusX gateway HTTP service");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("listener stopped, draining in-flight background work");
    core.shutdown().await;
    Ok(())
}

/// Waits for SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::InMemoryStore;
    use gateway_types::{ApiKeyRecord, ApiKeyState, Route, RouteState};
    use rust_decimal_macros::dec;

    const TEST_SECRET: &str = "nxs_testtest_xxxxxxxxxxxxxxxxxxxxxxxxxxxx";

    fn test_core() -> Arc<GatewayCore> {
        test_core_with_upstream("https://upstream.example.com")
    }

    fn test_core_with_upstream(upstream_base_url: &str) -> Arc<GatewayCore> {
        let store = Arc::new(InMemoryStore::new());
        store.seed_route(Route {
            id: Uuid::new_v4(),
            slug: "weather".to_string(),
            upstream_base_url: upstream_base_url.to_string(),
            capacity_requests_per_minute: 600,
            current_price: dec!(0.005),
            floor_price: dec!(0.0001),
            provider_payout_address: "0xprovider".to_string(),
            state: RouteState::Active,
            sandbox: false,
            created_at: Utc::now(),
        });
        store.seed_api_key(ApiKeyRecord {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            prefix: "nxs_test".to_string(),
            secret_hash: sha256_hex(TEST_SECRET),
            state: ApiKeyState::Active,
            rate_limit_rpm: 60,
            ip_allow_list: vec![],
            expires_at: None,
            wallet_address: "0xbuyer".to_string(),
            last_used_at: None,
            created_at: Utc::now(),
        });

        let config = GatewayConfig::default();
        Arc::new(
            GatewayCore::new(
                config,
                store,
                Arc::new(gateway_core::LoggingDemandSignalSink),
            )
            .unwrap(),
        )
    }

    fn sha256_hex(value: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn pricing_returns_fee_split_for_known_listing() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/pricing/weather").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body["currentPriceUsdc"], "0.005");
    }

    #[tokio::test]
    async fn pricing_404s_for_unknown_listing() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/pricing/nonexistent").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bundle_register_requires_authentication() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server
            .post("/bundle-sessions/register")
            .json(&serde_json::json!({
                "bundleSlug": "combo",
                "toolSlugs": ["weather"],
                "targetBundlePriceUsdc": "0.004"
            }))
            .await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reliability_404s_for_unknown_listing() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/reliability/nonexistent").await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    /// End-to-end individual-call happy path: an authenticated call is
    /// proxied to a stubbed upstream, billed, and folded into the listing's
    /// reliability score.
    #[tokio::test]
    async fn proxies_authenticated_call_and_records_reliability() {
        let upstream = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/forecast"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("sunny"))
            .mount(&upstream)
            .await;

        let core = test_core_with_upstream(&upstream.uri());
        let core_handle = Arc::clone(&core);
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();

        let response = server
            .get("/v1/weather/forecast")
            .add_header("authorization", format!("Bearer {TEST_SECRET}"))
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), "sunny");
        assert!(response.headers().contains_key("x-ratelimit-remaining"));

        let score = core_handle.reliability.get_score("weather");
        assert_eq!(score.sample_count, 1);
        assert_eq!(score.error_rate, 0.0);
    }

    #[tokio::test]
    async fn unauthenticated_proxy_call_is_rejected() {
        let core = test_core();
        let app = build_router(core);
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/v1/weather/forecast").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }
}
