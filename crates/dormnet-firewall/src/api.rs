//! Ruleset API served to the tenant registry

use crate::controller::RulesetController;
use crate::watcher::HostSnapshot;
use crate::FirewallError;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dormnet_common::wire::decode_batch;
use dormnet_common::{HostList, RateLimiter, API_KEY_HEADER, FIREWALL_API_PREFIX};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    /// Ruleset holder
    pub controller: Arc<RulesetController>,
    /// Host discovery
    pub hosts: Arc<dyn HostSnapshot>,
    /// Expected `Key` header value
    pub api_key: Arc<str>,
    /// Per peer request limiter
    pub limiter: Arc<RateLimiter<IpAddr>>,
}

/// Build the router
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/test", get(test))
        .route("/hosts", get(hosts))
        .route("/rules", post(rules))
        .layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new().nest(FIREWALL_API_PREFIX, api).with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FirewallError> {
    let addr = listener.local_addr()?;
    info!("Firewall API listening on {}", addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| FirewallError::Network(e.to_string()))
}

/// Shared secret check, then per peer rate limit
async fn guard(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if key != Some(&*state.api_key) {
        warn!(path = %request.uri().path(), "rejected request with incorrect API key");
        return (StatusCode::FORBIDDEN, "incorrect API key").into_response();
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    if !state.limiter.try_acquire(peer) {
        warn!(%peer, "rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded").into_response();
    }

    next.run(request).await
}

async fn test() -> &'static str {
    "OK"
}

async fn hosts(State(state): State<ApiState>) -> Json<HostList> {
    Json(state.hosts.current_hosts())
}

async fn rules(State(state): State<ApiState>, body: Bytes) -> Response {
    let rulesets = match decode_batch(&body) {
        Ok(rulesets) => rulesets,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let controller = state.controller.clone();
    let result = tokio::task::spawn_blocking(move || controller.activate(&rulesets)).await;
    match result {
        Ok(Ok(_)) => "OK".into_response(),
        Ok(Err(e)) => {
            warn!("ruleset activation failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
