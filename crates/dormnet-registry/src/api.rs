//! Registry HTTP API
//!
//! `POST /api/hosts` receives the firewall's host list. The tenant routes expose
//! device self-registration and the unregistered hosts of a tenant's VLAN. The
//! administration routes create tenants and manage room assignments. All
//! routes require the shared `Key` header and are rate limited per peer.

use crate::client::RulesetSyncClient;
use crate::directory::Directory;
use crate::model::{AssignmentId, TenantId};
use crate::RegistryError;
use axum::{
    extract::{ConnectInfo, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use dormnet_common::{CommonError, HostList, MacAddress, NetworkHost, RateLimiter, API_KEY_HEADER};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    /// Tenant directory
    pub directory: Arc<Directory>,
    /// Host list cache
    pub client: Arc<RulesetSyncClient>,
    /// Expected `Key` header value
    pub api_key: Arc<str>,
    /// Per peer request limiter
    pub limiter: Arc<RateLimiter<IpAddr>>,
}

/// Device registration request
#[derive(Debug, Deserialize)]
pub struct DeviceRequest {
    /// Display name
    pub name: String,
    /// Hardware address in any common notation
    pub mac: String,
}

/// Tenant creation request
#[derive(Debug, Deserialize)]
pub struct TenantRequest {
    /// Full name
    pub name: String,
    /// Contact address, unique ignoring case
    pub email: String,
}

/// Room assignment request
#[derive(Debug, Deserialize)]
pub struct AssignmentRequest {
    /// Tenant moving in
    pub tenant: TenantId,
    /// End of the lease, open-ended if absent
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
    /// Sublet from the room's main tenant
    #[serde(default)]
    pub sub_tenant: bool,
}

/// Lease expiration change
#[derive(Debug, Deserialize)]
pub struct ExpirationRequest {
    /// New end of the lease, `null` removes it
    pub expiration: Option<DateTime<Utc>>,
}

/// Id of a created record
#[derive(Debug, Serialize, Deserialize)]
pub struct Created {
    /// New id
    pub id: u64,
}

/// Error response wrapper
pub struct ApiError(RegistryError);

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use RegistryError::*;
        let status = match &self.0 {
            TenantNotFound(_) | RoomNotFound(_) | GroupNotFound(_) | AssignmentNotFound(_) | DeviceNotFound(_)
            | UnknownAddress(_) => StatusCode::NOT_FOUND,
            DuplicateRoom(_)
            | DuplicateEmail(_)
            | TenantAlreadyAssigned(_)
            | RoomAlreadyAssigned(_)
            | RoomWithoutMainTenant(_)
            | SubTenantExpiresAfterMainTenant
            | RoomHasSubTenant(_)
            | AssignmentAlreadyEnded(_)
            | EarlyLeaseExpiration
            | NoActiveAssignment(_)
            | MacAlreadyAssigned { .. }
            | PoolExhausted
            | AddressAlreadyAssigned(_)
            | TenantHasAddress(_) => StatusCode::CONFLICT,
            InvalidDeviceName | Common(CommonError::InvalidMac(_)) => StatusCode::BAD_REQUEST,
            SelfRegistrationNotAllowed => StatusCode::FORBIDDEN,
            RateLimited => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("request failed: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

/// Build the router
pub fn router(state: ApiState) -> Router {
    let api = Router::new()
        .route("/hosts", post(push_hosts))
        .route("/tenants/:tenant/unregistered-hosts", get(unregistered_hosts))
        .route("/tenants/:tenant/devices", post(register_device))
        .route("/tenants/:tenant/devices/:mac", delete(unregister_device))
        .route("/tenants", post(create_tenant))
        .route("/rooms/:room/assignments", post(assign_room))
        .route("/assignments/:id", delete(end_assignment))
        .route("/assignments/:id/expiration", put(set_expiration))
        .layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new().nest("/api", api).with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), RegistryError> {
    let addr = listener.local_addr()?;
    info!("Registry API listening on {}", addr);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| RegistryError::Network(e.to_string()))
}

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

async fn push_hosts(State(state): State<ApiState>, Json(hosts): Json<HostList>) -> &'static str {
    state.client.update_hosts(hosts);
    "OK"
}

async fn unregistered_hosts(
    State(state): State<ApiState>,
    Path(tenant): Path<TenantId>,
) -> Result<Json<Vec<NetworkHost>>, ApiError> {
    Ok(Json(state.directory.unregistered_hosts(tenant)?))
}

async fn register_device(
    State(state): State<ApiState>,
    Path(tenant): Path<TenantId>,
    Json(request): Json<DeviceRequest>,
) -> Result<(StatusCode, &'static str), ApiError> {
    let mac: MacAddress = request.mac.parse().map_err(RegistryError::from)?;
    state.directory.self_register_device(tenant, &request.name, mac)?;
    Ok((StatusCode::CREATED, "OK"))
}

async fn unregister_device(
    State(state): State<ApiState>,
    Path((tenant, mac)): Path<(TenantId, String)>,
) -> Result<&'static str, ApiError> {
    let mac: MacAddress = mac.parse().map_err(RegistryError::from)?;
    state.directory.unregister_device(tenant, mac)?;
    Ok("OK")
}

async fn create_tenant(
    State(state): State<ApiState>,
    Json(request): Json<TenantRequest>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let id = state.directory.create_tenant(&request.name, &request.email)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn assign_room(
    State(state): State<ApiState>,
    Path(room): Path<String>,
    Json(request): Json<AssignmentRequest>,
) -> Result<(StatusCode, Json<Created>), ApiError> {
    let id = state
        .directory
        .assign_room(request.tenant, &room, request.expiration, request.sub_tenant)?;
    Ok((StatusCode::CREATED, Json(Created { id })))
}

async fn end_assignment(
    State(state): State<ApiState>,
    Path(id): Path<AssignmentId>,
) -> Result<&'static str, ApiError> {
    state.directory.end_room_assignment(id)?;
    Ok("OK")
}

async fn set_expiration(
    State(state): State<ApiState>,
    Path(id): Path<AssignmentId>,
    Json(request): Json<ExpirationRequest>,
) -> Result<&'static str, ApiError> {
    state.directory.set_lease_expiration(id, request.expiration)?;
    Ok("OK")
}
