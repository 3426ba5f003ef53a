//! Operator API for the pairing ceremony and trusted devices

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use fleet_core::{PairingError, PendingRequest, TrustedDevice};
use fleet_crypto::codes::fingerprint;
use fleet_crypto::keys::decode_public_key;
use fleet_crypto::utils::constant_time_str_eq;

use crate::gateway::Gateway;

#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub admin_token: Option<String>,
}

/// Admin API router, mounted under `/api/pairing`
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/navigator-key", get(navigator_key))
        .route("/pending", get(list_pending))
        .route("/approve/:id", post(approve))
        .route("/reject/:id", post(reject))
        .route("/trusted", get(list_trusted).delete(revoke_all))
        .route("/trusted/:id", axum::routing::delete(revoke_device))
        .route("/trusted/:id/enabled", put(set_enabled))
        .route("/summary", get(summary))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn pairing_error(e: PairingError) -> ApiError {
    let status = match &e {
        PairingError::NotFound(_) | PairingError::Expired(_) => StatusCode::NOT_FOUND,
        PairingError::AlreadyPaired(_) => StatusCode::CONFLICT,
        PairingError::InvalidRequest(_) | PairingError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        PairingError::KeyAgreement(_) | PairingError::Store(_) => {
            error!(error = %e, "Admin API operation failed");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
        }
    };
    api_error(status, e.to_string())
}

/// Check admin authentication. No configured token means the API is open.
fn check_auth(headers: &HeaderMap, expected_token: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected_token else {
        return Ok(());
    };
    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .unwrap_or("");

    if !token.is_empty() && constant_time_str_eq(token, expected) {
        Ok(())
    } else {
        warn!("Admin API authentication failed");
        Err(api_error(StatusCode::UNAUTHORIZED, "Unauthorized"))
    }
}

// ----------------------------------------------------------------------------
// Views
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigatorKeyResponse {
    pub public_key: String,
    pub exchange_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingView {
    pub request_id: String,
    pub name: String,
    pub device_type: String,
    pub pairing_code: String,
    pub fingerprint: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

impl From<PendingRequest> for PendingView {
    fn from(req: PendingRequest) -> Self {
        Self {
            request_id: req.request_id,
            name: req.name,
            device_type: req.device_type,
            pairing_code: req.pairing_code,
            fingerprint: req.fingerprint,
            ipv4: req.ipv4,
            ipv6: req.ipv6,
            created_at: req.created_at.to_rfc3339(),
            expires_at: req.expires_at.to_rfc3339(),
        }
    }
}

/// A trusted device as shown to operators. Carries no secret.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    pub public_key: String,
    pub fingerprint: String,
    pub enabled: bool,
    pub connected: bool,
    pub paired_at: String,
    pub last_auth_at: Option<String>,
    pub last_seen_at: Option<String>,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

impl DeviceView {
    fn new(device: TrustedDevice, connected: bool) -> Self {
        let fingerprint = decode_public_key(&device.public_key)
            .map(|key| fingerprint(&key))
            .unwrap_or_default();
        Self {
            device_id: device.device_id,
            name: device.name,
            device_type: device.device_type,
            public_key: device.public_key,
            fingerprint,
            enabled: device.enabled,
            connected,
            paired_at: device.paired_at.to_rfc3339(),
            last_auth_at: device.last_auth_at.map(|t| t.to_rfc3339()),
            last_seen_at: device.last_seen_at.map(|t| t.to_rfc3339()),
            ipv4: device.ipv4,
            ipv6: device.ipv6,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeAllResponse {
    pub removed: usize,
    pub disconnected: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryResponse {
    pub trusted: usize,
    pub pending: usize,
    pub active_sessions: usize,
    pub connected: usize,
    pub by_type: BTreeMap<String, usize>,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

async fn navigator_key(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<NavigatorKeyResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;
    let coordinator = state.gateway.coordinator();
    Ok(Json(NavigatorKeyResponse {
        public_key: coordinator.navigator_public_key(),
        exchange_key: coordinator.navigator_exchange_key(),
    }))
}

async fn list_pending(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<Vec<PendingView>> {
    check_auth(&headers, state.admin_token.as_deref())?;
    let pending = state.gateway.coordinator().list_pending();
    Ok(Json(pending.into_iter().map(PendingView::from).collect()))
}

async fn approve(
    State(state): State<AdminState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<DeviceView> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let device = state
        .gateway
        .coordinator()
        .approve_pairing(&request_id)
        .await
        .map_err(pairing_error)?;

    let notified = state.gateway.notify_pairing_approved(&request_id, &device);
    info!(request_id = %request_id, device_id = %device.device_id, notified, "Admin API: pairing approved");

    Ok(Json(DeviceView::new(device, false)))
}

async fn reject(
    State(state): State<AdminState>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<ActionResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;

    if state.gateway.coordinator().registry().get_pending(&request_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("pairing request not found: {request_id}"),
        ));
    }

    // The Mate hears about it before the request disappears
    state.gateway.notify_pairing_rejected(&request_id);
    state.gateway.coordinator().reject_pairing(&request_id);
    info!(request_id = %request_id, "Admin API: pairing rejected");

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Pairing request {request_id} rejected"),
    }))
}

async fn list_trusted(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<Vec<DeviceView>> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let devices = state
        .gateway
        .coordinator()
        .list_trusted()
        .await
        .map_err(pairing_error)?;
    let connections = state.gateway.connections();
    Ok(Json(
        devices
            .into_iter()
            .map(|device| {
                let connected = connections.is_authenticated(&device.device_id);
                DeviceView::new(device, connected)
            })
            .collect(),
    ))
}

async fn revoke_device(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<ActionResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let removed = state
        .gateway
        .coordinator()
        .revoke_device(&device_id)
        .await
        .map_err(pairing_error)?;
    if !removed {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("device not found: {device_id}"),
        ));
    }

    state.gateway.disconnect_device(&device_id, "Device revoked");
    info!(device_id = %device_id, "Admin API: device revoked");

    Ok(Json(ActionResponse {
        success: true,
        message: format!("Device {device_id} revoked"),
    }))
}

async fn revoke_all(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<RevokeAllResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let removed = state
        .gateway
        .coordinator()
        .revoke_all()
        .await
        .map_err(pairing_error)?;

    let mut disconnected = 0;
    for device_id in state.gateway.connected_devices() {
        if state.gateway.disconnect_device(&device_id, "Device revoked") {
            disconnected += 1;
        }
    }
    warn!(removed, disconnected, "Admin API: all devices revoked");

    Ok(Json(RevokeAllResponse {
        removed,
        disconnected,
    }))
}

async fn set_enabled(
    State(state): State<AdminState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EnabledRequest>,
) -> ApiResult<ActionResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let found = state
        .gateway
        .coordinator()
        .set_device_enabled(&device_id, body.enabled)
        .await
        .map_err(pairing_error)?;
    if !found {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("device not found: {device_id}"),
        ));
    }

    if !body.enabled {
        state.gateway.disconnect_device(&device_id, "Device disabled");
    }

    Ok(Json(ActionResponse {
        success: true,
        message: format!(
            "Device {device_id} {}",
            if body.enabled { "enabled" } else { "disabled" }
        ),
    }))
}

async fn summary(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> ApiResult<SummaryResponse> {
    check_auth(&headers, state.admin_token.as_deref())?;

    let summary = state
        .gateway
        .coordinator()
        .summary()
        .await
        .map_err(pairing_error)?;
    Ok(Json(SummaryResponse {
        trusted: summary.trusted,
        pending: summary.pending,
        active_sessions: summary.active_sessions,
        connected: state.gateway.connected_devices().len(),
        by_type: summary.by_type,
    }))
}
