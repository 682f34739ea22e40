use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::control::StreamStats;
use crate::domain::{Peer, PeerCapabilities, Stream};
use crate::error::ApiError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateStreamRequest {
    pub name: String,
    pub owner_peer_id: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub max_peers: Option<usize>,
}

#[derive(Deserialize)]
pub struct JoinStreamRequest {
    pub peer_id: String,
    #[serde(default)]
    pub is_publisher: bool,
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub codecs: Option<Vec<String>>,
    #[serde(default)]
    pub can_relay: bool,
}

#[derive(Deserialize)]
pub struct LeaveStreamRequest {
    pub peer_id: String,
}

#[derive(Deserialize)]
pub struct PublishRequest {
    pub stream_id: String,
    pub peer_id: String,
}

#[derive(Deserialize)]
pub struct SubscribeRequest {
    pub stream_id: String,
    pub peer_id: String,
    /// Source peers to attach; defaults to the stream's publishers.
    #[serde(default)]
    pub sources: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct AnswerRequest {
    pub peer_id: String,
    pub sdp: String,
}

#[derive(Deserialize)]
pub struct DisconnectRequest {
    pub peer_id: String,
}

#[derive(Serialize)]
pub struct SdpOfferResponse {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Deserialize)]
pub struct PathQuery {
    pub from: String,
    pub to: String,
}

#[derive(Serialize)]
pub struct PathResponse {
    pub path: Vec<String>,
    pub hops: usize,
}

// ---------------------------------------------------------------------------
// Auth gate
// ---------------------------------------------------------------------------

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.config.auth_enabled {
        return Ok(());
    }
    crate::auth::require_bearer(headers, &state.config.jwt_secret).map(|_| ())
}

// ---------------------------------------------------------------------------
// Stream CRUD
// ---------------------------------------------------------------------------

/// POST /api/v1/streams
pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateStreamRequest>,
) -> Result<Json<Stream>, ApiError> {
    require_auth(&state, &headers)?;
    let owner_user = body
        .owner_user_id
        .unwrap_or_else(|| body.owner_peer_id.clone());
    let stream = state
        .service
        .create_stream(&body.name, &body.owner_peer_id, &owner_user, body.max_peers)
        .await?;
    Ok(Json(stream))
}

/// GET /api/v1/streams
pub async fn list_streams(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Stream>>, ApiError> {
    Ok(Json(state.service.list_streams().await?))
}

/// GET /api/v1/streams/:id
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<Stream>, ApiError> {
    Ok(Json(state.service.get_stream(&stream_id).await?))
}

/// DELETE /api/v1/streams/:id
pub async fn delete_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(stream_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    state.service.delete_stream(&stream_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// POST /api/v1/streams/:id/join
pub async fn join_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(stream_id): Path<String>,
    Json(body): Json<JoinStreamRequest>,
) -> Result<Json<Peer>, ApiError> {
    require_auth(&state, &headers)?;
    let defaults = PeerCapabilities::default();
    let capabilities = PeerCapabilities {
        max_bitrate_kbps: body.max_bitrate_kbps.unwrap_or(0),
        codecs: body.codecs.unwrap_or(defaults.codecs),
        is_publisher: body.is_publisher,
        can_relay: body.can_relay,
    };
    let peer = state
        .service
        .join(&stream_id, &body.peer_id, capabilities)
        .await?;
    Ok(Json(peer))
}

/// POST /api/v1/streams/:id/leave
pub async fn leave_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(stream_id): Path<String>,
    Json(body): Json<LeaveStreamRequest>,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    state.service.leave(&stream_id, &body.peer_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/mesh/path?from=..&to=.. — shortest relay route.
pub async fn mesh_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> Result<Json<PathResponse>, ApiError> {
    let path = state.mesh.get_optimal_path(&query.from, &query.to).await?;
    let hops = path.len().saturating_sub(1);
    Ok(Json(PathResponse { path, hops }))
}

/// GET /api/v1/streams/:id/stats
pub async fn stream_stats(
    State(state): State<Arc<AppState>>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamStats>, ApiError> {
    Ok(Json(state.service.get_stats(&stream_id).await?))
}

// ---------------------------------------------------------------------------
// WebRTC helpers — delegate to the SFU
// ---------------------------------------------------------------------------

/// POST /api/v1/webrtc/publish
pub async fn webrtc_publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PublishRequest>,
) -> Result<Json<SdpOfferResponse>, ApiError> {
    require_auth(&state, &headers)?;
    let offer = state
        .sfu
        .create_publisher(&body.peer_id, &body.stream_id)
        .await?;
    info!(peer_id = %body.peer_id, stream_id = %body.stream_id, "publisher offer issued");
    Ok(Json(SdpOfferResponse {
        sdp: offer.sdp,
        sdp_type: "offer".to_string(),
    }))
}

/// POST /api/v1/webrtc/subscribe
pub async fn webrtc_subscribe(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SubscribeRequest>,
) -> Result<Json<SdpOfferResponse>, ApiError> {
    require_auth(&state, &headers)?;

    let sources = match body.sources {
        Some(sources) if !sources.is_empty() => sources,
        _ => {
            // Default to the stream's publishers.
            state
                .store
                .find_by_stream(&body.stream_id)
                .await?
                .into_iter()
                .filter(|p| p.capabilities.is_publisher)
                .map(|p| p.id)
                .collect()
        }
    };

    let offer = state
        .sfu
        .create_subscriber(&body.peer_id, &body.stream_id, sources)
        .await?;
    info!(peer_id = %body.peer_id, stream_id = %body.stream_id, "subscriber offer issued");
    Ok(Json(SdpOfferResponse {
        sdp: offer.sdp,
        sdp_type: "offer".to_string(),
    }))
}

/// POST /api/v1/webrtc/answer
pub async fn webrtc_answer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AnswerRequest>,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    crate::signal::validate_sdp(&body.sdp).map_err(|_| ApiError::invalid_sdp())?;

    // The peer holds at most one session of each kind; try both.
    match state
        .sfu
        .handle_publisher_answer(&body.peer_id, body.sdp.clone())
        .await
    {
        Ok(()) => return Ok(StatusCode::NO_CONTENT),
        Err(crate::error::Error::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    state
        .sfu
        .handle_subscriber_answer(&body.peer_id, body.sdp)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/webrtc/ice-servers — ICE configuration for clients.
pub async fn ice_servers(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<crate::config::ClientIceServer>> {
    Json(state.config.ice_servers_for_client())
}

/// POST /api/v1/webrtc/disconnect
pub async fn webrtc_disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DisconnectRequest>,
) -> Result<StatusCode, ApiError> {
    require_auth(&state, &headers)?;
    state.sfu.disconnect(&body.peer_id).await;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let totals = state.metrics.totals();
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": crate::domain::now_secs(),
        "uptime": state.started_at.elapsed().as_secs(),
        "store": state.store.backend_name(),
        "rtp_packets_forwarded": totals.rtp_packets_forwarded,
        "rtp_packets_dropped": totals.rtp_packets_dropped,
        "signal_messages_routed": totals.signal_messages_routed,
    }))
}

/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.store.is_healthy().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/api/v1/streams", post(create_stream))
        .route("/api/v1/streams", get(list_streams))
        .route("/api/v1/streams/:id", get(get_stream))
        .route("/api/v1/streams/:id", delete(delete_stream))
        .route("/api/v1/streams/:id/join", post(join_stream))
        .route("/api/v1/streams/:id/leave", post(leave_stream))
        .route("/api/v1/streams/:id/stats", get(stream_stats))
        .route("/api/v1/mesh/path", get(mesh_path))
        .route("/api/v1/webrtc/publish", post(webrtc_publish))
        .route("/api/v1/webrtc/subscribe", post(webrtc_subscribe))
        .route("/api/v1/webrtc/answer", post(webrtc_answer))
        .route("/api/v1/webrtc/disconnect", post(webrtc_disconnect))
        .route("/api/v1/webrtc/ice-servers", get(ice_servers))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
