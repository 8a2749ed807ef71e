//! Discovery channel API endpoints.
//!
//! Each channel (Bluetooth, NFC, Location) runs independently. A UI starts
//! the channels it shows, polls their status and discovered users, and stops
//! them when the view goes away.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use nearby_core::{Channel, ChannelStatus, DiscoveredUser};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::api::error::{ApiError, ApiResult};
use crate::state::SharedState;

/// Creates the discovery router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/{channel}", get(get_channel))
        .route("/channels/{channel}/start", post(start_channel))
        .route("/channels/{channel}/stop", post(stop_channel))
        .route("/channels/{channel}/background", put(set_background_mode))
        .route("/channels/{channel}/users", get(list_users))
        .route("/connections", post(request_connection))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Status of every channel.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChannelsResponse {
    /// One entry per channel.
    pub channels: Vec<ChannelStatus>,
}

/// Request body for starting a channel.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[schema(example = json!({ "auto_retry": true }))]
pub struct StartRequest {
    /// Retry automatically after permission or busy failures.
    /// Defaults to the configured `discovery.auto_retry`.
    #[serde(default)]
    #[schema(example = true)]
    pub auto_retry: Option<bool>,
}

/// Request body for switching background mode.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "enabled": true }))]
pub struct BackgroundModeRequest {
    /// Whether the slow background scan cadence should be used.
    #[schema(example = true)]
    pub enabled: bool,
}

/// Users currently discovered on a channel.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsersResponse {
    /// The channel queried.
    pub channel: Channel,
    /// Number of users.
    #[schema(example = 1)]
    pub count: usize,
    /// The users, most recently seen first.
    pub users: Vec<DiscoveredUser>,
}

/// Request body for a connection request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({ "target_id": "u-42" }))]
pub struct ConnectionRequestBody {
    /// Id of the user to connect with.
    #[schema(example = "u-42", min_length = 1)]
    pub target_id: String,
}

/// A recorded connection request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "6f1c4e1a-8c1d-4a53-9a8e-3f0f5d1c2b7e",
    "from": "me",
    "to": "u-42",
    "created_at": "2026-01-15T03:30:00Z"
}))]
pub struct ConnectionResponse {
    /// Request id assigned by the backend.
    pub id: String,
    /// Requesting user.
    pub from: String,
    /// Target user.
    pub to: String,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
}

fn parse_channel(raw: &str) -> ApiResult<Channel> {
    raw.parse().map_err(|message| ApiError::BadRequest {
        error_code: "INVALID_CHANNEL".to_string(),
        message,
    })
}

// ============================================================================
// Handlers
// ============================================================================

/// Get the status of every channel.
#[utoipa::path(
    get,
    path = "/api/channels",
    tag = "discovery",
    operation_id = "listChannels",
    summary = "List channel statuses",
    description = "Returns the scanner state, background mode, discovered count and \
        last surfaced error of every discovery channel.",
    responses(
        (status = 200, description = "Statuses retrieved", body = ChannelsResponse)
    )
)]
pub async fn list_channels(State(state): State<SharedState>) -> Json<ChannelsResponse> {
    Json(ChannelsResponse {
        channels: state.hub.statuses(),
    })
}

/// Get the status of one channel.
#[utoipa::path(
    get,
    path = "/api/channels/{channel}",
    tag = "discovery",
    operation_id = "getChannel",
    summary = "Get channel status",
    params(("channel" = String, Path, description = "bluetooth, nfc or location")),
    responses(
        (status = 200, description = "Status retrieved", body = ChannelStatus),
        (status = 400, description = "Unknown channel", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn get_channel(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
) -> ApiResult<Json<ChannelStatus>> {
    let channel = parse_channel(&channel)?;
    Ok(Json(state.hub.channel(channel).status()))
}

/// Start discovery on a channel.
///
/// Starting a channel that is already running has no effect.
#[utoipa::path(
    post,
    path = "/api/channels/{channel}/start",
    tag = "discovery",
    operation_id = "startChannel",
    summary = "Start a channel",
    description = "Checks sensor availability and starts the channel's scan and \
        discovery loops. With auto_retry, permission and busy failures are retried \
        after the configured delay and the response reports the backoff_wait state.",
    params(("channel" = String, Path, description = "bluetooth, nfc or location")),
    request_body = StartRequest,
    responses(
        (status = 200, description = "Channel started, retrying, or already running", body = ChannelStatus),
        (status = 400, description = "Unknown channel", body = crate::api::error::ErrorResponse),
        (status = 403, description = "Sensor permission denied", body = crate::api::error::ErrorResponse),
        (status = 409, description = "Channel disabled or prompt dismissed", body = crate::api::error::ErrorResponse),
        (status = 503, description = "Sensor unavailable", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn start_channel(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<ChannelStatus>> {
    let channel = parse_channel(&channel)?;
    let auto_retry = request
        .auto_retry
        .unwrap_or_else(|| state.hub.default_auto_retry());

    let facade = state.hub.channel(channel);
    facade.start(auto_retry).await?;
    info!(%channel, auto_retry, "Channel start requested");
    Ok(Json(facade.status()))
}

/// Stop discovery on a channel.
#[utoipa::path(
    post,
    path = "/api/channels/{channel}/stop",
    tag = "discovery",
    operation_id = "stopChannel",
    summary = "Stop a channel",
    description = "Cancels every loop and pending retry for the channel and clears \
        its discovered users. Safe to call on a stopped channel.",
    params(("channel" = String, Path, description = "bluetooth, nfc or location")),
    responses(
        (status = 200, description = "Channel stopped", body = ChannelStatus),
        (status = 400, description = "Unknown channel", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn stop_channel(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
) -> ApiResult<Json<ChannelStatus>> {
    let channel = parse_channel(&channel)?;
    let facade = state.hub.channel(channel);
    facade.stop();
    Ok(Json(facade.status()))
}

/// Switch a channel between foreground and background cadence.
#[utoipa::path(
    put,
    path = "/api/channels/{channel}/background",
    tag = "discovery",
    operation_id = "setBackgroundMode",
    summary = "Set background mode",
    description = "Background mode slows the local scan loop of radio channels. \
        The location channel records the flag only.",
    params(("channel" = String, Path, description = "bluetooth, nfc or location")),
    request_body = BackgroundModeRequest,
    responses(
        (status = 200, description = "Mode updated", body = ChannelStatus),
        (status = 400, description = "Unknown channel", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn set_background_mode(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
    Json(request): Json<BackgroundModeRequest>,
) -> ApiResult<Json<ChannelStatus>> {
    let channel = parse_channel(&channel)?;
    let facade = state.hub.channel(channel);
    facade.set_background_mode(request.enabled);
    Ok(Json(facade.status()))
}

/// List the users currently discovered on a channel.
#[utoipa::path(
    get,
    path = "/api/channels/{channel}/users",
    tag = "discovery",
    operation_id = "listUsers",
    summary = "List discovered users",
    description = "Returns a snapshot of the channel's registry. Entries not seen \
        for the configured TTL have already been evicted.",
    params(("channel" = String, Path, description = "bluetooth, nfc or location")),
    responses(
        (status = 200, description = "Users retrieved", body = UsersResponse),
        (status = 400, description = "Unknown channel", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn list_users(
    State(state): State<SharedState>,
    Path(channel): Path<String>,
) -> ApiResult<Json<UsersResponse>> {
    let channel = parse_channel(&channel)?;
    let mut users = state.hub.channel(channel).get_discovered();
    users.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));

    Ok(Json(UsersResponse {
        channel,
        count: users.len(),
        users,
    }))
}

/// Send a connection request to a discovered user.
#[utoipa::path(
    post,
    path = "/api/connections",
    tag = "connections",
    operation_id = "requestConnection",
    summary = "Request a connection",
    request_body = ConnectionRequestBody,
    responses(
        (status = 201, description = "Request recorded", body = ConnectionResponse),
        (status = 400, description = "Missing or invalid target", body = crate::api::error::ErrorResponse),
        (status = 404, description = "Target user does not exist", body = crate::api::error::ErrorResponse),
        (status = 502, description = "Backend failure", body = crate::api::error::ErrorResponse)
    )
)]
pub async fn request_connection(
    State(state): State<SharedState>,
    Json(request): Json<ConnectionRequestBody>,
) -> ApiResult<(StatusCode, Json<ConnectionResponse>)> {
    let target_id = request.target_id.trim();
    if target_id.is_empty() {
        return Err(ApiError::BadRequest {
            error_code: "EMPTY_TARGET_ID".to_string(),
            message: "target_id must not be empty".to_string(),
        });
    }

    let created = state.hub.request_connection(target_id).await?;

    Ok((
        StatusCode::CREATED,
        Json(ConnectionResponse {
            id: created.id.to_string(),
            from: created.from,
            to: created.to,
            created_at: created.created_at,
        }),
    ))
}
