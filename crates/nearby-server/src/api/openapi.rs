//! OpenAPI specification generation for the nearby API.
//!
//! The document is served at `/api/openapi.json` so UI clients can generate
//! typed bindings for the discovery endpoints.

use axum::Json;
use nearby_core::{
    AccountType, Channel, ChannelStatus, DiscoveredUser, ProfileSummary, ScannerState,
};
use utoipa::OpenApi;

use super::discovery::{
    BackgroundModeRequest, ChannelsResponse, ConnectionRequestBody, ConnectionResponse,
    StartRequest, UsersResponse,
};
use super::error::ErrorResponse;
use super::health::HealthResponse;

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty-printed JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> serde_json::Result<String> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for nearby.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "nearby API",
        version = "0.1.0",
        description = r#"
# nearby API

nearby finds people around you through three independent channels.

## Channels

- **bluetooth**: Short-range radio. Shows users whose Bluetooth presence was recently refreshed.
- **nfc**: Tap-range radio. Same flow as Bluetooth with its own presence window.
- **location**: Device position. Shows users within the configured radius, with distance.

Each channel is started and stopped on its own. A started channel keeps its list of
discovered users current; entries not seen for 24 hours are dropped.

## Errors

Permission failures return 403, a missing or switched-off sensor returns 503,
and backend failures return 502.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/", description = "Local nearby server")
    ),
    tags(
        (
            name = "system",
            description = "Health checks and service status"
        ),
        (
            name = "discovery",
            description = "Per-channel scanning lifecycle and discovered users"
        ),
        (
            name = "connections",
            description = "Connection requests to discovered users"
        )
    ),
    paths(
        // Health endpoints
        super::health::health_check,
        // Discovery endpoints
        super::discovery::list_channels,
        super::discovery::get_channel,
        super::discovery::start_channel,
        super::discovery::stop_channel,
        super::discovery::set_background_mode,
        super::discovery::list_users,
        // Connection endpoints
        super::discovery::request_connection,
    ),
    components(
        schemas(
            // Error types
            ErrorResponse,
            // Health types
            HealthResponse,
            // Discovery types
            Channel,
            ScannerState,
            ChannelStatus,
            ChannelsResponse,
            StartRequest,
            BackgroundModeRequest,
            UsersResponse,
            DiscoveredUser,
            ProfileSummary,
            AccountType,
            // Connection types
            ConnectionRequestBody,
            ConnectionResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "nearby API");
        assert!(spec.paths.paths.contains_key("/api/channels/{channel}/start"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"nearby API\""));
    }
}
