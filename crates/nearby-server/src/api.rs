//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `discovery` - Channel lifecycle, discovered users and connection requests
//! - `health` - Service health checks
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub mod discovery;
pub mod error;
pub mod health;
pub mod openapi;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                              - Health check
/// /api
/// ├── /channels                        - Status of every channel
/// ├── /channels/{channel}              - Status of one channel
/// ├── /channels/{channel}/start        - Start scanning
/// ├── /channels/{channel}/stop         - Stop scanning
/// ├── /channels/{channel}/background   - Foreground/background cadence
/// ├── /channels/{channel}/users        - Discovered users
/// ├── /connections                     - Connection requests
/// └── /openapi.json                    - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            discovery::router()
                // OpenAPI spec at /api/openapi.json
                .route("/openapi.json", get(openapi::get_openapi_spec)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
