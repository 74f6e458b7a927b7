use axum::{
    http::{StatusCode, Uri},
    routing::get,
    Router,
};
use tracing::info;

mod handlers;
use self::handlers::*;

mod state;
pub use self::state::{BackendSettings, BackendState};

/// Builds the router for the query service: UI assets, the REST query API, and the API v3 gateway.
pub fn initialize_query_router(state: BackendState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/favicon.ico", get(handle_favicon))
        .route("/api/services", get(handle_services))
        .route("/api/traces", get(handle_traces))
        .route("/api/v3/services", get(handle_services_v3))
        .fallback(debug_fallback_handler)
        .with_state(state)
}

/// Builds the router for the sampling strategy service.
pub fn initialize_sampling_router(state: BackendState) -> Router {
    Router::new()
        .route("/sampling", get(handle_sampling))
        .fallback(debug_fallback_handler)
        .with_state(state)
}

async fn debug_fallback_handler(uri: Uri) -> StatusCode {
    info!("Got unhandled request: path={}", uri);

    StatusCode::NOT_FOUND
}
