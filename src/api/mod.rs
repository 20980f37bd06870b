//! HTTP Query Surface (C11): the axum router wiring query and write routes
//! to their handlers.

pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the daemon's router over a fully constructed `AppState`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/records", get(handlers::list_records).post(handlers::publish_record))
        .route("/records/delete", post(handlers::delete_record))
        .route("/templates", get(handlers::list_templates).post(handlers::create_template))
        .route("/health", get(handlers::health))
        .route("/health/index", get(handlers::health_index))
        .route("/health/gun", get(handlers::health_gun))
        .route("/health/gateway", get(handlers::health_gateway))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Query-only surface for the `query-node` binary: every read route, none
/// of the writes (`POST /records`, `POST /records/delete`, `POST
/// /templates`) — a node running this never touches a backend adapter's
/// `put`/`delete`.
pub fn create_query_only_router(state: AppState) -> Router {
    Router::new()
        .route("/records", get(handlers::list_records))
        .route("/templates", get(handlers::list_templates))
        .route("/health", get(handlers::health))
        .route("/health/index", get(handlers::health_index))
        .route("/health/gun", get(handlers::health_gun))
        .route("/health/gateway", get(handlers::health_gateway))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
