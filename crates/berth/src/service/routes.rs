//! API route definitions.

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use berth_protocol::wire;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::ServiceState;
use super::handlers;
use super::idle::{IdleTracker, track_activity};

/// Build the service router. Every request is recorded on `tracker`.
pub fn create_router(state: ServiceState, tracker: IdleTracker) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route(wire::PING, get(handlers::ping))
        .route(wire::INFO, get(handlers::info))
        .route(wire::SYSTEM_DF, get(handlers::system_df))
        .route(wire::SYSTEM_RESET, post(handlers::system_reset))
        // Images
        .route(wire::IMAGES_LIST, get(handlers::list_images))
        .route(wire::IMAGES_PRUNE, post(handlers::prune_images))
        .route("/v1/images/{name}", delete(handlers::delete_image))
        .route("/v1/images/{name}/exists", get(handlers::image_exists))
        .route("/v1/images/{name}/history", get(handlers::image_history))
        .route("/v1/images/{name}/export", get(handlers::export_image))
        // Containers
        .route(wire::CONTAINERS_LIST, get(handlers::list_containers))
        .route(wire::CONTAINERS_CREATE, post(handlers::create_container))
        .route("/v1/containers/{id}", delete(handlers::remove_container))
        .route("/v1/containers/{id}/start", post(handlers::start_container))
        .route("/v1/containers/{id}/stop", post(handlers::stop_container))
        .layer(middleware::from_fn_with_state(tracker, track_activity))
        .layer(trace_layer)
        .with_state(state)
}
