//! HTTP/JSON surface of the gateway.
//!
//! ## Structure
//!
//! - [`handler`] - One handler per route plus the shared request plumbing.
//! - [`error`] - Mapping of [`keystone::Error`] to status codes.

pub mod error;
pub mod handler;

use axum::{
    Router,
    routing::{delete, get, post},
};
use handler::AppState;
use keystone::Coordinator;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/healthz", get(handler::healthz))
        .route("/v1/collections", post(handler::create_collection))
        .route("/v1/collections/{name}", delete(handler::drop_collection))
        .route(
            "/v1/collections/{name}/partitions",
            post(handler::create_partition),
        )
        .route(
            "/v1/collections/{name}/partitions/{partition}",
            delete(handler::drop_partition),
        )
        .route("/v1/collections/{name}/insert", post(handler::insert))
        .route("/v1/collections/{name}/delete", post(handler::delete))
        .route("/v1/collections/{name}/search", post(handler::search))
        .layer(
            ServiceBuilder::new().layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(AppState { coordinator })
}
