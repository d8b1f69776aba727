//! HTTP surface: routes and the middleware chain that wraps them.

pub mod handlers;
pub mod middleware;

pub use middleware::Principal;

use crate::server::Server;
use axum::http::{header, Method};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<Server>,
}

/// Build the HTTP router with the full middleware chain.
pub fn build_router(server: Arc<Server>) -> Router {
    let state = ApiState { server };

    // Echo the request origin and answer preflights without invoking the
    // inner handler.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::DELETE,
            Method::GET,
            Method::OPTIONS,
            Method::POST,
            Method::PUT,
        ])
        .allow_headers([
            header::ACCEPT,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
            header::HeaderName::from_static("x-csrf-token"),
            header::HeaderName::from_static("x-http-method-override"),
        ]);

    // Only the gzip feature is compiled in, so negotiation is gzip-or-identity.
    let gzip = CompressionLayer::new();

    Router::new()
        .route("/query", get(handlers::serve_query))
        .route("/write", post(handlers::serve_write))
        .route(
            "/data_nodes",
            get(handlers::list_data_nodes).post(handlers::create_data_node),
        )
        .route("/data_nodes/:id", delete(handlers::delete_data_node))
        .route("/metastore", get(handlers::serve_metastore))
        .route("/status", get(handlers::serve_status))
        .route("/ping", get(handlers::serve_ping))
        .route(
            "/process_continuous_queries",
            post(handlers::process_continuous_queries),
        )
        .route("/shards/:id/write", post(handlers::shard_write))
        .route("/shards/:id/query", post(handlers::shard_query))
        .route("/broker/propose", post(handlers::broker_propose))
        .route("/broker/stream", get(handlers::broker_stream))
        .layer(
            // First layer listed is outermost: recovery wraps everything.
            ServiceBuilder::new()
                .layer(from_fn(middleware::recovery))
                .layer(from_fn(middleware::logging))
                .layer(from_fn(middleware::request_id))
                .layer(cors)
                .layer(from_fn(middleware::version_header))
                .layer(gzip)
                .layer(from_fn_with_state(state.clone(), middleware::authenticate)),
        )
        .with_state(state)
}
