//! HTTP route handlers.
//!
//! Two fixed routes are answered on every host: the liveness probe and the
//! HTTP-01 challenge passthrough. Everything else falls through to host routing
//! and site file serving.
//!
//! Request tracing is enabled via middleware that generates a unique request ID
//! for each incoming request, allowing correlation of all logs within a request.

pub mod challenge;
pub mod health;
pub mod site;

use axum::{middleware, routing::get, Router};
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::CACHE_CONTROL_NO_STORE;
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Creates the Axum router shared by the HTTP and HTTPS listeners.
pub fn create_router(state: AppState) -> Router {
    // Challenge tokens and health answers must never be cached
    let fixed_routes: Router<AppState> = Router::new()
        .route("/health", get(health::health))
        .route(
            "/.well-known/acme-challenge/{token}",
            get(challenge::challenge),
        )
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_NO_STORE),
        ));

    Router::new()
        .merge(fixed_routes)
        .fallback(site::serve)
        .with_state(state)
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}
