//! Per-request tracing span.
//!
//! Every request gets a UUID v4 and a span carrying it together with the
//! addressed host, so log lines from routing, file serving and error rendering
//! can be tied back to one request and one tenant.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Request identifier, available to handlers through request extensions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

/// Host the request was addressed to: the Host header, or the URI authority
/// for HTTP/2 requests that carry none.
pub fn request_host(request: &Request) -> String {
    request
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

fn request_span(request: &Request, id: RequestId) -> tracing::Span {
    tracing::info_span!(
        "request",
        request_id = %id.0,
        method = %request.method(),
        host = %request_host(request),
        path = %request.uri().path(),
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Outermost layer: tag the request with an id and run the rest inside its span.
pub async fn request_id_layer(mut request: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    let span = request_span(&request, id);
    request.extensions_mut().insert(id);

    let started = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;
    span.record("status", status);
    span.record("duration_ms", duration_ms);
    span.in_scope(|| tracing::info!(status, duration_ms, "Request completed"));

    response
}
