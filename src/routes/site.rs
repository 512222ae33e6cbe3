//! Catch-all handler: route by host, then serve from the matched site.

use axum::{
    extract::{Request, State},
    response::Response,
};

use crate::error::AppError;
use crate::http::static_files::serve_route;
use crate::middleware::request_host;
use crate::state::AppState;

pub async fn serve(State(state): State<AppState>, request: Request) -> Result<Response, AppError> {
    let host = request_host(&request);
    let route = state.router.route(&host, request.uri().path())?;
    serve_route(&route, request).await
}
