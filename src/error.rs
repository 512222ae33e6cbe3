use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use std::io;

use crate::routing::RouteError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path escapes the document root: {0}")]
    Forbidden(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, title, message) = match &self {
            AppError::Route(RouteError::NotFound(_)) => (
                StatusCode::NOT_FOUND,
                "Site not found",
                "No site is configured for this domain.",
            ),
            AppError::FileNotFound(_) => (
                StatusCode::NOT_FOUND,
                "Page not found",
                "The requested page does not exist on this site.",
            ),
            AppError::Forbidden(_) => (
                StatusCode::FORBIDDEN,
                "Forbidden",
                "The requested path is not allowed.",
            ),
            _ => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error",
                    "The server could not complete the request.",
                )
            }
        };

        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Error {}</title>
    <style>
        body {{ margin: 0; min-height: 100vh; display: grid; place-items: center;
               font-family: system-ui, sans-serif; background: #f4f6f8; color: #1c1f26; }}
        .error-page {{ text-align: center; }}
    </style>
</head>
<body>
    <div class="error-page">
        <h1>Error {}</h1>
        <h2>{}</h2>
        <p>{}</p>
    </div>
</body>
</html>"#,
            status.as_u16(),
            status.as_u16(),
            title,
            message
        );

        (status, Html(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let not_found = AppError::Route(RouteError::NotFound("x.example".to_string()));
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::FileNotFound("/a".to_string()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Forbidden("/..".to_string()).into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Internal("boom".to_string()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
