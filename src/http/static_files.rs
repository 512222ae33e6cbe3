//! Site file serving.
//!
//! Maps a routed request onto a file under the site's document root and streams
//! it with `ServeFile`, which handles MIME detection, range and conditional
//! requests. Directory requests are answered with the site's index file.

use axum::body::Body;
use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use crate::error::AppError;
use crate::routing::{resolve_file_path, Route};

/// Serve the file a route points at.
///
/// Paths that escape the document root are `Forbidden`; anything missing is
/// `FileNotFound`.
pub async fn serve_route(route: &Route, request: Request) -> Result<Response, AppError> {
    let site = &route.site;
    let mut path = resolve_file_path(&site.document_root, &route.path)
        .ok_or_else(|| AppError::Forbidden(route.path.clone()))?;

    let metadata = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata,
        // Unreadable content is a server fault, not a missing page
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => return Err(AppError::Io(e)),
        Err(_) => return Err(AppError::FileNotFound(route.path.clone())),
    };
    if metadata.is_dir() {
        path.push(&site.index_file);
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(AppError::FileNotFound(route.path.clone()));
        }
    }

    tracing::debug!(site = %site.name, file = %path.display(), "Serving file");

    let response = ServeFile::new(&path)
        .oneshot(request)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(response.map(Body::new).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::{parse_sites, Snapshot};
    use axum::http::StatusCode;
    use tempfile::TempDir;

    fn route(dir: &TempDir, path: &str) -> Route {
        let sites = parse_sites(
            r#"{"sites": [{"name": "a", "root": "site", "domain": "a.example", "index": "home.html"}]}"#,
            dir.path(),
        )
        .unwrap();
        let snapshot = Snapshot::new(1, sites);
        Route {
            site: snapshot.sites()[0].clone(),
            path: path.to_string(),
            via_development_fallback: false,
        }
    }

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_file_and_index() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("site/docs")).unwrap();
        std::fs::write(dir.path().join("site/home.html"), "<p>home</p>").unwrap();
        std::fs::write(dir.path().join("site/docs/a.css"), "body{}").unwrap();

        let file = serve_route(&route(&dir, "/docs/a.css"), request()).await.unwrap();
        assert_eq!(file.status(), StatusCode::OK);
        assert!(file.headers()["content-type"].to_str().unwrap().starts_with("text/css"));

        let index = serve_route(&route(&dir, "/"), request()).await.unwrap();
        assert_eq!(index.status(), StatusCode::OK);
        assert!(index.headers()["content-type"].to_str().unwrap().starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_missing_and_escaping_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("site/empty")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "no").unwrap();

        assert!(matches!(
            serve_route(&route(&dir, "/nope.html"), request()).await,
            Err(AppError::FileNotFound(_))
        ));
        assert!(matches!(
            serve_route(&route(&dir, "/empty/"), request()).await,
            Err(AppError::FileNotFound(_))
        ));
        assert!(matches!(
            serve_route(&route(&dir, "/%2e%2e/secret.txt"), request()).await,
            Err(AppError::Forbidden(_))
        ));
    }
}
