//! HTTP/HTTPS listener startup.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;

use crate::config::AppConfig;

use super::shutdown;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Invalid listen address: {0}")]
    Address(String),
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|e| ServerError::Address(format!("'{}': {}", host, e)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Start the listeners and block until both have shut down.
///
/// `tls` is the rustls configuration for the HTTPS listener; `None` runs plain
/// HTTP only.
pub async fn start_server(
    app: Router,
    config: &AppConfig,
    tls: Option<Arc<rustls::ServerConfig>>,
) -> Result<(), ServerError> {
    let handle = Handle::new();
    shutdown::setup_shutdown_handler(
        handle.clone(),
        Duration::from_secs(config.https.shutdown_grace_seconds),
    );

    let http_addr = listen_addr(&config.http.host, config.http.port)?;
    let plain = start_plain_server(app.clone(), http_addr, handle.clone());

    match tls {
        Some(tls) => {
            let https_addr = listen_addr(&config.https.host, config.https.port)?;
            let secure = start_tls_server(app, https_addr, tls, handle);
            tokio::try_join!(plain, secure)?;
        }
        None => {
            tracing::warn!("HTTPS disabled - serving plain HTTP only");
            plain.await?;
        }
    }

    Ok(())
}

/// Start a plain HTTP server (no TLS).
async fn start_plain_server(
    app: Router,
    addr: SocketAddr,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "Starting HTTP server");

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(ServerError::Bind)
}

/// Start the HTTPS server with per-hostname certificate selection.
async fn start_tls_server(
    app: Router,
    addr: SocketAddr,
    tls: Arc<rustls::ServerConfig>,
    handle: Handle,
) -> Result<(), ServerError> {
    tracing::info!(%addr, "Starting HTTPS server (SNI certificate selection)");

    let rustls_config = RustlsConfig::from_config(tls);

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .map_err(ServerError::Bind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            listen_addr("0.0.0.0", 80).unwrap(),
            "0.0.0.0:80".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(listen_addr("::", 443).unwrap().port(), 443);
        assert!(matches!(listen_addr("example.com", 80), Err(ServerError::Address(_))));
    }
}
