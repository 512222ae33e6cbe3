//! sitehost - a multi-tenant HTTP/HTTPS host
//!
//! Serves many independently configured websites from one process. Requests are
//! routed by hostname (exact or single-level wildcard domains, plus a path-prefix
//! fallback for development sites), TLS certificates are selected per hostname
//! at the handshake, and automated sites have their certificates renewed through
//! an external issuer.

pub mod config;
pub mod control;
pub mod error;
pub mod http;
pub mod middleware;
pub mod renewal;
pub mod routes;
pub mod routing;
pub mod sites;
pub mod state;
pub mod tls;

pub use error::AppError;
