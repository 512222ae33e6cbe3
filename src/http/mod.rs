//! HTTP server module with TLS support.
//!
//! Runs a plain HTTP listener and, when enabled, an HTTPS listener whose
//! certificates are picked per hostname by the SNI selector. Both serve the same
//! router.
//!
//! The server includes:
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Site reload via SIGHUP

mod server;
mod shutdown;
pub mod static_files;

pub use server::{start_server, ServerError};
pub use shutdown::setup_reload_handler;
