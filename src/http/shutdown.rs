//! Process signals.
//!
//! SIGTERM and Ctrl+C drain both listeners through their shared handle. SIGHUP
//! re-reads the site document through [`SiteControl`].

use std::time::Duration;

use axum_server::Handle;

use crate::control::SiteControl;

/// Which signal asked the process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Interrupt,
    Terminate,
}

impl StopSignal {
    fn name(self) -> &'static str {
        match self {
            StopSignal::Interrupt => "SIGINT",
            StopSignal::Terminate => "SIGTERM",
        }
    }
}

async fn wait_for_stop_signal() -> StopSignal {
    let interrupt = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => StopSignal::Interrupt,
        _ = terminate => StopSignal::Terminate,
    }
}

/// Drain the listeners sharing `handle` once a stop signal arrives.
///
/// Open connections get up to `grace` to finish before they are closed.
pub fn setup_shutdown_handler(handle: Handle, grace: Duration) {
    tokio::spawn(async move {
        let signal = wait_for_stop_signal().await;
        tracing::info!(
            signal = signal.name(),
            grace_secs = grace.as_secs(),
            "Stopping listeners"
        );
        handle.graceful_shutdown(Some(grace));
    });
}

/// Reload the site document on every SIGHUP.
///
/// A document that fails validation leaves the previous sites in service.
#[cfg(unix)]
pub fn setup_reload_handler(control: SiteControl) {
    tokio::spawn(async move {
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        while hangup.recv().await.is_some() {
            let path = control.registry().sites_path().display().to_string();
            match control.reload().await {
                Ok(count) => tracing::info!(sites = count, path = %path, "SIGHUP: sites reloaded"),
                Err(e) => tracing::error!(
                    error = %e,
                    path = %path,
                    "SIGHUP: reload rejected, previous sites stay live"
                ),
            }
        }
    });
}

#[cfg(not(unix))]
pub fn setup_reload_handler(_control: SiteControl) {
    tracing::warn!("SIGHUP reload unavailable on this platform; restart to apply site changes");
}
