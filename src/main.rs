//! sitehost: a multi-tenant HTTP/HTTPS host.
//!
//! This is the application entry point. It initializes tracing, loads the TOML
//! configuration, opens the site registry, builds the SNI certificate selector,
//! starts the renewal scheduler and runs the listeners until shutdown. The
//! `sites` subcommands administer the site document without starting a server.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sitehost::config::{AppConfig, CHALLENGE_DIR, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use sitehost::control::SiteControl;
use sitehost::http::{setup_reload_handler, start_server};
use sitehost::renewal::{Issuer, RenewalPolicy, RenewalScheduler, WebhookIssuer};
use sitehost::routes::create_router;
use sitehost::routing::HostRouter;
use sitehost::sites::SiteRegistry;
use sitehost::state::AppState;
use sitehost::tls::{server_config, CertificateSelector};

/// sitehost: serve many websites with per-host TLS and automated certificates
#[derive(Parser, Debug)]
#[command(name = "sitehost", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "sitehost=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/HTTPS listeners (default)
    Serve,
    /// Inspect or modify the site document
    Sites {
        #[command(subcommand)]
        action: SitesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum SitesCommand {
    /// List configured sites
    List,
    /// Validate the site document and exit
    Check,
    /// Add a site with its directories and a placeholder index page
    Create {
        /// Site name (letters, digits, '-' or '_')
        name: String,
        /// Domain, or a comma-separated list of domains
        domain: String,
        /// Reachable by path prefix from IP/localhost hosts
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)?;

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let subscriber =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if config.logging.format == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    tracing::info!(config = %args.config, "Loaded configuration");

    let sites = SiteRegistry::new(&config.server.base_dir, config.sites_path());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, sites).await,
        Command::Sites { action } => run_sites_command(action, &config, sites).await,
    }
}

async fn serve(config: AppConfig, sites: SiteRegistry) -> Result<(), Box<dyn std::error::Error>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let initial_load_failed = match sites.reload().await {
        Ok(_) => false,
        Err(e) => {
            tracing::error!(
                error = %e,
                path = %sites.sites_path().display(),
                retry_secs = config.server.reload_retry_seconds,
                "Failed to load sites; serving none until the document is valid"
            );
            true
        }
    };

    // Certificate selection (the default pair is mandatory for HTTPS)
    let selector = if config.https.enabled {
        let default_dir = config.default_cert_dir();
        let selector = CertificateSelector::from_default_dir(
            sites.clone(),
            &default_dir,
            config.https.cache_capacity,
        )?;
        tracing::info!(dir = %default_dir.display(), "Loaded default certificate");
        Some(Arc::new(selector))
    } else {
        None
    };
    let tls = selector.clone().map(server_config).transpose()?;

    let control = SiteControl::new(sites.clone(), selector.clone(), config.default_cert_dir());
    if initial_load_failed {
        tokio::spawn(
            control
                .clone()
                .retry_until_loaded(Duration::from_secs(config.server.reload_retry_seconds)),
        );
    }
    setup_reload_handler(control);

    // Renewal scheduler
    let scheduler = if config.renewal.enabled {
        let issuer = match &config.issuer {
            Some(issuer_config) => {
                let challenge_dir = sites.base_dir().join(CHALLENGE_DIR);
                tokio::fs::create_dir_all(&challenge_dir).await?;
                let issuer = WebhookIssuer::new(issuer_config, challenge_dir)?;
                tracing::info!(endpoint = %issuer_config.endpoint, "Certificate issuer configured");
                Some(Arc::new(issuer) as Arc<dyn Issuer>)
            }
            None => None,
        };
        let scheduler = RenewalScheduler::new(
            sites.clone(),
            issuer,
            selector.clone(),
            RenewalPolicy::from(&config.renewal),
        );
        Some(Arc::new(scheduler).start())
    } else {
        tracing::info!("Certificate renewal disabled");
        None
    };

    let router = HostRouter::new(sites, config.routing.development_fallback);
    let state = AppState::new(config.clone(), router);
    let app = create_router(state);

    let result = start_server(app, &config, tls).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    tracing::info!("Shutdown complete");

    result.map_err(Into::into)
}

async fn run_sites_command(
    action: SitesCommand,
    config: &AppConfig,
    sites: SiteRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    let control = SiteControl::new(sites, None, config.default_cert_dir());

    match action {
        SitesCommand::List => {
            control.reload().await?;
            for site in control.list().sites() {
                println!(
                    "{}\t{}\t{}{}{}",
                    site.name,
                    site.domains().join(","),
                    site.document_root.display(),
                    if site.is_development_mode { "\tdev" } else { "" },
                    if site.certificate_automation { "\tauto-cert" } else { "" },
                );
            }
        }
        SitesCommand::Check => {
            let count = control.reload().await?;
            println!(
                "{}: {} site(s) valid",
                control.registry().sites_path().display(),
                count
            );
        }
        SitesCommand::Create { name, domain, dev } => {
            let created = control.create_site(&name, &domain, dev).await?;
            let root = &created.site.document_root;
            println!("Created site '{}' at {}", created.site.name, root.display());
            if created.index_created {
                println!("Wrote placeholder {}", root.join(&created.site.index_file).display());
            }
            if !created.certificates_copied {
                println!("No default certificate to copy; the site uses the default until one is issued");
            }
        }
    }

    Ok(())
}
