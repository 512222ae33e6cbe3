//! Host routing: Host header to site, plus lexical path containment.
//!
//! Every lookup takes one snapshot from the registry up front and resolves against
//! it, so a concurrent reload never yields a half-old, half-new answer.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sites::{normalize_path, Site, SiteRegistry, Snapshot};

/// Routing miss
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No site configured for host '{0}'")]
    NotFound(String),
}

/// A resolved request target.
#[derive(Debug, Clone)]
pub struct Route {
    pub site: Arc<Site>,
    /// Raw (still percent-encoded) path to serve inside the site
    pub path: String,
    /// Reached through the development path-prefix fallback
    pub via_development_fallback: bool,
}

/// Normalize a raw Host header (or SNI name) into a lowercase hostname.
///
/// Strips the port and IPv6 bracket notation: `[::1]:8443` becomes `::1`.
pub fn parse_hostname(host_header: &str) -> String {
    let host = host_header.trim();
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_ascii_lowercase();
        }
    }
    host.split(':').next().unwrap_or_default().to_ascii_lowercase()
}

/// Whether the hostname is an IP literal or `localhost`
pub fn is_local_or_ip(hostname: &str) -> bool {
    hostname.eq_ignore_ascii_case("localhost") || hostname.parse::<IpAddr>().is_ok()
}

/// Resolves hosts to sites against the registry's current snapshot.
#[derive(Debug, Clone)]
pub struct HostRouter {
    registry: SiteRegistry,
    development_fallback: bool,
}

impl HostRouter {
    pub fn new(registry: SiteRegistry, development_fallback: bool) -> Self {
        Self {
            registry,
            development_fallback,
        }
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// Site serving a Host header, ignoring the development fallback.
    pub fn resolve(&self, host_header: &str) -> Option<Arc<Site>> {
        let snapshot = self.registry.snapshot();
        resolve_in(&snapshot, &parse_hostname(host_header))
    }

    /// Full request routing: domain match first, then the development fallback
    /// for IP literal or `localhost` hosts.
    pub fn route(&self, host_header: &str, path: &str) -> Result<Route, RouteError> {
        let snapshot = self.registry.snapshot();
        let hostname = parse_hostname(host_header);

        if let Some(site) = resolve_in(&snapshot, &hostname) {
            return Ok(Route {
                site,
                path: path.to_string(),
                via_development_fallback: false,
            });
        }

        if self.development_fallback && is_local_or_ip(&hostname) {
            if let Some(route) = resolve_development_fallback(&snapshot, path) {
                tracing::debug!(
                    hostname = %hostname,
                    site = %route.site.name,
                    path = %route.path,
                    "Routed through development fallback"
                );
                return Ok(route);
            }
        }

        Err(RouteError::NotFound(hostname))
    }
}

/// Site in `snapshot` serving an already-normalized hostname
pub fn resolve_in(snapshot: &Snapshot, hostname: &str) -> Option<Arc<Site>> {
    if hostname.is_empty() {
        return None;
    }
    snapshot.find_by_host(hostname).cloned()
}

/// Find a development site named by the first path segment and strip that segment.
///
/// `/dev/css/app.css` on site `dev` becomes `/css/app.css`. Only the first segment
/// is decoded (for the name comparison); the rest stays encoded for file resolution.
pub fn resolve_development_fallback(snapshot: &Snapshot, path: &str) -> Option<Route> {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let first = segments.next()?;
    let name = urlencoding::decode(first).ok()?;

    let site = snapshot
        .sites()
        .iter()
        .find(|site| site.is_development_mode && site.has_name(&name))?;

    let rest: Vec<&str> = segments.collect();
    Some(Route {
        site: Arc::clone(site),
        path: format!("/{}", rest.join("/")),
        via_development_fallback: true,
    })
}

/// Map a request path onto a file inside the site's document root.
///
/// Percent-decodes the path, drops any query string, and resolves `.`/`..`
/// lexically. Returns `None` when the result is not contained in the document
/// root or the path does not decode to UTF-8.
pub fn resolve_file_path(document_root: &Path, request_path: &str) -> Option<PathBuf> {
    let raw = request_path.split('?').next().unwrap_or_default();
    let decoded = urlencoding::decode(raw).ok()?;
    if decoded.contains('\0') {
        return None;
    }

    let relative = decoded.trim_start_matches(['/', '\\']);
    let root = normalize_path(document_root);
    let resolved = normalize_path(&root.join(relative));

    resolved.starts_with(&root).then_some(resolved)
}
