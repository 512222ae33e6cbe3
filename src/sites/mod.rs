//! Site definitions and registry snapshots.
//!
//! The site document is a JSON object with a `sites` list. Each record is parsed
//! into an immutable [`Site`]; a fully validated list becomes a [`Snapshot`].
//! Validation is all-or-nothing: one bad record rejects the whole document.
//!
//! ```json
//! {
//!   "sites": [
//!     { "name": "a", "root": "websites/a", "domain": "a.example", "index": "index.html" },
//!     { "name": "b", "root": "websites/b", "domain": ["*.b.example"], "index": "index.html",
//!       "isDevelop": true, "certificates": "certificates/b",
//!       "letsencrypt": true, "letsencryptNextRenewal": "2026-01-01T00:00:00Z" }
//!   ]
//! }
//! ```

pub mod matcher;
pub mod registry;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::{ConfigError, MANAGED_CERT_DIR};

pub use matcher::matches;
pub use registry::SiteRegistry;

/// One configured virtual host.
#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    /// Unique name, compared case-insensitively
    pub name: String,
    /// Absolute document root, contained in the base directory
    pub document_root: PathBuf,
    /// Lowercase domain patterns in declaration order
    pub domains: Vec<String>,
    /// File served for directory requests
    pub index_file: String,
    /// Reachable by path prefix from IP/localhost hosts
    pub is_development_mode: bool,
    /// Directory holding `cert.key`/`cert.crt`; `None` uses the default certificate
    pub certificate_dir: Option<PathBuf>,
    /// Opted into the renewal scheduler
    pub certificate_automation: bool,
    /// Persisted renewal deadline
    pub next_renewal_at: Option<DateTime<Utc>>,
}

impl Site {
    /// Lowercase domain patterns in declaration order
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// First declared domain, used as the certificate subject
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Whether any of the site's patterns serves `hostname`
    pub fn serves(&self, hostname: &str) -> bool {
        self.domains.iter().any(|pattern| matches(hostname, pattern))
    }

    /// Whether the renewal deadline has passed (or was never set)
    pub fn renewal_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_renewal_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// An immutable, fully validated set of sites.
#[derive(Debug, Default)]
pub struct Snapshot {
    /// Bumped every time site definitions are reloaded from storage
    generation: u64,
    sites: Vec<Arc<Site>>,
}

impl Snapshot {
    pub fn new(generation: u64, sites: Vec<Site>) -> Self {
        Self {
            generation,
            sites: sites.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sites(&self) -> &[Arc<Site>] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// First site, in declaration order, with a pattern matching `hostname`
    pub fn find_by_host(&self, hostname: &str) -> Option<&Arc<Site>> {
        self.sites.iter().find(|site| site.serves(hostname))
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Arc<Site>> {
        self.sites.iter().find(|site| site.has_name(name))
    }

    /// Copy of this snapshot with one site's renewal deadline replaced.
    ///
    /// Keeps the generation: renewal deadlines do not change what is served.
    pub(crate) fn with_next_renewal(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> Option<Snapshot> {
        let index = self.sites.iter().position(|site| site.has_name(name))?;
        let mut sites = self.sites.clone();
        let mut updated = (*sites[index]).clone();
        updated.next_renewal_at = at;
        sites[index] = Arc::new(updated);
        Some(Snapshot {
            generation: self.generation,
            sites,
        })
    }
}

/// Root of the site document
#[derive(Debug, Deserialize)]
struct SiteDocument {
    sites: Vec<SiteRecord>,
}

/// `domain` accepts a single string or a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DomainField {
    One(String),
    Many(Vec<String>),
}

impl DomainField {
    fn into_vec(self) -> Vec<String> {
        match self {
            DomainField::One(domain) => vec![domain],
            DomainField::Many(domains) => domains,
        }
    }
}

/// One entry of the `sites` list as written by operators
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteRecord {
    name: String,
    root: String,
    domain: DomainField,
    index: String,
    #[serde(default)]
    is_develop: Option<bool>,
    #[serde(default)]
    certificates: Option<String>,
    #[serde(default)]
    letsencrypt: Option<bool>,
    #[serde(default)]
    letsencrypt_next_renewal: Option<String>,
}

/// Parse and validate a whole site document.
///
/// `base_dir` must be absolute; roots and certificate directories resolve against it.
pub fn parse_sites(document: &str, base_dir: &Path) -> Result<Vec<Site>, ConfigError> {
    let document: SiteDocument = serde_json::from_str(document)?;
    let base_dir = normalize_path(base_dir);

    let mut names = HashSet::new();
    let mut sites = Vec::with_capacity(document.sites.len());
    for (position, record) in document.sites.into_iter().enumerate() {
        let site = site_from_record(record, &base_dir).map_err(|e| match e {
            ConfigError::Validation(msg) => {
                ConfigError::Validation(format!("site #{}: {}", position + 1, msg))
            }
            other => other,
        })?;
        if !names.insert(site.name.to_lowercase()) {
            return Err(ConfigError::Validation(format!(
                "duplicate site name '{}'",
                site.name
            )));
        }
        sites.push(site);
    }
    Ok(sites)
}

fn site_from_record(record: SiteRecord, base_dir: &Path) -> Result<Site, ConfigError> {
    require_non_empty("name", &record.name)?;
    require_non_empty("root", &record.root)?;
    require_non_empty("index", &record.index)?;

    let domains = normalize_domains(record.domain.into_vec())?;

    let document_root = normalize_path(&base_dir.join(&record.root));
    if !document_root.starts_with(base_dir) {
        return Err(ConfigError::Validation(format!(
            "root '{}' of site '{}' escapes the base directory",
            record.root, record.name
        )));
    }

    let certificate_automation = record.letsencrypt.unwrap_or(false);
    let certificate_dir = match record.certificates.as_deref() {
        Some(dir) if !dir.trim().is_empty() => Some(normalize_path(&base_dir.join(dir))),
        // Automated sites get a managed directory so renewed material is served
        _ if certificate_automation => {
            if !is_path_safe_name(&record.name) {
                return Err(ConfigError::Validation(format!(
                    "site '{}' needs a 'certificates' path: its name is not a plain directory name",
                    record.name
                )));
            }
            Some(base_dir.join(MANAGED_CERT_DIR).join(&record.name))
        }
        _ => None,
    };

    let next_renewal_at = record
        .letsencrypt_next_renewal
        .as_deref()
        .and_then(|raw| parse_timestamp(&record.name, raw));

    Ok(Site {
        name: record.name,
        document_root,
        domains,
        index_file: record.index,
        is_development_mode: record.is_develop.unwrap_or(false),
        certificate_dir,
        certificate_automation,
        next_renewal_at,
    })
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "field '{}' must not be empty",
            field
        )));
    }
    Ok(())
}

/// Whether `name` can be used as a single directory name (`[A-Za-z0-9_-]+`).
pub fn is_path_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Lowercase, trim and validate domain patterns, keeping declaration order.
pub fn normalize_domains(domains: Vec<String>) -> Result<Vec<String>, ConfigError> {
    let mut normalized: Vec<String> = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.trim().to_lowercase();
        if !matcher::is_valid_pattern(&domain) {
            return Err(ConfigError::Validation(format!(
                "invalid domain pattern '{}'",
                domain
            )));
        }
        if !normalized.contains(&domain) {
            normalized.push(domain);
        }
    }
    if normalized.is_empty() {
        return Err(ConfigError::Validation(
            "field 'domain' must name at least one domain".to_string(),
        ));
    }
    Ok(normalized)
}

/// Unparseable deadlines are treated as unset, making the site due for renewal.
fn parse_timestamp(site: &str, raw: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(site = %site, value = %raw, error = %e, "Ignoring invalid letsencryptNextRenewal");
            None
        }
    }
}

/// Resolve `.` and `..` components without touching the filesystem.
///
/// `..` at the root stays at the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "/srv/host";

    fn parse(document: &str) -> Result<Vec<Site>, ConfigError> {
        parse_sites(document, Path::new(BASE))
    }

    #[test]
    fn test_parse_minimal_site() {
        let sites = parse(
            r#"{"sites": [{"name": "a", "root": "websites/a", "domain": "A.Example", "index": "index.html"}]}"#,
        )
        .unwrap();

        assert_eq!(sites.len(), 1);
        let site = &sites[0];
        assert_eq!(site.name, "a");
        assert_eq!(site.document_root, PathBuf::from("/srv/host/websites/a"));
        assert_eq!(site.domains(), ["a.example"]);
        assert!(!site.is_development_mode);
        assert!(site.certificate_dir.is_none());
        assert!(!site.certificate_automation);
        assert!(site.next_renewal_at.is_none());
    }

    #[test]
    fn test_parse_full_site() {
        let sites = parse(
            r#"{"sites": [{
                "name": "b", "root": "./websites/b/", "domain": ["*.B.example", "b.example"],
                "index": "home.html", "isDevelop": true, "certificates": "certificates/b",
                "letsencrypt": true, "letsencryptNextRenewal": "2030-01-02T03:04:05.000Z"
            }]}"#,
        )
        .unwrap();

        let site = &sites[0];
        assert_eq!(site.domains(), ["*.b.example", "b.example"]);
        assert_eq!(site.index_file, "home.html");
        assert!(site.is_development_mode);
        assert_eq!(
            site.certificate_dir.as_deref(),
            Some(Path::new("/srv/host/certificates/b"))
        );
        assert!(site.certificate_automation);
        assert_eq!(
            site.next_renewal_at.unwrap().to_rfc3339(),
            "2030-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn test_automated_site_gets_managed_cert_dir() {
        let sites = parse(
            r#"{"sites": [{"name": "c", "root": "c", "domain": "c.example", "index": "i.html", "letsencrypt": true}]}"#,
        )
        .unwrap();
        assert_eq!(
            sites[0].certificate_dir.as_deref(),
            Some(Path::new("/srv/host/certificates/c"))
        );
    }

    #[test]
    fn test_automated_site_with_unsafe_name_rejected() {
        let result = parse(
            r#"{"sites": [{"name": "../x", "root": "c", "domain": "c.example", "index": "i", "letsencrypt": true}]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_missing_sites_list_rejected() {
        assert!(matches!(parse(r#"{"site": []}"#), Err(ConfigError::Json(_))));
        assert!(matches!(parse(r#"{"sites": {}}"#), Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_missing_required_field_rejected() {
        for doc in [
            r#"{"sites": [{"root": "a", "domain": "a.example", "index": "i"}]}"#,
            r#"{"sites": [{"name": "a", "domain": "a.example", "index": "i"}]}"#,
            r#"{"sites": [{"name": "a", "root": "a", "index": "i"}]}"#,
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example"}]}"#,
        ] {
            assert!(parse(doc).is_err(), "accepted: {doc}");
        }
    }

    #[test]
    fn test_empty_field_rejected() {
        let result =
            parse(r#"{"sites": [{"name": "", "root": "a", "domain": "a.example", "index": "i"}]}"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_wrong_types_rejected() {
        let develop = parse(
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example", "index": "i", "isDevelop": "yes"}]}"#,
        );
        assert!(matches!(develop, Err(ConfigError::Json(_))));

        let certs = parse(
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example", "index": "i", "certificates": 7}]}"#,
        );
        assert!(matches!(certs, Err(ConfigError::Json(_))));
    }

    #[test]
    fn test_duplicate_names_rejected_case_insensitively() {
        let result = parse(
            r#"{"sites": [
                {"name": "Shop", "root": "a", "domain": "a.example", "index": "i"},
                {"name": "shop", "root": "b", "domain": "b.example", "index": "i"}
            ]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_root_escaping_base_dir_rejected() {
        let result = parse(
            r#"{"sites": [{"name": "a", "root": "../../etc", "domain": "a.example", "index": "i"}]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("escapes")));
    }

    #[test]
    fn test_empty_domain_list_rejected() {
        let result =
            parse(r#"{"sites": [{"name": "a", "root": "a", "domain": [], "index": "i"}]}"#);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_multi_level_wildcard_rejected() {
        let result = parse(
            r#"{"sites": [{"name": "a", "root": "a", "domain": "*.*.example", "index": "i"}]}"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_invalid_renewal_timestamp_means_due() {
        let sites = parse(
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example", "index": "i", "letsencryptNextRenewal": "soon"}]}"#,
        )
        .unwrap();
        assert!(sites[0].next_renewal_at.is_none());
        assert!(sites[0].renewal_due(Utc::now()));
    }

    #[test]
    fn test_first_declared_site_wins() {
        let sites = parse(
            r#"{"sites": [
                {"name": "wild", "root": "w", "domain": "*.example", "index": "i"},
                {"name": "exact", "root": "e", "domain": "shop.example", "index": "i"}
            ]}"#,
        )
        .unwrap();
        let snapshot = Snapshot::new(1, sites);
        assert_eq!(snapshot.find_by_host("shop.example").unwrap().name, "wild");
    }

    #[test]
    fn test_with_next_renewal_keeps_generation() {
        let sites = parse(
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example", "index": "i"}]}"#,
        )
        .unwrap();
        let snapshot = Snapshot::new(7, sites);
        let at = Utc::now();

        let updated = snapshot.with_next_renewal("A", Some(at)).unwrap();
        assert_eq!(updated.generation(), 7);
        assert_eq!(updated.find_by_name("a").unwrap().next_renewal_at, Some(at));
        assert!(snapshot.find_by_name("a").unwrap().next_renewal_at.is_none());
        assert!(snapshot.with_next_renewal("missing", None).is_none());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize_path(Path::new("/../../x")), PathBuf::from("/x"));
    }
}
