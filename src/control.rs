//! Site administration operations.
//!
//! The signal handler and the `sites` CLI subcommands all go through
//! [`SiteControl`]; none of them touch the registry or the site document directly.
//! Every mutation is serialized by the registry's write lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{
    ConfigError, CERT_CHAIN_FILE, CERT_KEY_FILE, DEFAULT_INDEX_FILE, MANAGED_CERT_DIR,
    WEBSITES_DIR,
};
use crate::sites::{is_path_safe_name, normalize_domains, Site, SiteRegistry, Snapshot};
use crate::tls::CertificateSelector;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Invalid site name '{0}': use letters, digits, '-' or '_'")]
    InvalidName(String),

    #[error("Site not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of [`SiteControl::create_site`]
#[derive(Debug, Clone)]
pub struct CreatedSite {
    pub site: Arc<Site>,
    /// A placeholder index page was written
    pub index_created: bool,
    /// The default certificate pair was copied into the site's directory
    pub certificates_copied: bool,
}

#[derive(Debug, Clone)]
pub struct SiteControl {
    registry: SiteRegistry,
    selector: Option<Arc<CertificateSelector>>,
    default_cert_dir: PathBuf,
}

impl SiteControl {
    pub fn new(
        registry: SiteRegistry,
        selector: Option<Arc<CertificateSelector>>,
        default_cert_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            selector,
            default_cert_dir,
        }
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    /// Reload every site and drop cached TLS contexts. Returns the site count.
    pub async fn reload(&self) -> Result<usize, ControlError> {
        let snapshot = self.registry.reload().await?;
        if let Some(selector) = &self.selector {
            selector.invalidate();
        }
        Ok(snapshot.len())
    }

    /// Reload, then confirm `name` is still configured.
    pub async fn reload_site(&self, name: &str) -> Result<Arc<Site>, ControlError> {
        self.reload().await?;
        self.registry
            .snapshot()
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    /// Current snapshot
    pub fn list(&self) -> Arc<Snapshot> {
        self.registry.snapshot()
    }

    /// Keep retrying the site load until one succeeds.
    ///
    /// Used when the document could not be loaded at startup: the process serves
    /// with an empty snapshot meanwhile.
    pub async fn retry_until_loaded(self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; the startup attempt already failed
        ticker.tick().await;
        loop {
            ticker.tick().await;
            // A SIGHUP reload may have succeeded in the meantime
            if self.registry.snapshot().generation() > 0 {
                info!("Site document already loaded; stopping retries");
                return;
            }
            match self.reload().await {
                Ok(count) => {
                    info!(sites = count, "Site document loaded after retry");
                    return;
                }
                Err(e) => warn!(error = %e, retry_secs = period.as_secs(), "Site document still invalid"),
            }
        }
    }

    /// Add a site to the document, lay out its directories and reload.
    ///
    /// `domains` may be a comma-separated list. The new site gets
    /// `websites/<name>` as root and `certificates/<name>` for certificates.
    /// If the directories cannot be laid out, the record is removed again.
    pub async fn create_site(
        &self,
        name: &str,
        domains: &str,
        develop: bool,
    ) -> Result<CreatedSite, ControlError> {
        if !is_path_safe_name(name) {
            return Err(ControlError::InvalidName(name.to_string()));
        }
        let domains = normalize_domains(
            domains
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect(),
        )?;

        let root = format!("{}/{}", WEBSITES_DIR, name);
        let certificates = format!("{}/{}", MANAGED_CERT_DIR, name);

        let mut record = Map::new();
        record.insert("name".to_string(), Value::from(name));
        record.insert("root".to_string(), Value::from(root.as_str()));
        let domain = match domains.as_slice() {
            [single] => Value::from(single.as_str()),
            _ => Value::from(domains.clone()),
        };
        record.insert("domain".to_string(), domain);
        record.insert("index".to_string(), Value::from(DEFAULT_INDEX_FILE));
        record.insert("isDevelop".to_string(), Value::from(develop));
        record.insert("certificates".to_string(), Value::from(certificates.as_str()));
        self.registry.append_record(record).await?;

        let base = self.registry.base_dir();
        let (index_created, certificates_copied) =
            match self.lay_out(name, &base.join(&root), &base.join(&certificates)).await {
                Ok(created) => created,
                Err(e) => {
                    if let Err(rollback) = self.registry.remove_record(name).await {
                        warn!(site = %name, error = %rollback, "Failed to remove half-created site");
                    }
                    return Err(e);
                }
            };
        if !certificates_copied {
            warn!(
                site = %name,
                dir = %self.default_cert_dir.display(),
                "Default certificate pair missing; new site has no certificate yet"
            );
        }

        self.reload().await?;
        let site = self
            .registry
            .snapshot()
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| ControlError::NotFound(name.to_string()))?;

        info!(site = %name, domains = ?site.domains(), develop, "Site created");
        Ok(CreatedSite {
            site,
            index_created,
            certificates_copied,
        })
    }
}

impl SiteControl {
    /// Create the site's directories, placeholder index and certificate copy.
    async fn lay_out(
        &self,
        name: &str,
        root_dir: &Path,
        cert_dir: &Path,
    ) -> Result<(bool, bool), ControlError> {
        tokio::fs::create_dir_all(root_dir).await?;
        tokio::fs::create_dir_all(cert_dir).await?;
        let index_created = write_default_index(root_dir, name).await?;
        let certificates_copied = copy_default_certificates(&self.default_cert_dir, cert_dir).await?;
        Ok((index_created, certificates_copied))
    }
}

async fn write_default_index(root_dir: &Path, name: &str) -> Result<bool, ControlError> {
    let index = root_dir.join(DEFAULT_INDEX_FILE);
    if tokio::fs::try_exists(&index).await? {
        return Ok(false);
    }
    tokio::fs::write(&index, default_index_html(name)).await?;
    Ok(true)
}

async fn copy_default_certificates(from: &Path, to: &Path) -> Result<bool, ControlError> {
    let key = from.join(CERT_KEY_FILE);
    let chain = from.join(CERT_CHAIN_FILE);
    if !tokio::fs::try_exists(&key).await? || !tokio::fs::try_exists(&chain).await? {
        return Ok(false);
    }
    tokio::fs::copy(&key, to.join(CERT_KEY_FILE)).await?;
    tokio::fs::copy(&chain, to.join(CERT_CHAIN_FILE)).await?;
    Ok(true)
}

fn default_index_html(name: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>{name}</title>
    <style>
        body {{ margin: 0; min-height: 100vh; display: grid; place-items: center;
               font-family: system-ui, sans-serif; background: #f4f6f8; color: #1c1f26; }}
        .card {{ padding: 36px 40px; border-radius: 16px; background: #fff;
                box-shadow: 0 20px 50px rgba(15, 16, 26, 0.1); text-align: center; }}
    </style>
</head>
<body>
    <div class="card">
        <h1>{name}</h1>
        <p>This site was just created. Replace this page with your content.</p>
    </div>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn control(sites: &str, with_default_cert: bool) -> (TempDir, SiteControl) {
        let dir = TempDir::new().unwrap();
        let sites_path = dir.path().join("websites.json");
        std::fs::write(&sites_path, sites).unwrap();

        let default_dir = dir.path().join("certs");
        if with_default_cert {
            std::fs::create_dir_all(&default_dir).unwrap();
            let certified =
                rcgen::generate_simple_self_signed(vec!["default.invalid".to_string()]).unwrap();
            std::fs::write(default_dir.join(CERT_CHAIN_FILE), certified.cert.pem()).unwrap();
            std::fs::write(default_dir.join(CERT_KEY_FILE), certified.key_pair.serialize_pem())
                .unwrap();
        }

        let registry = SiteRegistry::open(dir.path(), &sites_path).await.unwrap();
        (dir, SiteControl::new(registry, None, default_dir))
    }

    const ONE_SITE: &str =
        r#"{"sites": [{"name": "a", "root": "websites/a", "domain": "a.example", "index": "index.html"}]}"#;

    #[tokio::test]
    async fn test_create_site_lays_out_directories() {
        let (dir, control) = control(ONE_SITE, true).await;

        let created = control
            .create_site("shop", "Shop.example, www.shop.example", true)
            .await
            .unwrap();

        assert!(created.index_created);
        assert!(created.certificates_copied);
        assert_eq!(created.site.domains(), ["shop.example", "www.shop.example"]);
        assert!(created.site.is_development_mode);

        let root = dir.path().join("websites/shop");
        let html = std::fs::read_to_string(root.join("index.html")).unwrap();
        assert!(html.contains("<h1>shop</h1>"));
        assert!(dir.path().join("certificates/shop/cert.key").exists());
        assert!(crate::tls::load_certified_key(&dir.path().join("certificates/shop")).is_ok());

        assert_eq!(control.list().len(), 2);
    }

    #[tokio::test]
    async fn test_create_site_single_domain_stored_as_string() {
        let (dir, control) = control(ONE_SITE, false).await;
        let created = control.create_site("b", "b.example", false).await.unwrap();
        assert!(!created.certificates_copied);

        let raw = std::fs::read_to_string(dir.path().join("websites.json")).unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["sites"][1]["domain"], "b.example");
        assert_eq!(document["sites"][1]["certificates"], "certificates/b");
        assert_eq!(document["sites"][1]["isDevelop"], false);
    }

    #[tokio::test]
    async fn test_create_site_keeps_existing_index() {
        let (dir, control) = control(ONE_SITE, false).await;
        let root = dir.path().join("websites/c");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("index.html"), "mine").unwrap();

        let created = control.create_site("c", "c.example", false).await.unwrap();
        assert!(!created.index_created);
        assert_eq!(std::fs::read_to_string(root.join("index.html")).unwrap(), "mine");
    }

    #[tokio::test]
    async fn test_create_site_rejects_bad_input() {
        let (_dir, control) = control(ONE_SITE, false).await;

        assert!(matches!(
            control.create_site("../evil", "e.example", false).await,
            Err(ControlError::InvalidName(_))
        ));
        assert!(matches!(
            control.create_site("A", "dup.example", false).await,
            Err(ControlError::Config(ConfigError::Validation(_)))
        ));
        assert!(matches!(
            control.create_site("d", " , ", false).await,
            Err(ControlError::Config(ConfigError::Validation(_)))
        ));
        assert_eq!(control.list().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_site() {
        let (_dir, control) = control(ONE_SITE, false).await;
        assert_eq!(control.reload_site("A").await.unwrap().name, "a");
        assert!(matches!(
            control.reload_site("zzz").await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_until_loaded() {
        let dir = TempDir::new().unwrap();
        let sites_path = dir.path().join("websites.json");
        let registry = SiteRegistry::new(dir.path(), &sites_path);
        let control = SiteControl::new(registry, None, dir.path().join("certs"));
        assert!(control.reload().await.is_err());

        let retry = tokio::spawn(control.clone().retry_until_loaded(Duration::from_millis(10)));
        std::fs::write(&sites_path, ONE_SITE).unwrap();

        tokio::time::timeout(Duration::from_secs(5), retry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.list().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_snapshot() {
        let (dir, control) = control(ONE_SITE, false).await;
        std::fs::write(dir.path().join("websites.json"), "{not json").unwrap();

        assert!(matches!(control.reload().await, Err(ControlError::Config(_))));
        assert_eq!(control.list().len(), 1);
    }

    #[tokio::test]
    async fn test_create_site_layout_failure_removes_record() {
        let (dir, control) = control(ONE_SITE, false).await;
        // A plain file where the certificates directory must go
        std::fs::write(dir.path().join("certificates"), "not a directory").unwrap();

        let result = control.create_site("e", "e.example", false).await;
        assert!(matches!(result, Err(ControlError::Io(_))));

        let raw = std::fs::read_to_string(dir.path().join("websites.json")).unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["sites"].as_array().unwrap().len(), 1);
        assert_eq!(control.reload().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_stops_after_external_reload() {
        let dir = TempDir::new().unwrap();
        let sites_path = dir.path().join("websites.json");
        let registry = SiteRegistry::new(dir.path(), &sites_path);
        let control = SiteControl::new(registry, None, dir.path().join("certs"));

        let retry = tokio::spawn(control.clone().retry_until_loaded(Duration::from_millis(200)));
        std::fs::write(&sites_path, ONE_SITE).unwrap();
        control.reload().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), retry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.list().generation(), 1);
    }
}
