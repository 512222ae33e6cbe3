//! SNI certificate selection.
//!
//! [`CertificateSelector`] is the rustls certificate resolver for the HTTPS
//! listener. Each handshake maps the requested server name to a site, loads the
//! site's `cert.key`/`cert.crt` on first use and caches the result per hostname.
//! Any failure (unknown host, missing or malformed files) yields the default
//! certificate, so one broken site never stops handshakes for the others.
//!
//! Cache entries are stamped with the snapshot generation and an invalidation
//! epoch read *before* derivation; an entry is only served while both still
//! match. A reload or [`CertificateSelector::invalidate`] therefore forces the
//! next lookup to re-derive, even if a lookup racing the invalidation inserted
//! a stale entry afterwards.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use rustls::crypto::aws_lc_rs;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::config::{CERT_CHAIN_FILE, CERT_KEY_FILE};
use crate::routing::resolve_in;
use crate::sites::SiteRegistry;

/// ALPN protocols offered by the HTTPS listener
const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Certificate material for one directory could not be used
#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("Certificate file not found: {0}")]
    Missing(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Unsupported private key in {path}: {source}")]
    UnsupportedKey {
        path: PathBuf,
        source: rustls::Error,
    },
}

/// Load `cert.key` and `cert.crt` from a certificate directory.
pub fn load_certified_key(dir: &Path) -> Result<Arc<CertifiedKey>, CertificateError> {
    let key_path = dir.join(CERT_KEY_FILE);
    let chain_path = dir.join(CERT_CHAIN_FILE);

    let certs = read_chain(&chain_path)?;

    let mut key_reader = open(&key_path)?;
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CertificateError::Parse {
            path: key_path.clone(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| CertificateError::Parse {
            path: key_path.clone(),
            reason: "no private key found".to_string(),
        })?;

    let signing_key = aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|source| CertificateError::UnsupportedKey {
            path: key_path,
            source,
        })?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

fn read_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(CertificateError::Parse {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn open(path: &Path) -> Result<BufReader<File>, CertificateError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(CertificateError::Missing(path.to_path_buf()))
        }
        Err(source) => Err(CertificateError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// (snapshot generation, invalidation epoch) observed before deriving an entry
type Stamp = (u64, u64);

#[derive(Clone)]
struct CachedContext {
    stamp: Stamp,
    key: Arc<CertifiedKey>,
}

/// Per-hostname certificate resolver backed by the site registry.
pub struct CertificateSelector {
    registry: SiteRegistry,
    default_key: Arc<CertifiedKey>,
    cache: Cache<String, CachedContext>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for CertificateSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateSelector")
            .field("cached_hostnames", &self.cache.entry_count())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .finish()
    }
}

impl CertificateSelector {
    pub fn new(registry: SiteRegistry, default_key: Arc<CertifiedKey>, capacity: u64) -> Self {
        Self {
            registry,
            default_key,
            cache: Cache::new(capacity),
            epoch: AtomicU64::new(0),
        }
    }

    /// Build a selector whose default certificate is loaded from `default_dir`.
    pub fn from_default_dir(
        registry: SiteRegistry,
        default_dir: &Path,
        capacity: u64,
    ) -> Result<Self, CertificateError> {
        let default_key = load_certified_key(default_dir)?;
        Ok(Self::new(registry, default_key, capacity))
    }

    pub fn default_key(&self) -> &Arc<CertifiedKey> {
        &self.default_key
    }

    /// Certificate for a requested server name; never fails.
    pub fn select(&self, server_name: Option<&str>) -> Arc<CertifiedKey> {
        let Some(name) = server_name.filter(|name| !name.is_empty()) else {
            debug!("No SNI provided, using default certificate");
            return Arc::clone(&self.default_key);
        };
        let hostname = name.to_ascii_lowercase();

        let epoch = self.epoch.load(Ordering::Acquire);
        let snapshot = self.registry.snapshot();
        let stamp = (snapshot.generation(), epoch);

        if let Some(entry) = self.cache.get(&hostname) {
            if entry.stamp == stamp {
                return entry.key;
            }
        }

        let key = match resolve_in(&snapshot, &hostname) {
            Some(site) => match &site.certificate_dir {
                Some(dir) => match load_certified_key(dir) {
                    Ok(key) => {
                        debug!(hostname = %hostname, site = %site.name, "Loaded site certificate");
                        key
                    }
                    Err(e) => {
                        warn!(
                            hostname = %hostname,
                            site = %site.name,
                            error = %e,
                            "Site certificate unusable, using default certificate"
                        );
                        Arc::clone(&self.default_key)
                    }
                },
                None => Arc::clone(&self.default_key),
            },
            None => {
                debug!(hostname = %hostname, "No site for SNI name, using default certificate");
                Arc::clone(&self.default_key)
            }
        };

        self.cache.insert(
            hostname,
            CachedContext {
                stamp,
                key: Arc::clone(&key),
            },
        );
        key
    }

    /// Drop every cached context; the next lookup for any hostname re-derives.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
        debug!("TLS context cache invalidated");
    }
}

impl ResolvesServerCert for CertificateSelector {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.select(client_hello.server_name()))
    }
}

/// rustls server configuration resolving certificates through `selector`.
pub fn server_config(selector: Arc<CertificateSelector>) -> Result<Arc<ServerConfig>, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(selector);
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}
