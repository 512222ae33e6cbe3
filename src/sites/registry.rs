//! Shared site registry.
//!
//! Holds the live [`Snapshot`] behind an `ArcSwap` so readers (host router, SNI
//! selector, renewal scheduler) take a complete snapshot with a single atomic load.
//! Every writer (reload, renewal persistence, site creation) takes the same async
//! lock before touching the site document, so writes are serialized and a reload
//! never interleaves with a renewal write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ConfigError;

use super::{parse_sites, Snapshot};

/// JSON key persisting a site's renewal deadline
const NEXT_RENEWAL_KEY: &str = "letsencryptNextRenewal";

struct RegistryInner {
    base_dir: PathBuf,
    sites_path: PathBuf,
    current: ArcSwap<Snapshot>,
    generation: AtomicU64,
    /// Serializes all writers of the site document and the snapshot
    write_lock: Mutex<()>,
}

/// Cloneable handle to the live site snapshot and its backing document.
#[derive(Clone)]
pub struct SiteRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("sites_path", &self.inner.sites_path)
            .field("generation", &self.snapshot().generation())
            .finish()
    }
}

impl SiteRegistry {
    /// Create a registry with an empty snapshot; call [`reload`](Self::reload) to populate it.
    ///
    /// A relative `base_dir` is made absolute against the working directory.
    pub fn new(base_dir: impl Into<PathBuf>, sites_path: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let base_dir = std::path::absolute(&base_dir)
            .map(|abs| super::normalize_path(&abs))
            .unwrap_or(base_dir);

        Self {
            inner: Arc::new(RegistryInner {
                base_dir,
                sites_path: sites_path.into(),
                current: ArcSwap::from_pointee(Snapshot::default()),
                generation: AtomicU64::new(0),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Create a registry and load the site document once.
    pub async fn open(
        base_dir: impl Into<PathBuf>,
        sites_path: impl Into<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let registry = Self::new(base_dir, sites_path);
        registry.reload().await?;
        Ok(registry)
    }

    pub fn base_dir(&self) -> &Path {
        &self.inner.base_dir
    }

    pub fn sites_path(&self) -> &Path {
        &self.inner.sites_path
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.load_full()
    }

    /// Parse and validate the site document, then swap it in.
    ///
    /// On error the previous snapshot stays live.
    pub async fn reload(&self) -> Result<Arc<Snapshot>, ConfigError> {
        let _guard = self.inner.write_lock.lock().await;

        let contents = tokio::fs::read_to_string(&self.inner.sites_path).await?;
        let sites = parse_sites(&contents, &self.inner.base_dir)?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(Snapshot::new(generation, sites));
        self.inner.current.store(Arc::clone(&snapshot));

        info!(
            sites = snapshot.len(),
            generation,
            path = %self.inner.sites_path.display(),
            "Site registry loaded"
        );
        Ok(snapshot)
    }

    /// Persist a site's renewal deadline, then publish it in memory.
    ///
    /// The document on disk is updated first; the live snapshot only changes once
    /// the write succeeded. Returns `false` when no site with that name exists in
    /// the document.
    pub async fn record_next_renewal(
        &self,
        name: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, ConfigError> {
        let _guard = self.inner.write_lock.lock().await;

        let mut document = read_document(&self.inner.sites_path).await?;
        let Some(record) = sites_mut(&mut document)?
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|record| record_has_name(record, name))
        else {
            return Ok(false);
        };

        let value = match at {
            Some(at) => Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            None => Value::Null,
        };
        record.insert(NEXT_RENEWAL_KEY.to_string(), value);
        write_document(&self.inner.sites_path, &document).await?;

        let current = self.inner.current.load_full();
        if let Some(updated) = current.with_next_renewal(name, at) {
            self.inner.current.store(Arc::new(updated));
        }

        debug!(site = %name, next_renewal = ?at, "Persisted renewal deadline");
        Ok(true)
    }

    /// Append a raw site record to the document.
    ///
    /// Fails when a record with the same name (case-insensitive) already exists.
    /// The live snapshot is untouched; callers reload afterwards.
    pub async fn append_record(&self, record: Map<String, Value>) -> Result<(), ConfigError> {
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ConfigError::Validation("new site record needs a name".to_string()))?
            .to_string();

        let _guard = self.inner.write_lock.lock().await;

        let mut document = match read_document(&self.inner.sites_path).await {
            Ok(document) => document,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Value::Object(Map::new())
            }
            Err(e) => return Err(e),
        };

        let sites = sites_mut(&mut document)?;
        if sites
            .iter()
            .filter_map(Value::as_object)
            .any(|existing| record_has_name(existing, &name))
        {
            return Err(ConfigError::Validation(format!(
                "a site named '{}' already exists",
                name
            )));
        }
        sites.push(Value::Object(record));

        write_document(&self.inner.sites_path, &document).await?;
        info!(site = %name, "Appended site to site document");
        Ok(())
    }

    /// Remove the record named `name` (case-insensitive) from the document.
    ///
    /// Returns `false` when no such record exists. The live snapshot is untouched.
    pub async fn remove_record(&self, name: &str) -> Result<bool, ConfigError> {
        let _guard = self.inner.write_lock.lock().await;

        let mut document = read_document(&self.inner.sites_path).await?;
        let sites = sites_mut(&mut document)?;
        let before = sites.len();
        sites.retain(|record| {
            !record
                .as_object()
                .is_some_and(|record| record_has_name(record, name))
        });
        if sites.len() == before {
            return Ok(false);
        }

        write_document(&self.inner.sites_path, &document).await?;
        info!(site = %name, "Removed site from site document");
        Ok(true)
    }
}

fn record_has_name(record: &Map<String, Value>, name: &str) -> bool {
    record
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|candidate| candidate.eq_ignore_ascii_case(name))
}

/// The document's `sites` list, created when absent.
fn sites_mut(document: &mut Value) -> Result<&mut Vec<Value>, ConfigError> {
    let object = document.as_object_mut().ok_or_else(|| {
        ConfigError::Validation("site document must be a JSON object".to_string())
    })?;
    let sites = object
        .entry("sites")
        .or_insert_with(|| Value::Array(Vec::new()));
    sites
        .as_array_mut()
        .ok_or_else(|| ConfigError::Validation("'sites' must be a list".to_string()))
}

/// Read the raw document, keeping fields this crate does not model.
async fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

/// Write the document through a temporary file and rename it into place.
async fn write_document(path: &Path, document: &Value) -> Result<(), ConfigError> {
    let mut contents = serde_json::to_string_pretty(document)?;
    contents.push('\n');

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TWO_SITES: &str = r#"{
  "comment": "kept on rewrite",
  "sites": [
    { "name": "a", "root": "websites/a", "domain": "a.example", "index": "index.html" },
    { "name": "b", "root": "websites/b", "domain": "*.b.example", "index": "index.html", "letsencrypt": true }
  ]
}"#;

    async fn registry_with(contents: &str) -> (TempDir, SiteRegistry) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("websites.json");
        tokio::fs::write(&path, contents).await.unwrap();
        let registry = SiteRegistry::new(dir.path(), path);
        (dir, registry)
    }

    #[tokio::test]
    async fn test_new_registry_is_empty() {
        let (_dir, registry) = registry_with(TWO_SITES).await;
        let snapshot = registry.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.generation(), 0);
    }

    #[tokio::test]
    async fn test_reload_bumps_generation() {
        let (_dir, registry) = registry_with(TWO_SITES).await;

        let first = registry.reload().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first.generation(), 1);

        let second = registry.reload().await.unwrap();
        assert_eq!(second.generation(), 2);
        assert_eq!(registry.snapshot().generation(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_snapshot() {
        let (dir, registry) = registry_with(TWO_SITES).await;
        registry.reload().await.unwrap();

        tokio::fs::write(
            dir.path().join("websites.json"),
            r#"{"sites": [{"name": "a", "root": "a", "domain": "a.example"}]}"#,
        )
        .await
        .unwrap();

        assert!(registry.reload().await.is_err());
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.find_by_host("x.b.example").unwrap().name, "b");
    }

    #[tokio::test]
    async fn test_missing_document_is_io_error() {
        let dir = TempDir::new().unwrap();
        let registry = SiteRegistry::new(dir.path(), dir.path().join("missing.json"));
        assert!(matches!(registry.reload().await, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_record_next_renewal_persists_and_publishes() {
        let (dir, registry) = registry_with(TWO_SITES).await;
        registry.reload().await.unwrap();

        let at = DateTime::parse_from_rfc3339("2031-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(registry.record_next_renewal("B", Some(at)).await.unwrap());

        // In memory, without a reload, generation unchanged
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(snapshot.find_by_name("b").unwrap().next_renewal_at, Some(at));

        // On disk, unknown fields preserved
        let raw = tokio::fs::read_to_string(dir.path().join("websites.json"))
            .await
            .unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["comment"], "kept on rewrite");
        assert_eq!(
            document["sites"][1][NEXT_RENEWAL_KEY],
            "2031-05-06T07:08:09.000Z"
        );

        // Survives a restart
        let reopened = SiteRegistry::open(dir.path(), dir.path().join("websites.json"))
            .await
            .unwrap();
        assert_eq!(
            reopened.snapshot().find_by_name("b").unwrap().next_renewal_at,
            Some(at)
        );
    }

    #[tokio::test]
    async fn test_record_next_renewal_unknown_site() {
        let (_dir, registry) = registry_with(TWO_SITES).await;
        registry.reload().await.unwrap();
        assert!(!registry.record_next_renewal("zzz", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_append_record_rejects_duplicates() {
        let (_dir, registry) = registry_with(TWO_SITES).await;

        let mut record = Map::new();
        record.insert("name".to_string(), Value::from("A"));
        let result = registry.append_record(record).await;
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[tokio::test]
    async fn test_append_record_creates_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("websites.json");
        let registry = SiteRegistry::new(dir.path(), &path);

        let mut record = Map::new();
        record.insert("name".to_string(), Value::from("new"));
        record.insert("root".to_string(), Value::from("websites/new"));
        record.insert("domain".to_string(), Value::from("new.example"));
        record.insert("index".to_string(), Value::from("index.html"));
        registry.append_record(record).await.unwrap();

        let snapshot = registry.reload().await.unwrap();
        assert_eq!(snapshot.find_by_host("new.example").unwrap().name, "new");
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_each_others_updates() {
        let (dir, registry) = registry_with(TWO_SITES).await;
        registry.reload().await.unwrap();

        let at_a = DateTime::parse_from_rfc3339("2031-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let at_b = DateTime::parse_from_rfc3339("2032-02-02T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut record = Map::new();
        record.insert("name".to_string(), Value::from("c"));
        record.insert("root".to_string(), Value::from("websites/c"));
        record.insert("domain".to_string(), Value::from("c.example"));
        record.insert("index".to_string(), Value::from("index.html"));

        let (a, b, appended) = tokio::join!(
            registry.record_next_renewal("a", Some(at_a)),
            registry.record_next_renewal("b", Some(at_b)),
            registry.append_record(record),
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
        appended.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("websites.json"))
            .await
            .unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["sites"][0][NEXT_RENEWAL_KEY], "2031-01-01T00:00:00.000Z");
        assert_eq!(document["sites"][1][NEXT_RENEWAL_KEY], "2032-02-02T00:00:00.000Z");
        assert_eq!(document["sites"][2]["name"], "c");

        let snapshot = registry.reload().await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.find_by_name("a").unwrap().next_renewal_at, Some(at_a));
        assert_eq!(snapshot.find_by_name("b").unwrap().next_renewal_at, Some(at_b));
    }

    #[tokio::test]
    async fn test_remove_record() {
        let (dir, registry) = registry_with(TWO_SITES).await;

        assert!(registry.remove_record("B").await.unwrap());
        assert!(!registry.remove_record("B").await.unwrap());

        let raw = tokio::fs::read_to_string(dir.path().join("websites.json"))
            .await
            .unwrap();
        let document: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(document["sites"].as_array().unwrap().len(), 1);
        assert_eq!(document["comment"], "kept on rewrite");
    }
}
