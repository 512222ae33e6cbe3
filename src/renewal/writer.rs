//! Certificate writing.
//!
//! Material is validated before anything touches disk, then each file is written
//! atomically: temporary `.tmp` file, fsync, rename. The private key is created
//! with mode 0600 on Unix. A half-written pair never replaces working material.

use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{CERT_CHAIN_FILE, CERT_KEY_FILE};

use super::issuer::IssuedCertificate;

#[derive(Debug, thiserror::Error)]
pub enum CertWriteError {
    #[error("Issued material is not usable: {0}")]
    InvalidMaterial(String),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate write task failed: {0}")]
    Task(String),
}

/// Write `cert.key` and `cert.crt` for an issued certificate into `dir`.
///
/// Runs the blocking file I/O on the blocking thread pool.
pub async fn write_certificate(
    dir: &Path,
    issued: &IssuedCertificate,
) -> Result<(), CertWriteError> {
    let dir = dir.to_path_buf();
    let issued = issued.clone();
    tokio::task::spawn_blocking(move || write_certificate_sync(&dir, &issued))
        .await
        .map_err(|e| CertWriteError::Task(e.to_string()))?
}

fn write_certificate_sync(dir: &Path, issued: &IssuedCertificate) -> Result<(), CertWriteError> {
    validate_material(issued)?;

    std::fs::create_dir_all(dir).map_err(|source| CertWriteError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let key_path = dir.join(CERT_KEY_FILE);
    let chain_path = dir.join(CERT_CHAIN_FILE);

    let mut chain = issued.certificate_chain.clone();
    if !chain.ends_with('\n') {
        chain.push('\n');
    }

    write_file_atomic(&key_path, issued.private_key.as_bytes(), true)?;
    debug!(path = %key_path.display(), "Wrote private key");
    write_file_atomic(&chain_path, chain.as_bytes(), false)?;
    debug!(path = %chain_path.display(), "Wrote certificate chain");

    info!(dir = %dir.display(), "Certificate material written");
    Ok(())
}

/// Require at least one certificate and exactly a parseable private key.
fn validate_material(issued: &IssuedCertificate) -> Result<(), CertWriteError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(issued.certificate_chain.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertWriteError::InvalidMaterial(format!("certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(CertWriteError::InvalidMaterial(
            "certificate chain holds no certificates".to_string(),
        ));
    }

    match rustls_pemfile::private_key(&mut BufReader::new(issued.private_key.as_bytes())) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(CertWriteError::InvalidMaterial(
            "no private key found".to_string(),
        )),
        Err(e) => Err(CertWriteError::InvalidMaterial(format!("private key: {}", e))),
    }
}

fn write_file_atomic(target: &Path, content: &[u8], private: bool) -> Result<(), CertWriteError> {
    let mut temp_name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = target.with_file_name(temp_name);
    let write_err = |source| CertWriteError::Write {
        path: temp_path.clone(),
        source,
    };

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(if private { 0o600 } else { 0o644 });
    }

    let mut file = options.open(&temp_path).map_err(write_err)?;
    file.write_all(content).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;

    // A leftover temp file keeps its old mode; enforce it
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if private { 0o600 } else { 0o644 };
        std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(mode))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    std::fs::rename(&temp_path, target).map_err(|source| CertWriteError::Rename {
        from: temp_path.clone(),
        to: target.to_path_buf(),
        source,
    })
}
