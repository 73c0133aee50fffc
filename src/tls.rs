//! TLS material for the fronting proxy.
//!
//! Paths are resolved once by the server action and passed by reference. When
//! no certificate exists yet, a self-signed one is generated so the proxy can
//! start; operators replace it with a real certificate later.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub const PRODUCTION_SSL_DIR: &str = "/app/etc/nginx/ssl";
pub const FALLBACK_SSL_DIR: &str = "ssl";
const CERT_FILE: &str = "wikigate.crt";
const KEY_FILE: &str = "wikigate.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    dir: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl TlsPaths {
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            dir,
        }
    }

    /// Use `--ssl-dir` when given, else the production directory if it is
    /// writable, else `./ssl`.
    #[must_use]
    pub fn resolve(ssl_dir: Option<&str>) -> Self {
        match ssl_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
            Some(dir) => Self::in_dir(dir),
            None if dir_writable(Path::new(PRODUCTION_SSL_DIR)) => Self::in_dir(PRODUCTION_SSL_DIR),
            None => Self::in_dir(FALLBACK_SSL_DIR),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.cert
    }

    #[must_use]
    pub fn key_path(&self) -> &Path {
        &self.key
    }
}

fn dir_writable(dir: &Path) -> bool {
    fs::metadata(dir).is_ok_and(|meta| meta.is_dir() && !meta.permissions().readonly())
}

/// Write a self-signed certificate for `common_name` unless both files exist.
/// Returns `true` when new material was written.
///
/// # Errors
/// Returns an error if the directory or files cannot be written or the
/// certificate cannot be generated.
pub fn ensure_self_signed(paths: &TlsPaths, common_name: &str) -> Result<bool> {
    if paths.cert_path().exists() && paths.key_path().exists() {
        return Ok(false);
    }

    fs::create_dir_all(paths.dir())
        .with_context(|| format!("Failed to create TLS directory: {}", paths.dir().display()))?;

    let certified = rcgen::generate_simple_self_signed(vec![common_name.to_string()])
        .context("Failed to generate self-signed certificate")?;

    fs::write(paths.cert_path(), certified.cert.pem()).with_context(|| {
        format!(
            "Failed to write TLS certificate: {}",
            paths.cert_path().display()
        )
    })?;
    fs::write(paths.key_path(), certified.key_pair.serialize_pem()).with_context(|| {
        format!("Failed to write TLS key: {}", paths.key_path().display())
    })?;
    restrict_permissions(paths)?;

    info!(
        cert = %paths.cert_path().display(),
        common_name, "Generated self-signed TLS certificate"
    );
    Ok(true)
}

#[cfg(unix)]
fn restrict_permissions(paths: &TlsPaths) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(paths.cert_path(), fs::Permissions::from_mode(0o644))
        .context("Failed to set TLS certificate permissions")?;
    fs::set_permissions(paths.key_path(), fs::Permissions::from_mode(0o600))
        .context("Failed to set TLS key permissions")?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_paths: &TlsPaths) -> Result<()> {
    Ok(())
}
