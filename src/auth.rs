use eyre::{eyre, Result, WrapErr};
use log::{debug, info, warn};
use rand::RngCore;

use crate::error::MbxError;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Authentication and socket-security layer for the daemon.
///
/// `AuthManager` owns the shared-secret token file (generation, rotation,
/// constant-time verification); `SocketGuard` validates socket placement
/// before the daemon binds. Any guard violation is fatal to daemon startup.

/// Number of random bytes in a token; hex-encoded to twice this length.
const TOKEN_BYTES: usize = 32;

/// Default rotation cadence for the on-disk token.
pub const DEFAULT_TOKEN_MAX_AGE_HOURS: u64 = 24;

/// Counters for the daemon status surface.
#[derive(Debug, Clone, Copy)]
pub struct AuthMetrics {
    pub verifications: u64,
    pub failures: u64,
}

pub struct AuthManager {
    token_path: PathBuf,
    verifications: AtomicU64,
    failures: AtomicU64,
}

impl AuthManager {
    pub fn new(token_path: PathBuf) -> Self {
        Self {
            token_path,
            verifications: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Return the persisted token, generating one if no token file exists.
    pub fn get_token(&self) -> Result<String> {
        if self.token_path.exists() {
            let token = fs::read_to_string(&self.token_path)
                .wrap_err_with(|| format!("Can't read token file {:?}", self.token_path))?;
            return Ok(token.trim().to_string());
        }
        self.generate_token()
    }

    /// Verify a provided token in constant time. Every attempt increments the
    /// verification counter; failures are audit-logged with a reason code.
    pub fn verify_token(&self, provided: &str) -> bool {
        self.verifications.fetch_add(1, Ordering::Relaxed);

        let stored = match fs::read_to_string(&self.token_path) {
            Ok(contents) => contents.trim().to_string(),
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("🔐 Auth failure (reason=no_token)");
                return false;
            }
        };

        if constant_time_eq(stored.as_bytes(), provided.as_bytes()) {
            true
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("🔐 Auth failure (reason=invalid_token)");
            false
        }
    }

    /// Delete the old token file and write a fresh token.
    pub fn rotate_token(&self) -> Result<String> {
        if self.token_path.exists() {
            fs::remove_file(&self.token_path)
                .wrap_err_with(|| format!("Can't remove token file {:?}", self.token_path))?;
        }
        let token = self.generate_token()?;
        info!("🔑 Auth token rotated");
        Ok(token)
    }

    /// Rotate automatically when the token file is older than the threshold.
    /// Returns the new token when rotation happened.
    pub fn rotate_if_expired(&self, max_age_hours: u64) -> Result<Option<String>> {
        if !self.token_path.exists() {
            return Ok(None);
        }

        let age = self.token_age()?;
        if age > Duration::from_secs(max_age_hours * 3600) {
            debug!(
                "🔑 Token is {}h old (max {}h), rotating",
                age.as_secs() / 3600,
                max_age_hours
            );
            return self.rotate_token().map(Some);
        }
        Ok(None)
    }

    /// Age of the token file, from its mtime.
    pub fn token_age(&self) -> Result<Duration> {
        let metadata = fs::metadata(&self.token_path)
            .wrap_err_with(|| format!("Can't stat token file {:?}", self.token_path))?;
        let modified = metadata
            .modified()
            .wrap_err("Token file has no modification time")?;
        Ok(modified.elapsed().unwrap_or(Duration::ZERO))
    }

    pub fn metrics(&self) -> AuthMetrics {
        AuthMetrics {
            verifications: self.verifications.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn generate_token(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        if let Some(parent) = self.token_path.parent() {
            if !parent.exists() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)
                    .wrap_err_with(|| format!("Can't create token directory {:?}", parent))?;
            }
        }

        // Owner-only from the first byte: create with 0600 rather than chmod after
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.token_path)
            .wrap_err_with(|| format!("Can't write token file {:?}", self.token_path))?;
        writeln!(file, "{token}")?;

        debug!("🔑 Generated new auth token at {:?}", self.token_path);
        Ok(token)
    }
}

/// Compare two byte strings without short-circuiting on the first mismatch.
/// A length mismatch still walks the provided bytes so timing does not leak
/// the prefix length.
fn constant_time_eq(stored: &[u8], provided: &[u8]) -> bool {
    let mut diff = (stored.len() ^ provided.len()) as u8;
    for (index, byte) in provided.iter().enumerate() {
        let other = stored.get(index % stored.len().max(1)).copied().unwrap_or(0);
        diff |= byte ^ other;
    }
    diff == 0
}

/// Shared world-writable temp locations a private socket must never live in.
const FORBIDDEN_PREFIXES: &[&str] = &["/tmp", "/var/tmp", "/dev/shm"];

/// Validates that the daemon's listening socket lives in a safe, user-owned
/// location. Fail closed: any violation aborts daemon startup.
pub struct SocketGuard {
    home_dir: PathBuf,
}

impl SocketGuard {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    /// Check socket placement before binding, creating the parent directory
    /// with owner-only permissions if it is missing.
    pub fn check(&self, socket_path: &Path) -> Result<()> {
        if !socket_path.starts_with(&self.home_dir) {
            return Err(eyre!(MbxError::SocketSecurity {
                socket_path: socket_path.to_path_buf(),
                reason: format!("path is outside the home directory {:?}", self.home_dir),
            }));
        }

        for prefix in FORBIDDEN_PREFIXES {
            if socket_path.starts_with(prefix) {
                return Err(eyre!(MbxError::SocketSecurity {
                    socket_path: socket_path.to_path_buf(),
                    reason: format!("path is under the world-writable temp directory {prefix}"),
                }));
            }
        }

        let parent = socket_path
            .parent()
            .ok_or_else(|| eyre!("socket path {:?} has no parent directory", socket_path))?;

        if !parent.exists() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .wrap_err_with(|| format!("Can't create socket directory {:?}", parent))?;
            debug!("📁 Created socket directory {:?} (0700)", parent);
        }

        let metadata = fs::metadata(parent)
            .wrap_err_with(|| format!("Can't stat socket directory {:?}", parent))?;

        let current_uid = unsafe { libc::geteuid() };
        if metadata.uid() != current_uid {
            return Err(eyre!(MbxError::SocketSecurity {
                socket_path: socket_path.to_path_buf(),
                reason: format!(
                    "parent directory {:?} is owned by uid {} (expected {})",
                    parent,
                    metadata.uid(),
                    current_uid
                ),
            }));
        }

        if metadata.mode() & 0o002 != 0 {
            return Err(eyre!(MbxError::SocketSecurity {
                socket_path: socket_path.to_path_buf(),
                reason: format!(
                    "parent directory {:?} is world-writable (mode {:o})",
                    parent,
                    metadata.mode() & 0o777
                ),
            }));
        }

        debug!("🔒 Socket placement validated: {:?}", socket_path);
        Ok(())
    }

    /// Tighten the bound socket file itself to owner read/write only.
    pub fn tighten(&self, socket_path: &Path) -> Result<()> {
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
            .wrap_err_with(|| format!("Can't set permissions on socket {:?}", socket_path))?;
        Ok(())
    }
}
