// SPDX-License-Identifier: MIT OR Apache-2.0
//! Socket file management: naming, permissions, stale-file cleanup.

use rumi_audit::{AuditLogger, AuditSeverity};
use rumi_core::{Principal, socket_name};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Socket permission options, usually from
/// [`BrokerConfig`](rumi_config::BrokerConfig).
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// File mode for the socket (default `0660`).
    pub mode: u32,
    /// Optional group override applied with `chown`.
    pub gid: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            mode: rumi_config::DEFAULT_SOCKET_MODE,
            gid: None,
        }
    }
}

/// Creates and hardens per-principal socket files under one directory.
#[derive(Debug, Clone)]
pub struct UdsSocketManager {
    dir: PathBuf,
    options: SocketOptions,
    audit: AuditLogger,
}

impl UdsSocketManager {
    /// Manager over `dir` (created as 0750 on first bind).
    pub fn new(dir: impl Into<PathBuf>, options: SocketOptions, audit: AuditLogger) -> Self {
        Self {
            dir: dir.into(),
            options,
            audit,
        }
    }

    /// Deterministic socket path for a principal.
    pub fn socket_path(&self, principal: &Principal) -> PathBuf {
        self.dir.join(socket_name(principal))
    }

    /// The audit logger this manager reports through.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Bind the principal's socket, replacing a stale file and applying
    /// mode (and gid, if configured). A world-accessible mode is allowed
    /// but audited.
    pub fn bind(&self, principal: &Principal) -> io::Result<(UnixListener, PathBuf)> {
        std::fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o750))?;

        let path = self.socket_path(principal);
        if path.exists() {
            debug!(target: "rumi.proxy", path = %path.display(), "removing stale socket");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        self.apply_permissions(&path, principal)?;
        Ok((listener, path))
    }

    fn apply_permissions(&self, path: &Path, principal: &Principal) -> io::Result<()> {
        #[cfg(unix)]
        {
            if self.options.mode == rumi_config::RELAXED_SOCKET_MODE {
                warn!(target: "rumi.proxy", path = %path.display(), "socket mode relaxed to 0666");
                self.audit.security_event(
                    AuditSeverity::Warning,
                    "socket_mode_relaxed",
                    Some(principal.as_str()),
                    json!({"mode": "0666"}),
                );
            }
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(self.options.mode))?;
            if let Some(gid) = self.options.gid {
                chown_gid(path, gid)?;
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn chown_gid(path: &Path, gid: u32) -> io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    // Keep the owning uid, change only the group.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::chown(c_path.as_ptr(), u32::MAX, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
