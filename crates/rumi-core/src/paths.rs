// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical on-disk layout for broker state.
//!
//! All persistent state lives under a single `user_data` directory; socket
//! files live under a separate runtime `sockets` directory so they can sit
//! on a tmpfs.

use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Installer candidate family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallerFamily {
    /// Capability handler candidates.
    Capability,
    /// Dependency candidates.
    Dependency,
}

impl InstallerFamily {
    /// Directory name for this family.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Capability => "capability_installer",
            Self::Dependency => "dependency_installer",
        }
    }
}

/// Resolved directory layout.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    user_data: PathBuf,
    sockets: PathBuf,
}

impl RuntimePaths {
    /// Build a layout rooted at the given directories.
    pub fn new(user_data: impl Into<PathBuf>, sockets: impl Into<PathBuf>) -> Self {
        Self {
            user_data: user_data.into(),
            sockets: sockets.into(),
        }
    }

    /// Root of persistent state.
    pub fn user_data(&self) -> &Path {
        &self.user_data
    }

    /// Root of runtime socket files.
    pub fn sockets(&self) -> &Path {
        &self.sockets
    }

    /// Signing key file.
    pub fn hmac_keys_file(&self) -> PathBuf {
        self.user_data.join("hmac_keys.json")
    }

    /// Signed trust document.
    pub fn trust_file(&self) -> PathBuf {
        self.user_data.join("trust").join("trust.json")
    }

    /// Signed grant document.
    pub fn grants_file(&self) -> PathBuf {
        self.user_data.join("grants").join("grants.json")
    }

    /// Signed host privilege allow-list.
    pub fn host_privileges_file(&self) -> PathBuf {
        self.user_data.join("host_privileges.json")
    }

    /// Root directory for declared stores.
    pub fn stores_dir(&self) -> PathBuf {
        self.user_data.join("stores")
    }

    /// Store index document.
    pub fn store_index_file(&self) -> PathBuf {
        self.stores_dir().join("stores.json")
    }

    /// Secret value files, one per key.
    pub fn secrets_dir(&self) -> PathBuf {
        self.user_data.join("secrets")
    }

    /// Installer state directory for a family.
    pub fn installer_dir(&self, family: InstallerFamily) -> PathBuf {
        self.user_data.join(family.dir_name())
    }

    /// Append-only audit log.
    pub fn audit_log_file(&self) -> PathBuf {
        self.user_data.join("audit.log")
    }

    /// Directory holding per-principal capability sockets.
    pub fn capability_socket_dir(&self) -> PathBuf {
        self.sockets.join("capability")
    }

    /// Directory holding per-pack egress sockets.
    pub fn egress_socket_dir(&self) -> PathBuf {
        self.sockets.join("egress")
    }

    /// Create every directory in the layout.
    ///
    /// Socket directories are restricted to 0750 so only the broker's group
    /// can traverse them.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [
            self.user_data.clone(),
            self.user_data.join("trust"),
            self.user_data.join("grants"),
            self.stores_dir(),
            self.secrets_dir(),
            self.installer_dir(InstallerFamily::Capability),
            self.installer_dir(InstallerFamily::Dependency),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        for dir in [self.capability_socket_dir(), self.egress_socket_dir()] {
            std::fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o750))?;
        }
        Ok(())
    }
}
