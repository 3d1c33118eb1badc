// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! rumi-config
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// `RUMI_SECURITY_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Production hardening: permission mode defaults to secure, host
    /// execution needs signed approval, permissive launch is refused.
    #[default]
    Strict,
    /// Development mode.
    Permissive,
}

/// `RUMI_PERMISSION_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// Deny by default; trust checks apply everywhere.
    Secure,
    /// Trust checks are bypassed for built-in handlers only.
    Permissive,
}

/// Refusal from [`BrokerConfig::enforce_startup`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// `strict` security with `permissive` permissions is refused.
    #[error("RUMI_SECURITY_MODE=strict refuses RUMI_PERMISSION_MODE=permissive")]
    PermissiveUnderStrict,
    /// An environment value could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: String,
        /// Offending value.
        value: String,
    },
}

/// Parsed environment configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// Security posture.
    pub security_mode: SecurityMode,
    /// Permission posture (defaulted from the security mode when unset).
    pub permission_mode: PermissionMode,
    /// Whether `RUMI_PERMISSION_MODE` was set explicitly.
    pub permission_mode_explicit: bool,
    /// `RUMI_CAPABILITY_SOCKET`: capability socket path override.
    pub capability_socket: Option<String>,
    /// `RUMI_CAPABILITY_SOCKET_MODE`: octal socket mode (default `0660`).
    pub socket_mode: u32,
    /// `RUMI_CAPABILITY_SOCKET_GID`: socket group override.
    pub socket_gid: Option<u32>,
    /// `RUMI_HMAC_SECRET`: key-encryption passphrase.
    pub hmac_secret: Option<String>,
    /// `RUMI_HMAC_ROTATE`: rotate the signing key at startup.
    pub hmac_rotate: bool,
}

/// Default socket mode: owner and group only.
pub const DEFAULT_SOCKET_MODE: u32 = 0o660;

/// The relaxed world-accessible socket mode; using it is audited.
pub const RELAXED_SOCKET_MODE: u32 = 0o666;

impl BrokerConfig {
    /// Parse from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Parse from an explicit variable map (test surface).
    pub fn from_map(vars: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let security_mode = match vars.get("RUMI_SECURITY_MODE").map(String::as_str) {
            None | Some("strict") => SecurityMode::Strict,
            Some("permissive") => SecurityMode::Permissive,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "RUMI_SECURITY_MODE".to_string(),
                    value: other.to_string(),
                });
            }
        };

        let (permission_mode, permission_mode_explicit) =
            match vars.get("RUMI_PERMISSION_MODE").map(String::as_str) {
                None => (
                    match security_mode {
                        SecurityMode::Strict => PermissionMode::Secure,
                        SecurityMode::Permissive => PermissionMode::Permissive,
                    },
                    false,
                ),
                Some("secure") => (PermissionMode::Secure, true),
                Some("permissive") => (PermissionMode::Permissive, true),
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        var: "RUMI_PERMISSION_MODE".to_string(),
                        value: other.to_string(),
                    });
                }
            };

        if security_mode == SecurityMode::Strict && permission_mode == PermissionMode::Permissive {
            warn!(
                target: "rumi.config",
                "RUMI_SECURITY_MODE=strict combined with RUMI_PERMISSION_MODE=permissive"
            );
            warn!(target: "rumi.config", "running in PERMISSIVE mode weakens trust checks");
        }

        let socket_mode = match vars.get("RUMI_CAPABILITY_SOCKET_MODE") {
            None => DEFAULT_SOCKET_MODE,
            Some(raw) => u32::from_str_radix(raw.trim_start_matches("0o"), 8).map_err(|_| {
                ConfigError::InvalidValue {
                    var: "RUMI_CAPABILITY_SOCKET_MODE".to_string(),
                    value: raw.clone(),
                }
            })?,
        };

        let socket_gid = match vars.get("RUMI_CAPABILITY_SOCKET_GID") {
            None => None,
            Some(raw) => Some(raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                var: "RUMI_CAPABILITY_SOCKET_GID".to_string(),
                value: raw.clone(),
            })?),
        };

        Ok(Self {
            security_mode,
            permission_mode,
            permission_mode_explicit,
            capability_socket: vars.get("RUMI_CAPABILITY_SOCKET").cloned(),
            socket_mode,
            socket_gid,
            hmac_secret: vars.get("RUMI_HMAC_SECRET").cloned(),
            hmac_rotate: matches!(
                vars.get("RUMI_HMAC_ROTATE").map(String::as_str),
                Some("1") | Some("true")
            ),
        })
    }

    /// Launch-time guard: in strict security mode a permissive permission
    /// mode is refused (the launcher exits non-zero on this error).
    pub fn enforce_startup(&self) -> Result<(), ConfigError> {
        if self.security_mode == SecurityMode::Strict
            && self.permission_mode == PermissionMode::Permissive
        {
            return Err(ConfigError::PermissiveUnderStrict);
        }
        Ok(())
    }

    /// Whether built-in handlers skip trust checks.
    pub fn builtin_trust_bypass(&self) -> bool {
        self.permission_mode == PermissionMode::Permissive
    }
}
