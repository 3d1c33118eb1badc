// SPDX-License-Identifier: MIT OR Apache-2.0
//! Key persistence: load, generate, rotate, optionally encrypt at rest.

use crate::ring::{KeyRing, SigningKey};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const SECRET_LEN: usize = 32;
const FILE_VERSION: u32 = 1;

/// Errors from key loading or persistence.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Underlying filesystem failure.
    #[error("key file I/O failed: {0}")]
    Io(#[from] io::Error),
    /// The key file exists but cannot be parsed.
    #[error("key file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A persisted secret could not be decrypted or decoded.
    #[error("key material unreadable for version {version}")]
    Unreadable {
        /// Key version that failed to decode.
        version: u32,
    },
    /// Decryption requested but no password is configured, or vice versa.
    #[error("key encryption mismatch: {0}")]
    EncryptionMismatch(String),
    /// Every persisted key version is retired.
    #[error("key file holds no usable key")]
    NoUsableKey,
}

/// Options controlling [`load_or_generate`].
#[derive(Debug, Clone, Default)]
pub struct KeyStoreOptions {
    /// When set, secrets are wrapped with ChaCha20-Poly1305 under a key
    /// derived from this passphrase.
    pub password: Option<String>,
    /// Append a fresh key version on load (`RUMI_HMAC_ROTATE`).
    pub rotate: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: Vec<PersistedKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedKey {
    version: u32,
    created_at: DateTime<Utc>,
    #[serde(default)]
    retired: bool,
    enc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce_b64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ciphertext_b64: Option<String>,
}

/// Load the key ring from `path`, generating the file (and the first key
/// version) if it does not exist. `rotate` appends a new version without
/// retiring the old ones.
pub fn load_or_generate(
    path: &Path,
    options: &KeyStoreOptions,
) -> Result<KeyRing, KeyStoreError> {
    let mut file = if path.exists() {
        let raw = std::fs::read(path)?;
        serde_json::from_slice::<KeyFile>(&raw)?
    } else {
        KeyFile {
            version: FILE_VERSION,
            keys: vec![new_persisted_key(1, options)?],
        }
    };

    if file.keys.is_empty() {
        file.keys.push(new_persisted_key(1, options)?);
    } else if options.rotate {
        let next = file.keys.iter().map(|k| k.version).max().unwrap_or(0) + 1;
        info!(target: "rumi.keys", version = next, "rotating signing key");
        file.keys.push(new_persisted_key(next, options)?);
    }

    persist(path, &file)?;

    let mut keys = Vec::with_capacity(file.keys.len());
    for persisted in &file.keys {
        keys.push(SigningKey {
            version: persisted.version,
            secret: unwrap_secret(persisted, options)?,
            created_at: persisted.created_at,
            retired: persisted.retired,
        });
    }
    KeyRing::new(keys).ok_or(KeyStoreError::NoUsableKey)
}

fn new_persisted_key(
    version: u32,
    options: &KeyStoreOptions,
) -> Result<PersistedKey, KeyStoreError> {
    let mut secret = vec![0u8; SECRET_LEN];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    wrap_secret(version, &secret, options)
}

fn wrap_secret(
    version: u32,
    secret: &[u8],
    options: &KeyStoreOptions,
) -> Result<PersistedKey, KeyStoreError> {
    let mut key = PersistedKey {
        version,
        created_at: Utc::now(),
        retired: false,
        enc: "none".to_string(),
        secret_hex: None,
        nonce_b64: None,
        ciphertext_b64: None,
    };
    match &options.password {
        None => {
            key.secret_hex = Some(hex::encode(secret));
        }
        Some(password) => {
            let cipher = ChaCha20Poly1305::new(&derive_kek(password).into());
            let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = cipher.encrypt(&nonce, secret).map_err(|_| {
                KeyStoreError::EncryptionMismatch("encryption failed".to_string())
            })?;
            key.enc = "chacha20poly1305".to_string();
            key.nonce_b64 = Some(BASE64.encode(nonce));
            key.ciphertext_b64 = Some(BASE64.encode(ciphertext));
        }
    }
    Ok(key)
}

fn unwrap_secret(
    persisted: &PersistedKey,
    options: &KeyStoreOptions,
) -> Result<Vec<u8>, KeyStoreError> {
    match (persisted.enc.as_str(), &options.password) {
        ("none", _) => persisted
            .secret_hex
            .as_deref()
            .and_then(|h| hex::decode(h).ok())
            .ok_or(KeyStoreError::Unreadable {
                version: persisted.version,
            }),
        ("chacha20poly1305", Some(password)) => {
            let nonce_bytes = persisted
                .nonce_b64
                .as_deref()
                .and_then(|b| BASE64.decode(b).ok())
                .ok_or(KeyStoreError::Unreadable {
                    version: persisted.version,
                })?;
            let ciphertext = persisted
                .ciphertext_b64
                .as_deref()
                .and_then(|b| BASE64.decode(b).ok())
                .ok_or(KeyStoreError::Unreadable {
                    version: persisted.version,
                })?;
            if nonce_bytes.len() != 12 {
                return Err(KeyStoreError::Unreadable {
                    version: persisted.version,
                });
            }
            let cipher = ChaCha20Poly1305::new(&derive_kek(password).into());
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
                .map_err(|_| KeyStoreError::Unreadable {
                    version: persisted.version,
                })
        }
        ("chacha20poly1305", None) => Err(KeyStoreError::EncryptionMismatch(
            "key file is encrypted but no password is configured".to_string(),
        )),
        (other, _) => Err(KeyStoreError::EncryptionMismatch(format!(
            "unknown enc scheme {other:?}"
        ))),
    }
}

fn derive_kek(password: &str) -> [u8; 32] {
    Sha256::digest(password.as_bytes()).into()
}

fn persist(path: &Path, file: &KeyFile) -> Result<(), KeyStoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(file)?)?;
    #[cfg(unix)]
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
