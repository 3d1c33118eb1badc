// SPDX-License-Identifier: MIT OR Apache-2.0
//! The wired service context. No global singletons: everything a component
//! needs arrives through here.

use crate::secrets::SecretsStore;
use rumi_audit::AuditLogger;
use rumi_config::BrokerConfig;
use rumi_core::paths::InstallerFamily;
use rumi_core::{PermissionId, RuntimePaths};
use rumi_grant::GrantManager;
use rumi_installer::InstallerState;
use rumi_keys::{KeyRing, KeyStoreError, KeyStoreOptions};
use rumi_registry::HandlerRegistry;
use rumi_store::StoreRegistry;
use rumi_trust::{HostPrivilegeManager, TrustStore};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Coarse lifecycle of the broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplicationState {
    /// Services are being wired.
    #[default]
    Booting,
    /// Serving requests.
    Ready,
    /// Draining; new requests are refused.
    ShuttingDown,
}

/// Bootstrap failures.
#[derive(Debug, Error)]
pub enum ServicesError {
    /// Directory layout could not be created.
    #[error("layout setup failed: {0}")]
    Layout(#[from] std::io::Error),
    /// Signing keys could not be loaded.
    #[error("key setup failed: {0}")]
    Keys(#[from] KeyStoreError),
    /// Startup configuration was refused.
    #[error("configuration refused: {0}")]
    Config(#[from] rumi_config::ConfigError),
}

/// Every long-lived collaborator, wired once at startup.
#[derive(Clone)]
pub struct Services {
    /// Parsed environment configuration.
    pub config: BrokerConfig,
    /// Directory layout.
    pub paths: RuntimePaths,
    /// Signing keys (immutable after load).
    pub keys: Arc<KeyRing>,
    /// Security audit log.
    pub audit: AuditLogger,
    /// Declared stores.
    pub stores: StoreRegistry,
    /// Trust bindings.
    pub trust: TrustStore,
    /// Capability grants.
    pub grants: GrantManager,
    /// Handler resolution.
    pub registry: HandlerRegistry,
    /// Host execution allow-list.
    pub privileges: HostPrivilegeManager,
    /// Secret values.
    pub secrets: SecretsStore,
    /// Capability handler candidates.
    pub capability_installer: InstallerState,
    /// Dependency candidates.
    pub dependency_installer: InstallerState,
}

/// Built-in permission ids registered at bootstrap.
pub(crate) const BUILTIN_PERMISSIONS: &[(&str, &str)] = &[
    ("secrets.get", "secrets_get"),
    ("store.get", "store_get"),
    ("store.set", "store_set"),
    ("store.delete", "store_delete"),
    ("store.list", "store_list"),
    ("store.batch_get", "store_batch_get"),
    ("store.cas", "store_cas"),
    ("docker.run", "docker_run"),
    ("docker.list", "docker_list"),
    ("docker.logs", "docker_logs"),
    ("docker.exec", "docker_exec"),
    ("flow.run", "flow_run"),
];

impl Services {
    /// Wire every collaborator under the given layout.
    ///
    /// Refuses to start when [`BrokerConfig::enforce_startup`] does (strict
    /// security with permissive permissions).
    pub fn bootstrap(paths: RuntimePaths, config: BrokerConfig) -> Result<Self, ServicesError> {
        config.enforce_startup()?;
        paths.ensure()?;

        let audit = AuditLogger::new(paths.audit_log_file());
        let keys = Arc::new(rumi_keys::load_or_generate(
            &paths.hmac_keys_file(),
            &KeyStoreOptions {
                password: config.hmac_secret.clone(),
                rotate: config.hmac_rotate,
            },
        )?);

        let stores = StoreRegistry::open(paths.store_index_file(), paths.stores_dir());
        let trust = TrustStore::open(paths.trust_file(), Arc::clone(&keys), audit.clone());
        let grants = GrantManager::open(paths.grants_file(), Arc::clone(&keys), audit.clone());
        let privileges = HostPrivilegeManager::open(
            paths.host_privileges_file(),
            Arc::clone(&keys),
            audit.clone(),
        );
        let registry = HandlerRegistry::new(audit.clone());
        for (permission, handler_id) in BUILTIN_PERMISSIONS {
            let permission = PermissionId::parse(permission)
                .expect("builtin permission ids are well-formed");
            registry.register_builtin(&permission, handler_id);
        }
        let secrets = SecretsStore::new(paths.secrets_dir());
        let capability_installer = InstallerState::open(
            paths.installer_dir(InstallerFamily::Capability),
            audit.clone(),
        );
        let dependency_installer = InstallerState::open(
            paths.installer_dir(InstallerFamily::Dependency),
            audit.clone(),
        );

        info!(target: "rumi.exec", "services wired");
        Ok(Self {
            config,
            paths,
            keys,
            audit,
            stores,
            trust,
            grants,
            registry,
            privileges,
            secrets,
            capability_installer,
            dependency_installer,
        })
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("user_data", &self.paths.user_data())
            .finish_non_exhaustive()
    }
}
