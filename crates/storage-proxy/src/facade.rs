//! The single entry point callers use to reach storage.
//!
//! [`StorageFacade`] owns one [`StorageContext`]: the active backend plus the
//! configuration it was built from. Requests share the context through a read
//! lock; reconfiguration builds a complete replacement first and swaps it in
//! under the write lock, so in-flight requests finish against the old backend
//! and later ones see only the new one.
//!
//! A remote backend that can't be initialized never takes the process down:
//! the façade falls back to local storage and remembers why.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::backend::object_store::S3Client;
use crate::backend::token_host::DropboxApi;
use crate::backend::{
    Backend, HostApi, LocalBackend, ObjectClient, ObjectStoreBackend, SizeInfo, TokenHostBackend,
};
use crate::codec;
use crate::config::{ConfigStore, ConfigView, StorageConfig, StorageMode};
use crate::credentials::{Credential, CredentialManager, RetryPolicy};
use crate::error::{Result, StorageError};

const PROBE_FILE: &str = ".test_write";

/// Creates the remote clients backends are built on.
pub trait Connector: Send + Sync {
    fn object_client(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectClient>>;

    fn host_api(&self, config: &StorageConfig) -> Result<Arc<dyn HostApi>>;
}

/// Connects to real S3 and Dropbox endpoints.
pub struct RemoteConnector;

impl Connector for RemoteConnector {
    fn object_client(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectClient>> {
        Ok(Arc::new(S3Client::from_config(config)?))
    }

    fn host_api(&self, _config: &StorageConfig) -> Result<Arc<dyn HostApi>> {
        Ok(Arc::new(DropboxApi::new()?))
    }
}

/// The live backend and the configuration it came from.
pub struct StorageContext {
    config: StorageConfig,
    active: StorageMode,
    backend: Box<dyn Backend>,
    fallback_reason: Option<String>,
}

impl StorageContext {
    pub fn active_mode(&self) -> StorageMode {
        self.active
    }

    pub fn requested_mode(&self) -> StorageMode {
        self.config.mode()
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }
}

/// Result of [`StorageFacade::reconfigure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureOutcome {
    pub requested_mode: StorageMode,
    pub active_mode: StorageMode,
    /// Whether the requested backend is the one now serving requests.
    pub connected: bool,
    pub message: String,
}

/// Where requests are currently going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStatus {
    pub requested_mode: StorageMode,
    pub active_mode: StorageMode,
    pub location: String,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub key: String,
    pub error: String,
}

/// Result of a bulk [`StorageFacade::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: Vec<SyncFailure>,
}

pub struct StorageFacade {
    store: Arc<ConfigStore>,
    connector: Arc<dyn Connector>,
    policy: RetryPolicy,
    context: RwLock<StorageContext>,
    /// Serializes reconfigurations with each other (not with requests).
    reconfigure_lock: Mutex<()>,
}

impl StorageFacade {
    /// Initialize from the store's current configuration, connecting to real
    /// remote services.
    pub async fn start(store: Arc<ConfigStore>) -> Result<Self> {
        Self::with_connector(store, Arc::new(RemoteConnector), RetryPolicy::default()).await
    }

    pub async fn with_connector(
        store: Arc<ConfigStore>,
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let context = build_context(store.current(), &store, connector.as_ref(), policy).await?;
        Ok(Self {
            store,
            connector,
            policy,
            context: RwLock::new(context),
            reconfigure_lock: Mutex::new(()),
        })
    }

    pub async fn active_mode(&self) -> StorageMode {
        self.context.read().await.active_mode()
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        codec::validate_key(key)?;
        let value = codec::coerce_value(value);
        let context = self.context.read().await;
        context
            .backend
            .set(key, &value)
            .await
            .inspect_err(|e| tracing::error!("Error saving {} to {}: {}", key, context.active, e))
    }

    /// `Ok(None)` when nothing is stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        codec::validate_key(key)?;
        let context = self.context.read().await;
        context
            .backend
            .get(key)
            .await
            .inspect_err(|e| tracing::error!("Error loading {} from {}: {}", key, context.active, e))
    }

    /// Removing a missing key succeeds.
    pub async fn delete(&self, key: &str) -> Result<()> {
        codec::validate_key(key)?;
        let context = self.context.read().await;
        context
            .backend
            .remove(key)
            .await
            .inspect_err(|e| tracing::error!("Error removing {} from {}: {}", key, context.active, e))
    }

    pub async fn list_keys(&self) -> Result<Vec<String>> {
        let context = self.context.read().await;
        context
            .backend
            .list()
            .await
            .inspect_err(|e| tracing::error!("Error listing keys in {}: {}", context.active, e))
    }

    pub async fn size_info(&self) -> Result<SizeInfo> {
        let context = self.context.read().await;
        context
            .backend
            .size()
            .await
            .inspect_err(|e| tracing::error!("Error computing size of {}: {}", context.active, e))
    }

    /// Store many records at once. Individual failures are reported, not
    /// fatal.
    pub async fn sync(&self, items: BTreeMap<String, Value>) -> SyncReport {
        let mut report = SyncReport::default();
        for (key, value) in items {
            match self.put(&key, value).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    if matches!(e, StorageError::Permission(_)) {
                        tracing::error!(
                            "Error syncing {}: Dropbox permission error - 'files.content.write' scope required",
                            key
                        );
                    }
                    report.failed.push(SyncFailure {
                        key,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            "Synced {} records ({} failed)",
            report.synced,
            report.failed.len()
        );
        report
    }

    pub async fn status(&self) -> StorageStatus {
        let context = self.context.read().await;
        StorageStatus {
            requested_mode: context.requested_mode(),
            active_mode: context.active,
            location: context.config.location(context.active),
            fallback_reason: context.fallback_reason.clone(),
        }
    }

    /// The persisted configuration with credentials redacted.
    pub fn config_view(&self) -> ConfigView {
        self.store.current().redacted()
    }

    /// Switch to the backend `config` selects and persist it.
    ///
    /// The new backend is fully initialized before anything is saved or the
    /// old one is replaced. If initialization fails outright, the stored
    /// configuration and the active backend are left as they were.
    /// If the requested remote backend can't be reached, local storage takes
    /// over and the outcome says so.
    pub async fn reconfigure(&self, config: StorageConfig) -> Result<ReconfigureOutcome> {
        let _serialized = self.reconfigure_lock.lock().await;

        let requested = config.mode();
        let context = build_context(config, &self.store, self.connector.as_ref(), self.policy).await?;
        // Only a context that came up is persisted, tokens refreshed while
        // validating included
        self.store.replace(context.config.clone())?;

        let outcome = match (&context.fallback_reason, requested) {
            (None, StorageMode::Local) => ReconfigureOutcome {
                requested_mode: requested,
                active_mode: context.active,
                connected: true,
                message: format!(
                    "Configuration saved. Using local storage at {}.",
                    context.config.location(StorageMode::Local)
                ),
            },
            (None, _) => ReconfigureOutcome {
                requested_mode: requested,
                active_mode: context.active,
                connected: true,
                message: format!(
                    "Configuration saved and {requested} connection verified. No restart needed."
                ),
            },
            (Some(reason), _) => ReconfigureOutcome {
                requested_mode: requested,
                active_mode: context.active,
                connected: false,
                message: format!(
                    "Configuration saved, but {requested} storage could not be initialized: {reason}\n\
                     Using local storage until the connection succeeds."
                ),
            },
        };

        *self.context.write().await = context;
        tracing::info!("Storage reconfigured: {}", outcome.message);
        Ok(outcome)
    }

    /// Check that `config` would work, without persisting anything or
    /// touching the active backend.
    pub async fn test_connection(&self, config: &StorageConfig) -> Result<String> {
        match config.mode() {
            StorageMode::Local => test_local(config).await,
            StorageMode::ObjectStore => {
                let bucket = config.bucket_name().ok_or_else(|| {
                    StorageError::Config("All AWS credentials are required (bucket name is missing)".into())
                })?;
                connect_object_store(config, self.connector.as_ref(), self.policy).await?;
                Ok(format!("S3 connection successful. Bucket: {bucket}"))
            }
            StorageMode::TokenHost => {
                let credential = Credential::from_config(config)?;
                let api = self.connector.host_api(config)?;
                let manager = CredentialManager::new(Arc::clone(&api), credential, None, self.policy);
                manager.validate().await?;

                let folder = config.remote_folder();
                let probe = format!("{}/{}", folder.trim_end_matches('/'), PROBE_FILE);
                manager
                    .call(|token| {
                        let api = Arc::clone(&api);
                        let probe = probe.clone();
                        async move { api.upload(&token, &probe, b"test".to_vec()).await }
                    })
                    .await
                    .map_err(|e| match e {
                        StorageError::Permission(_) => e,
                        other => StorageError::backend(
                            "Dropbox",
                            format!("Dropbox write test failed: {other}"),
                        ),
                    })?;
                if let Err(e) = api.delete(&manager.credential().await.access_token, &probe).await {
                    tracing::debug!("Could not remove Dropbox probe file: {}", e);
                }

                Ok(format!("Dropbox connection successful. Folder: {folder}"))
            }
        }
    }
}

/// Build the context `config` asks for, falling back to local storage when a
/// remote backend can't be initialized.
async fn build_context(
    mut config: StorageConfig,
    store: &Arc<ConfigStore>,
    connector: &dyn Connector,
    policy: RetryPolicy,
) -> Result<StorageContext> {
    let requested = config.mode();
    let remote = match requested {
        StorageMode::Local => None,
        StorageMode::ObjectStore => Some(connect_object_store(&config, connector, policy).await),
        StorageMode::TokenHost => {
            Some(connect_token_host(&mut config, connector, Arc::clone(store), policy).await)
        }
    };

    let fallback_reason = match remote {
        Some(Ok(backend)) => {
            return Ok(StorageContext {
                config,
                active: requested,
                backend,
                fallback_reason: None,
            });
        }
        Some(Err(e)) => {
            tracing::warn!("{} storage unavailable: {}", requested, e);
            tracing::warn!("Falling back to local storage.");
            Some(e.to_string())
        }
        None => None,
    };

    let backend = LocalBackend::new(config.local_path()).await?;
    Ok(StorageContext {
        config,
        active: StorageMode::Local,
        backend: Box::new(backend),
        fallback_reason,
    })
}

async fn connect_object_store(
    config: &StorageConfig,
    connector: &dyn Connector,
    policy: RetryPolicy,
) -> Result<Box<dyn Backend>> {
    let bucket = config.bucket_name().ok_or_else(|| {
        StorageError::Config("object-store mode requires a bucket name (S3_BUCKET)".into())
    })?;

    let client = connector.object_client(config)?;
    let prefix = format!("{}/", config.namespace());
    tokio::time::timeout(policy.probe_timeout, client.probe(&prefix))
        .await
        .map_err(|_| StorageError::Connectivity(format!("S3 bucket {bucket} did not respond in time")))??;

    tracing::info!(
        "Cloud storage (S3) initialized with bucket: {} (namespace {})",
        bucket,
        config.namespace()
    );
    Ok(Box::new(ObjectStoreBackend::new(client, config.namespace())))
}

/// Validate the Dropbox credential in `config`. Tokens refreshed along the
/// way are written back into `config`.
async fn connect_token_host(
    config: &mut StorageConfig,
    connector: &dyn Connector,
    store: Arc<ConfigStore>,
    policy: RetryPolicy,
) -> Result<Box<dyn Backend>> {
    let credential = Credential::from_config(config)?;
    let api = connector.host_api(config)?;
    let manager = CredentialManager::new(Arc::clone(&api), credential, Some(store), policy);

    let account = manager.validate().await?;
    let validated = manager.credential().await;
    config.access_token = Some(validated.access_token);
    if validated.refresh_token.is_some() {
        config.refresh_token = validated.refresh_token;
    }

    let folder = config.remote_folder();
    tracing::info!(
        "Dropbox storage initialized for {}. Folder: {}",
        if account.is_empty() { "<unknown account>" } else { account.as_str() },
        folder
    );
    Ok(Box::new(TokenHostBackend::new(api, &folder, manager)))
}

async fn test_local(config: &StorageConfig) -> Result<String> {
    let path = config.local_path();
    let probe = path.join(PROBE_FILE);

    let result = async {
        tokio::fs::create_dir_all(&path).await?;
        tokio::fs::write(&probe, b"test").await?;
        tokio::fs::remove_file(&probe).await
    }
    .await;

    result
        .map(|()| format!("Local storage path is accessible: {}", path.display()))
        .map_err(|e| StorageError::Connectivity(format!("Cannot access local path: {e}")))
}
