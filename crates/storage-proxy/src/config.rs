//! Storage configuration loading, reconciliation, and persistence.
//!
//! The active configuration comes from two layers: the process environment and
//! a JSON file (`storage_config.json` by default). The file wins field by
//! field. Once loaded, the record is owned by [`ConfigStore`] and only changes
//! through [`ConfigStore::replace`] (reconfiguration) or
//! [`ConfigStore::record_tokens`] (credential rotation).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

pub const DEFAULT_CONFIG_FILE: &str = "./storage_config.json";
pub const DEFAULT_LOCAL_PATH: &str = "./storage_data";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_NAMESPACE: &str = "storage-proxy";
pub const DEFAULT_REMOTE_FOLDER: &str = "/StorageProxy";

/// Which backend a configuration asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    #[serde(alias = "cloud", alias = "s3")]
    ObjectStore,
    #[serde(alias = "dropbox")]
    TokenHost,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::ObjectStore => "object-store",
            StorageMode::TokenHost => "token-host",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(StorageMode::Local),
            "object-store" | "cloud" | "s3" => Ok(StorageMode::ObjectStore),
            "token-host" | "dropbox" => Ok(StorageMode::TokenHost),
            other => Err(StorageError::Config(format!(
                "Invalid storage mode: {other}"
            ))),
        }
    }
}

/// Persisted storage configuration.
///
/// Every field is optional so that a record can be layered over another one.
/// Fields that the selected mode does not use are carried along untouched and
/// never validated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default, alias = "storage_mode", skip_serializing_if = "Option::is_none")]
    pub mode: Option<StorageMode>,

    /// Root directory of the local backend
    #[serde(default, alias = "local_storage_path", skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,

    #[serde(default, alias = "s3_bucket", skip_serializing_if = "Option::is_none")]
    pub bucket_name: Option<String>,
    #[serde(default, alias = "aws_region", skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Object key prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,

    #[serde(default, alias = "dropbox_access_token", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, alias = "dropbox_refresh_token", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, alias = "dropbox_app_key", skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(default, alias = "dropbox_app_secret", skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    #[serde(default, alias = "dropbox_folder", skip_serializing_if = "Option::is_none")]
    pub remote_folder: Option<String>,
}

impl StorageConfig {
    /// Configuration for the local backend rooted at `path`.
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            mode: Some(StorageMode::Local),
            local_path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Parse a configuration record supplied by a caller.
    ///
    /// Unknown modes and malformed fields are configuration errors.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| StorageError::Config(format!("Invalid storage configuration: {e}")))
    }

    /// Build a configuration from environment variables.
    ///
    /// `lookup` abstracts `std::env::var` so tests don't have to touch the
    /// process environment.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mode = var("STORAGE_MODE").map(|m| m.parse()).transpose()?;

        Ok(Self {
            mode,
            local_path: var("LOCAL_STORAGE_PATH"),
            bucket_name: var("S3_BUCKET"),
            region: var("AWS_REGION"),
            endpoint: var("AWS_ENDPOINT_URL"),
            namespace: var("S3_NAMESPACE"),
            aws_access_key_id: var("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            access_token: var("DROPBOX_ACCESS_TOKEN"),
            refresh_token: var("DROPBOX_REFRESH_TOKEN"),
            app_key: var("DROPBOX_APP_KEY"),
            app_secret: var("DROPBOX_APP_SECRET"),
            remote_folder: var("DROPBOX_FOLDER"),
        })
    }

    /// Layer `self` over `base`: every field set here wins.
    pub fn layered_over(self, base: StorageConfig) -> StorageConfig {
        StorageConfig {
            mode: self.mode.or(base.mode),
            local_path: self.local_path.or(base.local_path),
            bucket_name: self.bucket_name.or(base.bucket_name),
            region: self.region.or(base.region),
            endpoint: self.endpoint.or(base.endpoint),
            namespace: self.namespace.or(base.namespace),
            aws_access_key_id: self.aws_access_key_id.or(base.aws_access_key_id),
            aws_secret_access_key: self.aws_secret_access_key.or(base.aws_secret_access_key),
            access_token: self.access_token.or(base.access_token),
            refresh_token: self.refresh_token.or(base.refresh_token),
            app_key: self.app_key.or(base.app_key),
            app_secret: self.app_secret.or(base.app_secret),
            remote_folder: self.remote_folder.or(base.remote_folder),
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode.unwrap_or_default()
    }

    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(non_empty(&self.local_path).unwrap_or(DEFAULT_LOCAL_PATH))
    }

    pub fn region(&self) -> &str {
        non_empty(&self.region).unwrap_or(DEFAULT_REGION)
    }

    /// Object key prefix, without surrounding slashes.
    pub fn namespace(&self) -> &str {
        non_empty(&self.namespace)
            .map(|ns| ns.trim_matches('/'))
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Remote folder, always starting with `/` and never ending with one.
    pub fn remote_folder(&self) -> String {
        let folder = non_empty(&self.remote_folder).unwrap_or(DEFAULT_REMOTE_FOLDER);
        format!("/{}", folder.trim_matches('/'))
    }

    pub fn bucket_name(&self) -> Option<&str> {
        non_empty(&self.bucket_name)
    }

    pub fn access_token(&self) -> Option<&str> {
        non_empty(&self.access_token)
    }

    /// Whether an OAuth refresh can be attempted with this configuration.
    pub fn can_refresh(&self) -> bool {
        non_empty(&self.refresh_token).is_some()
            && non_empty(&self.app_key).is_some()
            && non_empty(&self.app_secret).is_some()
    }

    /// Human-readable location of the data for the given mode.
    pub fn location(&self, mode: StorageMode) -> String {
        match mode {
            StorageMode::Local => self.local_path().display().to_string(),
            StorageMode::ObjectStore => format!(
                "{}/{}",
                self.bucket_name().unwrap_or("<unset>"),
                self.namespace()
            ),
            StorageMode::TokenHost => self.remote_folder(),
        }
    }

    /// A copy of this configuration that is safe to hand back to callers.
    pub fn redacted(&self) -> ConfigView {
        let mode = self.mode();
        ConfigView {
            mode,
            local_path: self.local_path().display().to_string(),
            bucket_name: self.bucket_name.clone(),
            region: self.region().to_string(),
            endpoint: self.endpoint.clone(),
            namespace: self.namespace().to_string(),
            remote_folder: self.remote_folder(),
            has_access_token: self.access_token().is_some(),
            has_refresh_token: non_empty(&self.refresh_token).is_some(),
            has_app_credentials: non_empty(&self.app_key).is_some()
                && non_empty(&self.app_secret).is_some(),
            has_aws_credentials: non_empty(&self.aws_access_key_id).is_some(),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Configuration with credentials replaced by presence flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigView {
    pub mode: StorageMode,
    pub local_path: String,
    pub bucket_name: Option<String>,
    pub region: String,
    pub endpoint: Option<String>,
    pub namespace: String,
    pub remote_folder: String,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub has_app_credentials: bool,
    pub has_aws_credentials: bool,
}

/// Owner of the persisted configuration record.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<StorageConfig>,
}

impl ConfigStore {
    /// Load the configuration file at `path`, layered over the process
    /// environment.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_env(path, |name| std::env::var(name).ok())
    }

    /// Like [`ConfigStore::open`], with an explicit environment lookup.
    pub fn open_with_env<F>(path: impl AsRef<Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref().to_path_buf();
        let file = Self::read_file(&path)?;

        // A mode set in the file wins, so the env mode is only parsed when used
        let file_sets_mode = file.as_ref().is_some_and(|f| f.mode.is_some());
        let env = StorageConfig::from_env_with(|name| {
            if file_sets_mode && name == "STORAGE_MODE" {
                None
            } else {
                lookup(name)
            }
        })?;

        let config = match file {
            Some(file) => {
                tracing::info!("Loaded storage configuration from {:?}", path);
                file.layered_over(env)
            }
            None => {
                tracing::info!(
                    "No storage configuration at {:?}, using environment and defaults",
                    path
                );
                env
            }
        };

        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    fn read_file(path: &Path) -> Result<Option<StorageConfig>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let config = serde_json::from_str(&content).map_err(|e| {
            StorageError::Config(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration.
    pub fn current(&self) -> StorageConfig {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist `config` and make it current.
    pub fn replace(&self, config: StorageConfig) -> Result<()> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        self.save(&config)?;
        *current = config;
        Ok(())
    }

    /// Persist a rotated access token (and refresh token, if the host issued a
    /// new one) in place of `stale_token`.
    ///
    /// Does nothing if the stored record no longer holds `stale_token`, which
    /// happens when the configuration was replaced while the refresh was in
    /// flight. Returns whether the record was updated.
    pub fn record_tokens(
        &self,
        stale_token: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<bool> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.access_token() != Some(stale_token) {
            tracing::debug!("Stored access token changed since refresh started, not persisting");
            return Ok(false);
        }

        let mut updated = current.clone();
        updated.access_token = Some(access_token.to_string());
        if let Some(refresh) = refresh_token {
            updated.refresh_token = Some(refresh.to_string());
        }
        self.save(&updated)?;
        *current = updated;
        tracing::info!("Persisted rotated access token to {:?}", self.path);
        Ok(true)
    }

    /// Write to a temp file next to the target, then rename over it.
    fn save(&self, config: &StorageConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(config)?;
        let suffix: [u8; 8] = rand::rng().random();
        let temp_path = self
            .path
            .with_extension(format!("{}.tmp", hex::encode(suffix)));

        if let Err(e) = std::fs::write(&temp_path, content) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e.into());
        }
        Ok(())
    }
}
