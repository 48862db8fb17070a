//! File-hosting backend authenticated with OAuth bearer tokens (Dropbox).
//!
//! Records are stored as `<folder>/<key>.json.gz`, with read fallback to
//! legacy `<folder>/<key>.json` files. Every request goes through the
//! [`CredentialManager`], which renews an expired token and retries once.

mod dropbox;

pub use dropbox::DropboxApi;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;

use super::{Backend, FileSize, SizeInfo};
use crate::codec::{self, COMPRESSED_EXT, PLAIN_EXT};
use crate::credentials::{classify, CredentialManager, ErrorClass};
use crate::error::Result;

/// Failure reported by the host, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{summary}")]
pub struct HostError {
    /// HTTP status; `None` when the request never got a response.
    pub status: Option<u16>,
    /// Host error summary (e.g. `path/not_found/..`) or transport message.
    pub summary: String,
}

impl HostError {
    pub fn http(status: u16, summary: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            summary: summary.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            summary: message.into(),
        }
    }
}

/// A file in a folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub size: u64,
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderPage {
    /// Files only; folders and deleted entries are skipped.
    pub entries: Vec<HostEntry>,
    pub cursor: String,
    pub has_more: bool,
}

/// Tokens returned by the OAuth token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present only when the host rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Raw host operations. Errors are returned unclassified.
#[async_trait::async_trait]
pub trait HostApi: Send + Sync {
    /// Identity of the token's owner; used as a connection check.
    async fn current_account(&self, token: &str) -> std::result::Result<String, HostError>;

    /// Upload `body` to `path`, overwriting any existing file.
    async fn upload(&self, token: &str, path: &str, body: Vec<u8>) -> std::result::Result<(), HostError>;

    async fn download(&self, token: &str, path: &str) -> std::result::Result<Vec<u8>, HostError>;

    async fn delete(&self, token: &str, path: &str) -> std::result::Result<(), HostError>;

    async fn list_folder(&self, token: &str, path: &str) -> std::result::Result<FolderPage, HostError>;

    async fn list_folder_continue(&self, token: &str, cursor: &str) -> std::result::Result<FolderPage, HostError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_token(
        &self,
        app_key: &str,
        app_secret: &str,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, HostError>;
}

/// Treat a not-found failure as `default`.
fn absent_ok<T>(result: std::result::Result<T, HostError>, default: T) -> std::result::Result<T, HostError> {
    match result {
        Err(e) if classify(&e) == ErrorClass::NotFound => Ok(default),
        other => other,
    }
}

pub struct TokenHostBackend {
    api: Arc<dyn HostApi>,
    folder: String,
    credentials: CredentialManager,
}

impl TokenHostBackend {
    /// `folder` is an absolute host path such as `/StorageProxy`.
    pub fn new(api: Arc<dyn HostApi>, folder: &str, credentials: CredentialManager) -> Self {
        Self {
            api,
            folder: folder.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    fn file_path(&self, name: &str) -> String {
        format!("{}/{}", self.folder, name)
    }

    async fn download(&self, path: String) -> Result<Option<Vec<u8>>> {
        self.credentials
            .call(|token| {
                let api = Arc::clone(&self.api);
                let path = path.clone();
                async move { absent_ok(api.download(&token, &path).await.map(Some), None) }
            })
            .await
    }

    async fn delete(&self, path: String) -> Result<()> {
        self.credentials
            .call(|token| {
                let api = Arc::clone(&self.api);
                let path = path.clone();
                async move { absent_ok(api.delete(&token, &path).await, ()) }
            })
            .await
    }

    /// Every file in the folder, following the pagination cursor.
    async fn all_files(&self) -> Result<Vec<HostEntry>> {
        let mut page = self
            .credentials
            .call(|token| {
                let api = Arc::clone(&self.api);
                let folder = self.folder.clone();
                async move { absent_ok(api.list_folder(&token, &folder).await, FolderPage::default()) }
            })
            .await?;

        let mut files = std::mem::take(&mut page.entries);
        while page.has_more {
            let cursor = page.cursor.clone();
            page = self
                .credentials
                .call(|token| {
                    let api = Arc::clone(&self.api);
                    let cursor = cursor.clone();
                    async move { api.list_folder_continue(&token, &cursor).await }
                })
                .await?;
            files.append(&mut page.entries);
        }

        Ok(files)
    }
}

#[async_trait::async_trait]
impl Backend for TokenHostBackend {
    fn name(&self) -> &'static str {
        "token-host"
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let body = codec::encode_compressed(value)?;
        let path = self.file_path(&format!("{key}{COMPRESSED_EXT}"));
        self.credentials
            .call(|token| {
                let api = Arc::clone(&self.api);
                let path = path.clone();
                let body = body.clone();
                async move { api.upload(&token, &path, body).await }
            })
            .await?;
        tracing::info!("Saved to Dropbox: {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let compressed = self.file_path(&format!("{key}{COMPRESSED_EXT}"));
        if let Some(data) = self.download(compressed).await? {
            tracing::info!("Loaded from Dropbox: {}", key);
            return codec::decode_compressed(&data).map(Some);
        }

        match self.download(self.file_path(&format!("{key}{PLAIN_EXT}"))).await? {
            Some(data) => {
                tracing::info!("Loaded legacy uncompressed file from Dropbox: {}", key);
                codec::decode_plain(&data).map(Some)
            }
            None => {
                tracing::info!("Key not found in Dropbox: {}", key);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.delete(self.file_path(&format!("{key}{COMPRESSED_EXT}")))
            .await?;
        self.delete(self.file_path(&format!("{key}{PLAIN_EXT}"))).await?;
        tracing::info!("Removed from Dropbox: {}", key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let keys: BTreeSet<String> = self
            .all_files()
            .await?
            .iter()
            .filter_map(|entry| codec::key_from_name(&entry.name).map(str::to_string))
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn size(&self) -> Result<SizeInfo> {
        let entries = self
            .all_files()
            .await?
            .into_iter()
            .filter(|entry| codec::key_from_name(&entry.name).is_some())
            .map(|entry| FileSize {
                name: entry.name,
                bytes: entry.size,
            })
            .collect();
        Ok(SizeInfo::from_entries(entries))
    }
}
