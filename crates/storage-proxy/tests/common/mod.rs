//! Shared fakes for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storage_proxy::backend::object_store::InMemoryObjectClient;
use storage_proxy::backend::token_host::{FolderPage, HostApi, HostEntry, HostError, TokenGrant};
use storage_proxy::backend::ObjectClient;
use storage_proxy::facade::Connector;
use storage_proxy::{ConfigStore, RetryPolicy, StorageConfig};
use tempfile::TempDir;

/// Retry policy without sleeping between attempts.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::ZERO,
        probe_timeout: Duration::from_secs(1),
    }
}

pub fn expired() -> HostError {
    HostError::http(401, "expired_access_token/..")
}

pub fn rate_limited() -> HostError {
    HostError::http(429, "too_many_requests/..")
}

pub fn missing_scope() -> HostError {
    HostError::http(401, "missing_scope/... required scope 'files.content.write'")
}

/// Mutable state of [`FakeHost`]; tests script it directly.
#[derive(Default)]
pub struct HostState {
    /// File contents by absolute path
    pub files: BTreeMap<String, Vec<u8>>,
    /// The only access token the host accepts
    pub valid_token: String,
    /// Tokens the host reports as expired (anything else is invalid)
    pub expired_tokens: Vec<String>,
    /// Access token handed out by the next refresh
    pub grant_token: Option<String>,
    /// Rotated refresh token handed out with the grant
    pub rotated_refresh: Option<String>,
    /// Failures returned, in order, before identity checks succeed
    pub account_failures: VecDeque<HostError>,
    /// Failures returned, in order, before uploads succeed
    pub upload_failures: VecDeque<HostError>,
    /// Listing page size; zero means everything in one page
    pub page_size: usize,
    pub account_calls: usize,
    pub upload_calls: usize,
    pub refresh_calls: usize,
}

/// Scriptable in-memory stand-in for the Dropbox API.
#[derive(Default)]
pub struct FakeHost {
    pub state: Mutex<HostState>,
}

impl FakeHost {
    /// A host that accepts `token`.
    pub fn accepting(token: &str) -> Arc<Self> {
        let host = Self::default();
        host.state.lock().unwrap().valid_token = token.to_string();
        Arc::new(host)
    }

    /// A host whose token `stale` has expired and that will issue `fresh`
    /// on refresh.
    pub fn with_expired(stale: &str, fresh: &str) -> Arc<Self> {
        let host = Self::default();
        {
            let mut state = host.state.lock().unwrap();
            state.valid_token = fresh.to_string();
            state.expired_tokens.push(stale.to_string());
            state.grant_token = Some(fresh.to_string());
        }
        Arc::new(host)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn check(state: &HostState, token: &str) -> Result<(), HostError> {
        if token == state.valid_token {
            Ok(())
        } else if state.expired_tokens.iter().any(|t| t == token) {
            Err(expired())
        } else {
            Err(HostError::http(401, "invalid_access_token/.."))
        }
    }

    fn page(state: &HostState, folder: &str, offset: usize) -> FolderPage {
        let prefix = format!("{}/", folder.trim_end_matches('/'));
        let all: Vec<HostEntry> = state
            .files
            .iter()
            .filter_map(|(path, body)| {
                let name = path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| HostEntry {
                    name: name.to_string(),
                    size: body.len() as u64,
                })
            })
            .collect();

        let size = if state.page_size == 0 { all.len() } else { state.page_size };
        let end = (offset + size).min(all.len());
        FolderPage {
            entries: all[offset.min(end)..end].to_vec(),
            cursor: format!("{folder}|{end}"),
            has_more: end < all.len(),
        }
    }
}

#[async_trait::async_trait]
impl HostApi for FakeHost {
    async fn current_account(&self, token: &str) -> Result<String, HostError> {
        let mut state = self.state.lock().unwrap();
        state.account_calls += 1;
        if let Some(failure) = state.account_failures.pop_front() {
            return Err(failure);
        }
        Self::check(&state, token)?;
        Ok("tester@example.com".to_string())
    }

    async fn upload(&self, token: &str, path: &str, body: Vec<u8>) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        state.upload_calls += 1;
        Self::check(&state, token)?;
        if let Some(failure) = state.upload_failures.pop_front() {
            return Err(failure);
        }
        state.files.insert(path.to_string(), body);
        Ok(())
    }

    async fn download(&self, token: &str, path: &str) -> Result<Vec<u8>, HostError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, token)?;
        state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| HostError::http(409, "path/not_found/.."))
    }

    async fn delete(&self, token: &str, path: &str) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, token)?;
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| HostError::http(409, "path_lookup/not_found/.."))
    }

    async fn list_folder(&self, token: &str, path: &str) -> Result<FolderPage, HostError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, token)?;
        Ok(Self::page(&state, path, 0))
    }

    async fn list_folder_continue(&self, token: &str, cursor: &str) -> Result<FolderPage, HostError> {
        let state = self.state.lock().unwrap();
        Self::check(&state, token)?;
        let (folder, offset) = cursor
            .split_once('|')
            .ok_or_else(|| HostError::http(409, "reset/"))?;
        let offset = offset.parse().map_err(|_| HostError::http(409, "reset/"))?;
        Ok(Self::page(&state, folder, offset))
    }

    async fn refresh_token(
        &self,
        _app_key: &str,
        _app_secret: &str,
        _refresh_token: &str,
    ) -> Result<TokenGrant, HostError> {
        let mut state = self.state.lock().unwrap();
        state.refresh_calls += 1;
        let access_token = state
            .grant_token
            .clone()
            .ok_or_else(|| HostError::http(400, "invalid_grant"))?;
        Ok(TokenGrant {
            access_token,
            refresh_token: state.rotated_refresh.clone(),
            expires_in: Some(14_400),
        })
    }
}

/// Connector handing out the same fakes every time.
pub struct FakeConnector {
    pub host: Arc<FakeHost>,
    pub objects: Arc<InMemoryObjectClient>,
}

impl FakeConnector {
    pub fn new(host: Arc<FakeHost>) -> Arc<Self> {
        Arc::new(Self {
            host,
            objects: Arc::new(InMemoryObjectClient::new()),
        })
    }
}

impl Connector for FakeConnector {
    fn object_client(&self, _config: &StorageConfig) -> storage_proxy::Result<Arc<dyn ObjectClient>> {
        Ok(self.objects.clone())
    }

    fn host_api(&self, _config: &StorageConfig) -> storage_proxy::Result<Arc<dyn HostApi>> {
        Ok(self.host.clone())
    }
}

/// A config store in a fresh temp dir, persisted with `config`.
pub fn store_with(dir: &TempDir, config: StorageConfig) -> Arc<ConfigStore> {
    let store = ConfigStore::open_with_env(dir.path().join("storage_config.json"), |_| None).unwrap();
    store.replace(config).unwrap();
    Arc::new(store)
}

/// Token-host configuration pointing at `/Test`.
pub fn token_host_config(token: &str, refreshable: bool) -> StorageConfig {
    let mut config = StorageConfig {
        mode: Some(storage_proxy::StorageMode::TokenHost),
        access_token: Some(token.to_string()),
        remote_folder: Some("/Test".into()),
        ..Default::default()
    };
    if refreshable {
        config.refresh_token = Some("refresh-1".into());
        config.app_key = Some("app-key".into());
        config.app_secret = Some("app-secret".into());
    }
    config
}
