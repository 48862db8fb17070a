//! Access-token lifecycle for the token-host backend.
//!
//! The host's API reports failures as HTTP statuses plus loosely structured
//! error strings (`expired_access_token/...`, `too_many_requests/...`).
//! [`classify`] maps those onto [`ErrorClass`] in one place; everything else
//! in this module acts on the class, never on the raw message.
//!
//! An access token is only considered expired when the host says so
//! explicitly. Rate limits, upstream 5xx responses and dropped connections
//! are transient and retried, and never trigger a refresh.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use crate::backend::token_host::{HostApi, HostError};
use crate::config::{ConfigStore, StorageConfig};
use crate::error::{Result, StorageError};

pub const EXPIRED_TOKEN_REMEDIATION: &str = "Your Dropbox access token has expired (this is normal for short-lived tokens).\n\n\
To fix, either:\n\
1. Go to https://www.dropbox.com/developers/apps, select your app -> Settings -> OAuth 2, \
click \"Generate\" under \"Generated access token\", and update the token in your storage settings \
(no restart needed), or\n\
2. Configure a refresh token together with the app key and app secret so the token is renewed automatically.";

pub const MISSING_SCOPE_REMEDIATION: &str = "Dropbox permission error: your app needs the 'files.content.write' scope. \
Go to https://www.dropbox.com/developers/apps, select your app, open the 'Permissions' tab, \
enable 'files.content.write', and then regenerate your access token.";

/// What a host failure means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The host explicitly reported the access token as expired.
    Expired,
    /// Rate limiting, upstream 5xx, or a transport failure.
    Transient,
    /// The app is missing a scope.
    Permission,
    /// Path or object does not exist.
    NotFound,
    /// Token is malformed or revoked (not expired).
    InvalidToken,
    Other,
}

/// Classify a host error.
///
/// This is a best-effort heuristic over the host's untyped error strings. A
/// message that merely contains "expired" is not treated as token expiry
/// unless it comes with a 401 and also talks about a token.
pub fn classify(error: &HostError) -> ErrorClass {
    let summary = error.summary.to_ascii_lowercase();

    let expired = summary.contains("expired_access_token")
        || (error.status == Some(401) && summary.contains("expired") && summary.contains("token"));
    if expired {
        return ErrorClass::Expired;
    }

    let transient = match error.status {
        None => true,
        Some(status) => status == 429 || (500..=599).contains(&status),
    } || summary.contains("rate_limit")
        || summary.contains("too_many_requests");
    if transient {
        return ErrorClass::Transient;
    }

    if summary.contains("missing_scope")
        || summary.contains("required scope")
        || summary.contains("files.content.write")
    {
        return ErrorClass::Permission;
    }

    if summary.contains("not_found") {
        return ErrorClass::NotFound;
    }

    if summary.contains("invalid_access_token") || error.status == Some(401) {
        return ErrorClass::InvalidToken;
    }

    ErrorClass::Other
}

/// Retry and timeout knobs for talking to the host.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts for the identity check, including the first.
    pub max_attempts: u32,
    /// Fixed pause between transient failures.
    pub backoff: Duration,
    /// Upper bound for a single identity check.
    pub probe_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Access token plus what's needed to renew it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("app_key", &self.app_key)
            .finish()
    }
}

impl Credential {
    /// Extract the token-host credential from a configuration.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let access_token = config.access_token().ok_or_else(|| {
            StorageError::Config("Dropbox access token is required for token-host mode".into())
        })?;

        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Ok(Self {
            access_token: access_token.to_string(),
            refresh_token: non_empty(&config.refresh_token),
            app_key: non_empty(&config.app_key),
            app_secret: non_empty(&config.app_secret),
        })
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.app_key.is_some() && self.app_secret.is_some()
    }

    /// Short-lived tokens issued from the app console start with `sl.`.
    pub fn is_short_lived(&self) -> bool {
        self.access_token.starts_with("sl.")
    }
}

/// Holds the live credential, validates it, and renews it on expiry.
pub struct CredentialManager {
    api: Arc<dyn HostApi>,
    credential: RwLock<Credential>,
    /// Where rotated tokens are persisted; `None` for dry runs.
    store: Option<Arc<ConfigStore>>,
    policy: RetryPolicy,
    refresh_lock: Mutex<()>,
}

impl CredentialManager {
    pub fn new(
        api: Arc<dyn HostApi>,
        credential: Credential,
        store: Option<Arc<ConfigStore>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            api,
            credential: RwLock::new(credential),
            store,
            policy,
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn credential(&self) -> Credential {
        self.credential.read().await.clone()
    }

    async fn access_token(&self) -> String {
        self.credential.read().await.access_token.clone()
    }

    /// Confirm the access token works by asking the host who we are.
    ///
    /// Transient failures are retried with a fixed backoff up to
    /// `max_attempts`. A confirmed-expired token is refreshed once when a
    /// refresh token is configured; otherwise it fails immediately.
    /// Returns the account name reported by the host.
    pub async fn validate(&self) -> Result<String> {
        if self.credential.read().await.is_short_lived() {
            tracing::info!(
                "Using a short-lived Dropbox token; it expires after a few hours unless a refresh token is configured"
            );
        }

        let mut attempt = 0;
        let mut refreshed = false;
        loop {
            attempt += 1;
            let token = self.access_token().await;
            let result = tokio::time::timeout(self.policy.probe_timeout, self.api.current_account(&token))
                .await
                .unwrap_or_else(|_| Err(HostError::transport("identity check timed out")));

            let error = match result {
                Ok(account) => return Ok(account),
                Err(error) => error,
            };

            let can_refresh = !refreshed && self.can_refresh().await;
            match classify(&error) {
                ErrorClass::Expired if can_refresh => {
                    tracing::warn!("Dropbox access token expired, refreshing before validation");
                    self.refresh(&token).await?;
                    refreshed = true;
                }
                ErrorClass::Transient if attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        "Dropbox identity check failed (attempt {}/{}), retrying: {}",
                        attempt,
                        self.policy.max_attempts,
                        error
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                }
                _ => return Err(self.describe(error).await),
            }
        }
    }

    /// Run a host operation with the current token.
    ///
    /// If the host reports the token as expired and a refresh token is
    /// configured, the token is renewed and the operation retried exactly
    /// once. Any other failure is returned as a [`StorageError`] carrying
    /// remediation text where there is some.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = std::result::Result<T, HostError>> + Send,
        T: Send,
    {
        let token = self.access_token().await;
        let error = match op(token.clone()).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if classify(&error) == ErrorClass::Expired && self.can_refresh().await {
            tracing::warn!("Dropbox access token expired, refreshing and retrying once");
            self.refresh(&token).await?;
            let token = self.access_token().await;
            return match op(token).await {
                Ok(value) => Ok(value),
                Err(error) => Err(self.describe(error).await),
            };
        }

        Err(self.describe(error).await)
    }

    async fn can_refresh(&self) -> bool {
        self.credential.read().await.can_refresh()
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `stale_token` is the token that was rejected; if another task has
    /// already replaced it, nothing is done.
    async fn refresh(&self, stale_token: &str) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.credential().await;
        if current.access_token != stale_token {
            return Ok(());
        }

        let (Some(refresh_token), Some(app_key), Some(app_secret)) = (
            current.refresh_token.as_deref(),
            current.app_key.as_deref(),
            current.app_secret.as_deref(),
        ) else {
            return Err(StorageError::AuthExpired(EXPIRED_TOKEN_REMEDIATION.to_string()));
        };

        let grant = self
            .api
            .refresh_token(app_key, app_secret, refresh_token)
            .await
            .map_err(|e| {
                tracing::error!("Dropbox token refresh failed: {}", e);
                StorageError::AuthExpired(format!(
                    "Refreshing the Dropbox access token failed: {e}\n\n{EXPIRED_TOKEN_REMEDIATION}"
                ))
            })?;

        {
            let mut credential = self.credential.write().await;
            credential.access_token = grant.access_token.clone();
            if let Some(rotated) = &grant.refresh_token {
                credential.refresh_token = Some(rotated.clone());
            }
        }
        match grant.expires_in {
            Some(seconds) => tracing::info!("Refreshed Dropbox access token (expires in {}s)", seconds),
            None => tracing::info!("Refreshed Dropbox access token"),
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.record_tokens(
                stale_token,
                &grant.access_token,
                grant.refresh_token.as_deref(),
            ) {
                tracing::error!("Failed to persist refreshed Dropbox token: {}", e);
            }
        }

        Ok(())
    }

    /// Turn a host error into a caller-facing storage error.
    async fn describe(&self, error: HostError) -> StorageError {
        match classify(&error) {
            ErrorClass::Expired => {
                tracing::error!("Dropbox access token has expired");
                StorageError::AuthExpired(EXPIRED_TOKEN_REMEDIATION.to_string())
            }
            ErrorClass::Transient => StorageError::AuthTransient(format!(
                "Dropbox is temporarily unavailable (may be temporary): {error}"
            )),
            ErrorClass::Permission => {
                StorageError::Permission(MISSING_SCOPE_REMEDIATION.to_string())
            }
            ErrorClass::InvalidToken => StorageError::backend(
                "Dropbox",
                format!("Invalid Dropbox access token. Please check your token and try again. ({error})"),
            ),
            ErrorClass::NotFound | ErrorClass::Other => {
                StorageError::backend("Dropbox", error.to_string())
            }
        }
    }
}
