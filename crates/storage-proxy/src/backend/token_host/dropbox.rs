//! Dropbox HTTP API client.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;

use super::{FolderPage, HostApi, HostEntry, HostError, TokenGrant};
use crate::error::{Result, StorageError};

const API_BASE: &str = "https://api.dropboxapi.com";
const CONTENT_BASE: &str = "https://content.dropboxapi.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// [`HostApi`] implementation for the Dropbox v2 API.
pub struct DropboxApi {
    http: reqwest::Client,
    api_base: String,
    content_base: String,
}

impl DropboxApi {
    pub fn new() -> Result<Self> {
        Self::with_base_urls(API_BASE, CONTENT_BASE)
    }

    /// Point the client at different hosts (proxies, test servers).
    pub fn with_base_urls(api_base: &str, content_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StorageError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            content_base: content_base.trim_end_matches('/').to_string(),
        })
    }

    fn api_url(&self, route: &str) -> String {
        format!("{}/2/{}", self.api_base, route)
    }

    fn content_url(&self, route: &str) -> String {
        format!("{}/2/{}", self.content_base, route)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> std::result::Result<reqwest::Response, HostError> {
        let response = request
            .send()
            .await
            .map_err(|e| HostError::transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(HostError::http(status.as_u16(), error_summary(&body)))
    }

    async fn rpc(&self, route: &str, token: &str, arg: serde_json::Value) -> std::result::Result<reqwest::Response, HostError> {
        self.send(self.http.post(self.api_url(route)).bearer_auth(token).json(&arg))
            .await
    }
}

/// Pull the most specific message out of an error body.
///
/// API errors carry `error_summary` (`path/not_found/..`); OAuth errors carry
/// `error` and `error_description`; anything else is passed through.
fn error_summary(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error_summary: Option<String>,
        error: Option<serde_json::Value>,
        error_description: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error_summary: Some(summary),
            ..
        }) => summary,
        Ok(ErrorBody {
            error: Some(serde_json::Value::String(error)),
            error_description,
            ..
        }) => match error_description {
            Some(description) => format!("{error}: {description}"),
            None => error,
        },
        _ => body.trim().to_string(),
    }
}

/// Dropbox addresses its root folder as the empty string.
fn folder_arg(path: &str) -> &str {
    if path == "/" { "" } else { path }
}

#[derive(Deserialize)]
struct AccountResponse {
    email: Option<String>,
    name: Option<AccountName>,
}

#[derive(Deserialize)]
struct AccountName {
    display_name: String,
}

#[derive(Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum Metadata {
    File { name: String, size: u64 },
    Folder {},
    Deleted {},
}

#[derive(Deserialize)]
struct ListFolderResponse {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

impl From<ListFolderResponse> for FolderPage {
    fn from(response: ListFolderResponse) -> Self {
        let entries = response
            .entries
            .into_iter()
            .filter_map(|entry| match entry {
                Metadata::File { name, size } => Some(HostEntry { name, size }),
                Metadata::Folder {} | Metadata::Deleted {} => None,
            })
            .collect();
        FolderPage {
            entries,
            cursor: response.cursor,
            has_more: response.has_more,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

fn malformed(context: &str, e: reqwest::Error) -> HostError {
    HostError::transport(format!("Malformed {context} response: {e}"))
}

#[async_trait::async_trait]
impl HostApi for DropboxApi {
    async fn current_account(&self, token: &str) -> std::result::Result<String, HostError> {
        let response = self
            .send(
                self.http
                    .post(self.api_url("users/get_current_account"))
                    .bearer_auth(token),
            )
            .await?;

        let account: AccountResponse = response
            .json()
            .await
            .map_err(|e| malformed("account", e))?;
        Ok(account
            .email
            .or_else(|| account.name.map(|n| n.display_name))
            .unwrap_or_default())
    }

    async fn upload(&self, token: &str, path: &str, body: Vec<u8>) -> std::result::Result<(), HostError> {
        let arg = json!({"path": path, "mode": "overwrite", "mute": true});
        self.send(
            self.http
                .post(self.content_url("files/upload"))
                .bearer_auth(token)
                .header(API_ARG_HEADER, arg.to_string())
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(body),
        )
        .await?;
        Ok(())
    }

    async fn download(&self, token: &str, path: &str) -> std::result::Result<Vec<u8>, HostError> {
        let arg = json!({"path": path});
        let response = self
            .send(
                self.http
                    .post(self.content_url("files/download"))
                    .bearer_auth(token)
                    .header(API_ARG_HEADER, arg.to_string()),
            )
            .await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| HostError::transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, token: &str, path: &str) -> std::result::Result<(), HostError> {
        self.rpc("files/delete_v2", token, json!({"path": path}))
            .await?;
        Ok(())
    }

    async fn list_folder(&self, token: &str, path: &str) -> std::result::Result<FolderPage, HostError> {
        let response = self
            .rpc("files/list_folder", token, json!({"path": folder_arg(path)}))
            .await?;
        let listing: ListFolderResponse = response
            .json()
            .await
            .map_err(|e| malformed("list_folder", e))?;
        Ok(listing.into())
    }

    async fn list_folder_continue(&self, token: &str, cursor: &str) -> std::result::Result<FolderPage, HostError> {
        let response = self
            .rpc("files/list_folder/continue", token, json!({"cursor": cursor}))
            .await?;
        let listing: ListFolderResponse = response
            .json()
            .await
            .map_err(|e| malformed("list_folder/continue", e))?;
        Ok(listing.into())
    }

    async fn refresh_token(
        &self,
        app_key: &str,
        app_secret: &str,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, HostError> {
        let response = self
            .send(
                self.http
                    .post(format!("{}/oauth2/token", self.api_base))
                    .basic_auth(app_key, Some(app_secret))
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ]),
            )
            .await?;

        let token: TokenResponse = response.json().await.map_err(|e| malformed("token", e))?;
        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_in: token.expires_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::{Json, Router};

    use super::*;
    use crate::credentials::{classify, ErrorClass};

    #[derive(Debug, Clone)]
    struct SeenRequest {
        path: String,
        authorization: Option<String>,
        api_arg: Option<String>,
        body: Vec<u8>,
    }

    type Seen = Arc<Mutex<Vec<SeenRequest>>>;

    /// Answers like Dropbox does for the handful of routes the client uses.
    async fn respond(State(seen): State<Seen>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let api_arg = header(API_ARG_HEADER);
        seen.lock().unwrap().push(SeenRequest {
            path: uri.path().to_string(),
            authorization: header("authorization"),
            api_arg: api_arg.clone(),
            body: body.to_vec(),
        });

        let missing = api_arg.is_some_and(|arg| arg.contains("missing"));
        match uri.path() {
            "/oauth2/token" => Json(json!({
                "access_token": "sl.new",
                "token_type": "bearer",
                "expires_in": 14400
            }))
            .into_response(),
            "/2/users/get_current_account" => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error_summary": "expired_access_token/..", "error": {".tag": "expired_access_token"}})),
            )
                .into_response(),
            "/2/files/download" if missing => (
                StatusCode::CONFLICT,
                Json(json!({"error_summary": "path/not_found/..", "error": {".tag": "path"}})),
            )
                .into_response(),
            "/2/files/download" => b"stored bytes".to_vec().into_response(),
            "/2/files/upload" => Json(json!({"name": "item1.json.gz", "size": 3})).into_response(),
            "/2/files/list_folder" => Json(json!({"entries": [], "cursor": "c", "has_more": false})).into_response(),
            "/2/files/list_folder/continue" => (
                StatusCode::TOO_MANY_REQUESTS,
                "too_many_requests/..",
            )
                .into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn serve_fake() -> (DropboxApi, Seen) {
        let seen = Seen::default();
        let app = Router::new().fallback(respond).with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (DropboxApi::with_base_urls(&base, &base).unwrap(), seen)
    }

    fn last(seen: &Seen) -> SeenRequest {
        seen.lock().unwrap().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_refresh_sends_app_credentials_and_form() {
        let (api, seen) = serve_fake().await;

        let grant = api.refresh_token("app-key", "app-secret", "refresh-1").await.unwrap();

        assert_eq!(grant.access_token, "sl.new");
        assert_eq!(grant.refresh_token, None);
        assert_eq!(grant.expires_in, Some(14_400));

        let request = last(&seen);
        assert_eq!(request.path, "/oauth2/token");
        // base64("app-key:app-secret")
        assert_eq!(request.authorization.as_deref(), Some("Basic YXBwLWtleTphcHAtc2VjcmV0"));
        let form = String::from_utf8(request.body).unwrap();
        assert!(form.contains("grant_type=refresh_token"), "{form}");
        assert!(form.contains("refresh_token=refresh-1"), "{form}");
    }

    #[tokio::test]
    async fn test_expired_token_response_classifies_as_expired() {
        let (api, seen) = serve_fake().await;

        let err = api.current_account("sl.old").await.unwrap_err();

        assert_eq!(err.status, Some(401));
        assert_eq!(err.summary, "expired_access_token/..");
        assert_eq!(classify(&err), ErrorClass::Expired);
        assert_eq!(last(&seen).authorization.as_deref(), Some("Bearer sl.old"));
    }

    #[tokio::test]
    async fn test_download_maps_missing_path_to_not_found() {
        let (api, seen) = serve_fake().await;

        let err = api.download("tok", "/Test/missing.json.gz").await.unwrap_err();
        assert_eq!(err.status, Some(409));
        assert_eq!(classify(&err), ErrorClass::NotFound);
        let arg: serde_json::Value = serde_json::from_str(&last(&seen).api_arg.unwrap()).unwrap();
        assert_eq!(arg, json!({"path": "/Test/missing.json.gz"}));

        let bytes = api.download("tok", "/Test/item1.json.gz").await.unwrap();
        assert_eq!(bytes, b"stored bytes");
    }

    #[tokio::test]
    async fn test_upload_sends_arg_header_and_body() {
        let (api, seen) = serve_fake().await;

        api.upload("tok", "/Test/item1.json.gz", vec![1, 2, 3]).await.unwrap();

        let request = last(&seen);
        assert_eq!(request.path, "/2/files/upload");
        assert_eq!(request.authorization.as_deref(), Some("Bearer tok"));
        assert_eq!(request.body, vec![1, 2, 3]);
        let arg: serde_json::Value = serde_json::from_str(&request.api_arg.unwrap()).unwrap();
        assert_eq!(arg["path"], "/Test/item1.json.gz");
        assert_eq!(arg["mode"], "overwrite");
    }

    #[tokio::test]
    async fn test_list_root_sends_empty_path() {
        let (api, seen) = serve_fake().await;

        let page = api.list_folder("tok", "/").await.unwrap();
        assert!(page.entries.is_empty());
        assert!(!page.has_more);

        let body: serde_json::Value = serde_json::from_slice(&last(&seen).body).unwrap();
        assert_eq!(body, json!({"path": ""}));
    }

    #[tokio::test]
    async fn test_rate_limit_classifies_as_transient() {
        let (api, _seen) = serve_fake().await;

        let err = api.list_folder_continue("tok", "c").await.unwrap_err();

        assert_eq!(err.status, Some(429));
        assert_eq!(err.summary, "too_many_requests/..");
        assert_eq!(classify(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_error_summary_prefers_api_summary() {
        let body = r#"{"error_summary": "path/not_found/...", "error": {".tag": "path"}}"#;
        assert_eq!(error_summary(body), "path/not_found/...");
    }

    #[test]
    fn test_error_summary_reads_oauth_errors() {
        let body = r#"{"error": "invalid_grant", "error_description": "refresh token is malformed"}"#;
        assert_eq!(error_summary(body), "invalid_grant: refresh token is malformed");
    }

    #[test]
    fn test_error_summary_passes_plain_text_through() {
        assert_eq!(error_summary("Error in call to API function\n"), "Error in call to API function");
    }

    #[test]
    fn test_list_folder_response_keeps_files_only() {
        let body = r#"{
            "entries": [
                {".tag": "file", "name": "item1.json.gz", "size": 120, "id": "id:a"},
                {".tag": "folder", "name": "archive", "id": "id:b"},
                {".tag": "deleted", "name": "gone.json"}
            ],
            "cursor": "c1",
            "has_more": true
        }"#;
        let page: FolderPage = serde_json::from_str::<ListFolderResponse>(body).unwrap().into();

        assert_eq!(
            page.entries,
            vec![HostEntry {
                name: "item1.json.gz".into(),
                size: 120
            }]
        );
        assert_eq!(page.cursor, "c1");
        assert!(page.has_more);
    }

    #[test]
    fn test_root_folder_is_empty_path() {
        assert_eq!(folder_arg("/"), "");
        assert_eq!(folder_arg("/StorageProxy"), "/StorageProxy");
    }
}
