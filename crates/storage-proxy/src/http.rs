//! HTTP API over the storage façade.
//!
//! All routes speak JSON. Caller mistakes (missing key, bad configuration)
//! are 400s; everything else that fails is a 500 carrying the error message.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::facade::StorageFacade;

/// Error body returned by every route.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        let status = if error.is_caller_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self {
            status,
            error: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    #[serde(default)]
    key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    items: BTreeMap<String, Value>,
}

fn require_key(key: Option<String>) -> Result<String, ApiError> {
    key.filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::bad_request("Key is required"))
}

/// Build the router. CORS is permissive: the proxy is meant to sit next to a
/// browser app on the same machine.
pub fn router(facade: Arc<StorageFacade>) -> Router {
    Router::new()
        .route("/api/storage/set", post(set_item))
        .route("/api/storage/get", post(get_item))
        .route("/api/storage/remove", post(remove_item))
        .route("/api/storage/keys", get(list_keys))
        .route("/api/storage/size", get(size_info))
        .route("/api/storage/sync", post(sync_items))
        .route("/api/storage/config", get(get_config).post(update_config))
        .route("/api/storage/test", post(test_connection))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(facade)
}

async fn set_item(
    State(facade): State<Arc<StorageFacade>>,
    Json(request): Json<SetRequest>,
) -> ApiResult<Value> {
    let key = require_key(request.key)?;
    facade.put(&key, request.value).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Saved {key}"),
    })))
}

async fn get_item(
    State(facade): State<Arc<StorageFacade>>,
    Json(request): Json<KeyRequest>,
) -> ApiResult<Value> {
    let key = require_key(request.key)?;
    let value = facade.get(&key).await?;
    Ok(Json(json!({ "value": value })))
}

async fn remove_item(
    State(facade): State<Arc<StorageFacade>>,
    Json(request): Json<KeyRequest>,
) -> ApiResult<Value> {
    let key = require_key(request.key)?;
    facade.delete(&key).await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_keys(State(facade): State<Arc<StorageFacade>>) -> ApiResult<Value> {
    let keys = facade.list_keys().await?;
    Ok(Json(json!({ "keys": keys })))
}

async fn size_info(State(facade): State<Arc<StorageFacade>>) -> ApiResult<crate::SizeInfo> {
    Ok(Json(facade.size_info().await?))
}

async fn sync_items(
    State(facade): State<Arc<StorageFacade>>,
    Json(request): Json<SyncRequest>,
) -> ApiResult<Value> {
    let report = facade.sync(request.items).await;
    Ok(Json(json!({
        "success": report.failed.is_empty(),
        "synced": report.synced,
        "failed": report.failed,
    })))
}

async fn get_config(State(facade): State<Arc<StorageFacade>>) -> ApiResult<crate::ConfigView> {
    Ok(Json(facade.config_view()))
}

async fn update_config(
    State(facade): State<Arc<StorageFacade>>,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let config = StorageConfig::from_value(body)?;
    let outcome = facade.reconfigure(config).await?;
    Ok(Json(json!({
        "success": true,
        "message": outcome.message,
        "requested_mode": outcome.requested_mode,
        "active_mode": outcome.active_mode,
        "connected": outcome.connected,
    })))
}

async fn test_connection(
    State(facade): State<Arc<StorageFacade>>,
    Json(body): Json<Value>,
) -> Response {
    let result = match StorageConfig::from_value(body) {
        Ok(config) => facade.test_connection(&config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(message) => Json(json!({ "success": true, "message": message })).into_response(),
        Err(e) => {
            tracing::warn!("Connection test failed: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn health(State(facade): State<Arc<StorageFacade>>) -> Json<Value> {
    let status = facade.status().await;
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "storage": status,
    }))
}
