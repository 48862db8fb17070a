//! S3-compatible object storage backend.
//!
//! Works with AWS S3, MinIO, and other S3-compatible services. Records are
//! stored as `<namespace>/<key>.json.gz`; objects written by older versions
//! as `<namespace>/<key>.json` are still read.
//!
//! No retry is attempted here: a failed request is reported to the caller
//! as-is.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde_json::Value;

use super::{Backend, FileSize, SizeInfo};
use crate::codec::{self, COMPRESSED_EXT, PLAIN_EXT};
use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

/// An object returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full object key, including the namespace prefix
    pub key: String,
    pub size: u64,
}

/// Minimal bucket operations the backend needs.
#[async_trait::async_trait]
pub trait ObjectClient: Send + Sync {
    /// Fetch an object; `None` if it doesn't exist.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, key: &str) -> Result<()>;

    /// All objects whose key starts with `prefix`.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

    /// Cheap request proving the bucket is reachable with these credentials.
    async fn probe(&self, prefix: &str) -> Result<()>;
}

/// Key-value records on top of an [`ObjectClient`].
pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectClient>,
    namespace: String,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectClient>, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.trim_matches('/').to_string(),
        }
    }

    fn prefix(&self) -> String {
        format!("{}/", self.namespace)
    }

    fn object_key(&self, key: &str, ext: &str) -> String {
        format!("{}/{}{}", self.namespace, key, ext)
    }

    /// Objects directly under the namespace, keyed by record name.
    async fn records(&self) -> Result<Vec<(String, ObjectEntry)>> {
        let prefix = self.prefix();
        let objects = self.client.list_objects(&prefix).await?;
        Ok(objects
            .into_iter()
            .filter_map(|obj| {
                let name = obj.key.strip_prefix(&prefix)?;
                if name.contains('/') {
                    return None;
                }
                let key = codec::key_from_name(name)?.to_string();
                Some((key, obj))
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl Backend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object-store"
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let body = codec::encode_compressed(value)?;
        self.client
            .put_object(&self.object_key(key, COMPRESSED_EXT), body, "application/gzip")
            .await?;
        tracing::info!("Saved to object store: {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(data) = self
            .client
            .get_object(&self.object_key(key, COMPRESSED_EXT))
            .await?
        {
            tracing::info!("Loaded from object store: {}", key);
            return codec::decode_compressed(&data).map(Some);
        }

        match self.client.get_object(&self.object_key(key, PLAIN_EXT)).await? {
            Some(data) => {
                tracing::info!("Loaded legacy uncompressed object: {}", key);
                codec::decode_plain(&data).map(Some)
            }
            None => {
                tracing::info!("Key not found in object store: {}", key);
                Ok(None)
            }
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.client
            .delete_object(&self.object_key(key, COMPRESSED_EXT))
            .await?;
        self.client
            .delete_object(&self.object_key(key, PLAIN_EXT))
            .await?;
        tracing::info!("Removed from object store: {}", key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let keys: BTreeSet<String> = self.records().await?.into_iter().map(|(k, _)| k).collect();
        Ok(keys.into_iter().collect())
    }

    async fn size(&self) -> Result<SizeInfo> {
        let prefix = self.prefix();
        let entries = self
            .records()
            .await?
            .into_iter()
            .map(|(_, obj)| FileSize {
                name: obj.key.strip_prefix(&prefix).unwrap_or(&obj.key).to_string(),
                bytes: obj.size,
            })
            .collect();
        Ok(SizeInfo::from_entries(entries))
    }
}

/// [`ObjectClient`] backed by an S3 bucket.
pub struct S3Client {
    bucket: Box<Bucket>,
}

impl S3Client {
    /// Build a client from the object-store fields of `config`.
    ///
    /// Uses the configured key pair when present, otherwise the standard AWS
    /// environment variables.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket_name = config.bucket_name().ok_or_else(|| {
            StorageError::Config("S3 bucket name is required for object-store mode".into())
        })?;

        let region = match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => Region::Custom {
                region: config.region().to_string(),
                endpoint: endpoint.to_string(),
            },
            None => config
                .region()
                .parse()
                .map_err(|e| StorageError::Config(format!("Invalid region: {e}")))?,
        };

        let credentials = match (
            config.aws_access_key_id.as_deref(),
            config.aws_secret_access_key.as_deref(),
        ) {
            (Some(access), Some(secret)) => {
                Credentials::new(Some(access), Some(secret), None, None, None)
            }
            (None, None) => Credentials::from_env(),
            _ => {
                return Err(StorageError::Config(
                    "Both aws_access_key_id and aws_secret_access_key are required".into(),
                ));
            }
        }
        .map_err(|e| StorageError::Config(format!("Failed to load credentials: {e}")))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(format!("Failed to create bucket: {e}")))?;

        // Custom endpoints (MinIO, LocalStack) want path-style URLs
        let bucket = if config.endpoint.as_deref().is_some_and(|e| !e.is_empty()) {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }
}

fn is_not_found(error: &S3Error) -> bool {
    match error {
        S3Error::HttpFailWithBody(status, _) => *status == 404,
        other => {
            let message = other.to_string();
            message.contains("404") || message.contains("NoSuchKey")
        }
    }
}

#[async_trait::async_trait]
impl ObjectClient for S3Client {
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.bucket.get_object(key).await {
            Ok(response) if response.status_code() == 404 => Ok(None),
            Ok(response) if response.status_code() >= 300 => Err(StorageError::backend(
                "S3",
                format!("get {key} returned status {}", response.status_code()),
            )),
            Ok(response) => Ok(Some(response.bytes().to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(StorageError::backend("S3", format!("get {key} failed: {e}"))),
        }
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let response = self
            .bucket
            .put_object_with_content_type(key, &body, content_type)
            .await
            .map_err(|e| StorageError::backend("S3", format!("put {key} failed: {e}")))?;
        if response.status_code() >= 300 {
            return Err(StorageError::backend(
                "S3",
                format!("put {key} returned status {}", response.status_code()),
            ));
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match self.bucket.delete_object(key).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(StorageError::backend("S3", format!("delete {key} failed: {e}"))),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let results = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| StorageError::backend("S3", format!("list failed: {e}")))?;

        Ok(results
            .into_iter()
            .flat_map(|r| r.contents)
            .map(|obj| ObjectEntry {
                key: obj.key,
                size: obj.size,
            })
            .collect())
    }

    async fn probe(&self, prefix: &str) -> Result<()> {
        self.bucket
            .list(prefix.to_string(), Some("/".to_string()))
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Connectivity(format!("S3 bucket is not reachable: {e}")))
    }
}

/// In-memory [`ObjectClient`], for tests and offline use.
#[derive(Default)]
pub struct InMemoryObjectClient {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw bytes under an exact object key.
    pub fn insert_raw(&self, key: &str, body: Vec<u8>) {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), body);
    }

    /// Raw bytes stored under an exact object key.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.raw(key))
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.insert_raw(key, body);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        Ok(self
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, body)| ObjectEntry {
                key: key.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    async fn probe(&self, _prefix: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> (Arc<InMemoryObjectClient>, ObjectStoreBackend) {
        let client = Arc::new(InMemoryObjectClient::new());
        let backend = ObjectStoreBackend::new(client.clone(), "listings");
        (client, backend)
    }

    #[tokio::test]
    async fn test_set_writes_compressed_object() {
        let (client, backend) = backend();

        backend.set("item1", &json!({"title": "Widget"})).await.unwrap();

        let raw = client.raw("listings/item1.json.gz").unwrap();
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
        assert!(client.raw("listings/item1.json").is_none());
    }

    #[tokio::test]
    async fn test_get_reads_compressed_and_legacy_objects() {
        let (client, backend) = backend();
        let value = json!({"title": "Widget", "sold": false});

        backend.set("new", &value).await.unwrap();
        client.insert_raw("listings/old.json", serde_json::to_vec(&value).unwrap());

        assert_eq!(backend.get("new").await.unwrap(), Some(value.clone()));
        assert_eq!(backend.get("old").await.unwrap(), Some(value));
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compressed_object_wins_over_legacy() {
        let (client, backend) = backend();

        client.insert_raw("listings/item.json", br#"{"v": "legacy"}"#.to_vec());
        backend.set("item", &json!({"v": "current"})).await.unwrap();

        assert_eq!(backend.get("item").await.unwrap(), Some(json!({"v": "current"})));
    }

    #[tokio::test]
    async fn test_remove_deletes_both_encodings() {
        let (client, backend) = backend();

        backend.set("item", &json!(1)).await.unwrap();
        client.insert_raw("listings/item.json", b"1".to_vec());

        backend.remove("item").await.unwrap();
        backend.remove("item").await.unwrap();
        assert_eq!(backend.get("item").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_strips_prefix_and_extension() {
        let (client, backend) = backend();

        backend.set("b", &json!(2)).await.unwrap();
        backend.set("a", &json!(1)).await.unwrap();
        client.insert_raw("listings/a.json", b"1".to_vec());
        client.insert_raw("listings/sub/c.json", b"3".to_vec());
        client.insert_raw("other/d.json.gz", b"4".to_vec());

        assert_eq!(backend.list().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_size_uses_object_names() {
        let (_client, backend) = backend();

        backend.set("item1", &json!({"title": "Widget"})).await.unwrap();

        let info = backend.size().await.unwrap();
        assert_eq!(info.file_count, 1);
        assert_eq!(info.files[0].name, "item1.json.gz");
        assert!(info.total_bytes > 0);
    }

    #[test]
    fn test_s3_client_requires_bucket() {
        let result = S3Client::from_config(&StorageConfig::default());
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn test_s3_client_rejects_half_key_pair() {
        let config = StorageConfig {
            bucket_name: Some("bucket".into()),
            aws_access_key_id: Some("AKIA".into()),
            ..Default::default()
        };
        assert!(matches!(
            S3Client::from_config(&config),
            Err(StorageError::Config(_))
        ));
    }

    // Requires MinIO running locally:
    // docker run -p 9000:9000 -e MINIO_ROOT_USER=proxy -e MINIO_ROOT_PASSWORD=proxy123 minio/minio server /data
    #[tokio::test]
    #[ignore]
    async fn test_s3_roundtrip_with_minio() {
        let config = StorageConfig {
            bucket_name: Some("test-bucket".into()),
            endpoint: Some("http://localhost:9000".into()),
            aws_access_key_id: Some("proxy".into()),
            aws_secret_access_key: Some("proxy123".into()),
            ..Default::default()
        };
        let client = Arc::new(S3Client::from_config(&config).unwrap());
        client.probe("test/").await.unwrap();

        let backend = ObjectStoreBackend::new(client, "test");
        backend.set("hello", &json!({"greeting": "hi"})).await.unwrap();
        assert_eq!(
            backend.get("hello").await.unwrap(),
            Some(json!({"greeting": "hi"}))
        );
        assert!(backend.list().await.unwrap().contains(&"hello".to_string()));
        backend.remove("hello").await.unwrap();
        assert_eq!(backend.get("hello").await.unwrap(), None);
    }
}
