//! storage-proxy library: a key-value store that hides which physical
//! medium (local directory, S3 bucket, or Dropbox folder) holds the data.
//!
//! The binary wraps [`StorageFacade`] in a small HTTP API; integration tests
//! drive the façade and the router directly.

pub mod backend;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod facade;
pub mod http;

pub use backend::{Backend, SizeInfo};
pub use config::{ConfigStore, ConfigView, StorageConfig, StorageMode};
pub use credentials::{CredentialManager, RetryPolicy};
pub use error::{Result, StorageError};
pub use facade::{Connector, ReconfigureOutcome, RemoteConnector, StorageFacade, StorageStatus, SyncReport};
