//! Storage backend abstraction.
//!
//! Every backend stores one JSON document per key and honours the same
//! contract:
//! - `get` on a missing key is `Ok(None)`, never an error
//! - `remove` on a missing key succeeds
//! - `set` overwrites in place (last writer wins)
//!
//! Implementations:
//! - [`LocalBackend`] - one `<key>.json` file per record in a directory
//! - [`ObjectStoreBackend`] - gzip objects in an S3-compatible bucket
//! - [`TokenHostBackend`] - gzip files in a Dropbox folder, OAuth bearer auth

mod local;
pub mod object_store;
pub mod token_host;

pub use local::LocalBackend;
pub use object_store::{ObjectClient, ObjectEntry, ObjectStoreBackend};
pub use token_host::{HostApi, TokenHostBackend};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Maximum number of entries reported by [`SizeInfo::from_entries`].
pub const SIZE_REPORT_LIMIT: usize = 20;

/// Size of a single stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSize {
    /// Stored file or object name (e.g. `item1.json`)
    pub name: String,
    pub bytes: u64,
}

/// Storage usage summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub total_bytes: u64,
    /// Number of stored records, including those not listed in `files`
    pub file_count: usize,
    /// Largest records first, at most [`SIZE_REPORT_LIMIT`]
    pub files: Vec<FileSize>,
}

impl SizeInfo {
    pub fn from_entries(mut entries: Vec<FileSize>) -> Self {
        let total_bytes = entries.iter().map(|e| e.bytes).sum();
        let file_count = entries.len();
        entries.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.name.cmp(&b.name)));
        entries.truncate(SIZE_REPORT_LIMIT);
        Self {
            total_bytes,
            file_count,
            files: entries,
        }
    }
}

/// Uniform key-value contract over a physical storage medium.
///
/// Keys passed in have already been validated by the façade.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Load the value stored under `key`, or `None` if there is none.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Delete the value stored under `key`. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All stored keys, sorted and without duplicates.
    async fn list(&self) -> Result<Vec<String>>;

    /// Storage usage summary.
    async fn size(&self) -> Result<SizeInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, bytes: u64) -> FileSize {
        FileSize {
            name: name.to_string(),
            bytes,
        }
    }

    #[test]
    fn test_size_info_sorts_largest_first() {
        let info = SizeInfo::from_entries(vec![entry("a.json", 10), entry("b.json", 30), entry("c.json", 20)]);

        assert_eq!(info.total_bytes, 60);
        assert_eq!(info.file_count, 3);
        let names: Vec<_> = info.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b.json", "c.json", "a.json"]);
    }

    #[test]
    fn test_size_info_caps_entries_but_not_totals() {
        let entries = (0..25).map(|i| entry(&format!("k{i}.json"), i + 1)).collect();
        let info = SizeInfo::from_entries(entries);

        assert_eq!(info.files.len(), SIZE_REPORT_LIMIT);
        assert_eq!(info.file_count, 25);
        assert_eq!(info.total_bytes, (1..=25).sum::<u64>());
        assert_eq!(info.files[0].bytes, 25);
    }
}
