//! Source-bytes cache in front of blob storage.
//!
//! Every rendition of an image starts from the same source bytes, so a
//! rendition burst for one id would otherwise hit storage once per unique
//! parameter set. This cache keeps source bytes resident after the first
//! fetch. It is unbounded: the source corpus is fixed and small next to the
//! rendition cache's budget.

use std::sync::Arc;

use dashmap::DashMap;

use crate::storage::{Storage, StorageError};

/// In-memory byte cache keyed by image id, falling back to storage on miss.
pub struct SourceCache<S> {
    storage: Arc<S>,
    entries: DashMap<String, Arc<Vec<u8>>>,
}

impl<S: Storage> SourceCache<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
        }
    }

    /// Returns the source bytes for an id, fetching from storage on miss.
    ///
    /// A fetch failure is not cached; the next request retries storage.
    pub async fn get(&self, id: &str) -> Result<Arc<Vec<u8>>, StorageError> {
        if let Some(entry) = self.entries.get(id) {
            return Ok(Arc::clone(&entry));
        }

        let bytes = Arc::new(self.storage.get(id).await?);
        self.entries.insert(id.to_string(), Arc::clone(&bytes));
        Ok(bytes)
    }

    /// Stores source bytes directly, replacing any cached value.
    pub fn set(&self, id: &str, bytes: Vec<u8>) {
        self.entries.insert(id.to_string(), Arc::new(bytes));
    }

    /// Releases all cached bytes.
    pub fn shutdown(&self) {
        self.entries.clear();
    }

    /// Number of cached source images.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
