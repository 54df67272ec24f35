//! Blob storage for source images.
//!
//! Source images live in external storage addressed by opaque id. The
//! service only ever reads them; renditions are derived on the fly and never
//! written back.

use std::future::Future;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// No source image exists for the requested id.
    #[error("image not found: {0}")]
    NotFound(String),
    /// The configured storage root is missing or not a directory.
    #[error("storage root is not a directory: {}", .0.display())]
    InvalidRoot(PathBuf),
    #[error("storage i/o: {0}")]
    Io(#[from] io::Error),
}

/// Read access to source image bytes by id.
pub trait Storage: Send + Sync + 'static {
    /// Fetches the source bytes for an image id.
    fn get(&self, id: &str) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;

    /// Cheap reachability probe for the health checker.
    fn health_check(&self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Filesystem-backed storage: one `{id}.jpg` per source image under a root
/// directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens storage rooted at `root`, validating it exists up front so a
    /// misconfigured path fails at startup rather than on the first request.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(StorageError::InvalidRoot(root));
        }
        Ok(Self { root })
    }

    fn source_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.jpg"))
    }
}

impl Storage for FileStorage {
    fn get(&self, id: &str) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send {
        let path = self.source_path(id);
        let id = id.to_string();
        async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(StorageError::NotFound(id))
                }
                Err(e) => Err(StorageError::Io(e)),
            }
        }
    }

    fn health_check(&self) -> impl Future<Output = Result<(), StorageError>> + Send {
        let root = self.root.clone();
        async move {
            match tokio::fs::metadata(&root).await {
                Ok(meta) if meta.is_dir() => Ok(()),
                Ok(_) => Err(StorageError::InvalidRoot(root)),
                Err(e) => Err(StorageError::Io(e)),
            }
        }
    }
}
