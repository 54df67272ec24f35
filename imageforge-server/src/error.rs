//! Server error handling.
//!
//! Startup failures are the only errors that abort the process; everything
//! request-scoped is handled inside the library. Each variant carries enough
//! context for an operator to fix the configuration.

use std::process;

use thiserror::Error;

use imageforge::signer::SignerError;
use imageforge::storage::StorageError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to initialize logging: {0}")]
    Logging(String),
    #[error("failed to initialize storage: {0}")]
    Storage(#[from] StorageError),
    #[error("invalid hmac key: {0}")]
    Signer(#[from] SignerError),
    #[error("failed to bind {listen}: {source}")]
    Bind {
        listen: String,
        source: std::io::Error,
    },
    #[error("http server error: {0}")]
    Serve(std::io::Error),
}

impl ServerError {
    /// Exits with an operator-friendly message and a nonzero code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {self}");

        match self {
            ServerError::Storage(_) => {
                eprintln!();
                eprintln!("Check that --storage-path (IMAGE_STORAGE_PATH) points at a");
                eprintln!("directory containing the source images as {{id}}.jpg files.");
            }
            ServerError::Signer(_) => {
                eprintln!();
                eprintln!("Set --hmac-key (IMAGE_HMAC_KEY) to the shared secret used by");
                eprintln!("the public API front-end.");
            }
            _ => {}
        }

        process::exit(1)
    }
}
