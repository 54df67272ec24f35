//! Operational constants and service configuration.
//!
//! Every tunable the service exposes lives here as a named constant so the
//! server binary, the library internals and the tests agree on defaults.

use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// HTTP timeouts
// =============================================================================

/// Server-side read timeout for incoming requests.
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side write timeout for responses.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(90);

/// Idle keep-alive timeout for connections.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-request handler timeout, enforced by the timeout middleware.
pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Render queue
// =============================================================================

/// Default number of render workers (one OS thread each).
pub const DEFAULT_WORKERS: usize = 3;

/// Intake buffer slots per worker. A full buffer fails submissions fast so
/// the handler can answer 503 instead of compounding latency.
pub const QUEUE_DEPTH_PER_WORKER: usize = 4;

// =============================================================================
// Rendition cache
// =============================================================================

/// Maximum number of cached renditions.
pub const RENDITION_CACHE_CAPACITY: usize = 75_000;

/// Time a cached rendition stays servable after insertion.
pub const RENDITION_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

// =============================================================================
// Parameter bounds
// =============================================================================

/// Upper bound for requested width and height.
pub const MAX_DIMENSION: u32 = 5000;

/// Inclusive blur amount range and the default used for a bare `?blur` flag.
pub const MIN_BLUR: u8 = 1;
pub const MAX_BLUR: u8 = 10;
pub const DEFAULT_BLUR: u8 = 5;

/// Settings the server binary resolves from flags and `IMAGE_*` environment
/// variables before wiring the service together.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Listen address: `host:port` for TCP, a filesystem path for a Unix socket.
    pub listen: String,
    /// TCP listen address for the metrics and health endpoints.
    pub metrics_listen: String,
    /// Root directory of the source image storage.
    pub storage_path: PathBuf,
    /// Shared secret for request signature verification.
    pub hmac_key: String,
    /// Render worker count.
    pub workers: usize,
}
