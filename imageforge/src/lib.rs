//! Imageforge - dynamic image rendition service.
//!
//! An HTTP service that produces resized, optionally blurred or grayscaled,
//! JPEG or WebP renditions of source images. Requests are authenticated with
//! a shared-secret HMAC signature from the public front-end.
//!
//! # Architecture
//!
//! ```text
//! request ──► middleware ──► signature ──► params ──► fingerprint
//!                                                         │
//!                       ┌─────────────────────────────────┘
//!                       ▼
//!               RequestCoalescer ──► RenditionCache (LRU + TTL)
//!                       │ miss
//!                       ▼
//!               QueuedProcessor ──► SourceCache ──► FileStorage
//!                       │
//!                       ▼
//!                  WorkQueue ──► render workers (pinned OS threads)
//! ```
//!
//! The expensive part of every request is the render; everything above the
//! queue exists to do as few renders as possible (caching, coalescing) and
//! to fail fast when the workers are saturated (bounded intake, 503).

pub mod api;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod params;
pub mod processor;
pub mod queue;
pub mod signer;
pub mod storage;
pub mod trace;

/// Version of the imageforge library and server.
///
/// Synchronized across the workspace; defined in `Cargo.toml` and injected
/// at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
