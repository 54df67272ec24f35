//! In-memory caches.
//!
//! Two caches with very different shapes:
//!
//! - [`RenditionCache`]: bounded, expiring cache of encoded output images,
//!   keyed by request fingerprint. The hot path of the whole service.
//! - [`SourceCache`]: unbounded cache of source image bytes in front of blob
//!   storage. The source corpus is fixed and small relative to renditions.

mod renditions;
mod source;

pub use renditions::RenditionCache;
pub use source::SourceCache;
