//! Request coalescing over the rendition cache.
//!
//! A popular image going viral produces a thundering herd of identical
//! requests, each of which would occupy a render worker for the same output.
//! This module collapses the herd: for any fingerprint, at most one request
//! (the producer) renders while every concurrent duplicate (the waiters)
//! blocks on a completion signal and reads the producer's result out of the
//! cache:
//!
//! ```text
//! request A ──► cache miss ──► claims fingerprint ──► renders ──► cache.add
//! request B ──► cache miss ──► already claimed ──┐                  │
//! request C ──► cache miss ──► already claimed ──┼── wait ◄─────────┘
//!                                                │    (broadcast)
//!                                                └──► re-read cache ──► 200
//! ```
//!
//! A woken waiter that still misses the cache (the entry expired in the gap,
//! or the producer failed) becomes a producer itself without re-registering
//! in the in-flight map. That retry burst is bounded by the worker queue's
//! intake, and skipping re-registration avoids a livelock where retries keep
//! handing the claim to each other.
//!
//! The in-flight claim is released by an RAII guard, so the entry is removed
//! and waiters are woken on every producer exit: success, error, panic, or
//! the producer's request future being dropped mid-render.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::RenditionCache;
use crate::config::{RENDITION_CACHE_CAPACITY, RENDITION_CACHE_TTL};
use crate::metrics::Metrics;
use crate::processor::ProcessError;

#[derive(Debug, Error)]
pub enum CoalesceError {
    /// The caller's cancellation fired while waiting on the in-flight
    /// producer.
    #[error("cancelled while waiting for in-flight rendition")]
    Cancelled,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// What a registration attempt made of this request.
enum Registration {
    /// First request for the fingerprint; this request renders.
    Producer,
    /// Another request is already rendering; wait for its signal.
    Waiter(broadcast::Receiver<()>),
}

/// Coalesces identical requests onto one rendition computation.
pub struct RequestCoalescer {
    renditions: RenditionCache,
    /// In-flight producers by fingerprint. The sender is the completion
    /// signal; waiters subscribe at registration time.
    in_flight: DashMap<String, broadcast::Sender<()>>,
    metrics: Arc<Metrics>,
}

impl RequestCoalescer {
    /// Creates a coalescer with the production cache bounds.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_cache(
            RenditionCache::new(RENDITION_CACHE_CAPACITY, RENDITION_CACHE_TTL),
            metrics,
        )
    }

    /// Creates a coalescer over a caller-supplied cache. Used by tests to
    /// shrink capacity and TTL.
    pub fn with_cache(renditions: RenditionCache, metrics: Arc<Metrics>) -> Self {
        Self {
            renditions,
            in_flight: DashMap::new(),
            metrics,
        }
    }

    /// Number of cached renditions, the source of the cache-size gauge.
    pub fn cached_renditions(&self) -> usize {
        self.renditions.len()
    }

    /// Number of fingerprints currently being rendered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the rendition for `fingerprint`, rendering it at most once
    /// across all concurrent callers.
    ///
    /// `render` runs only when this request ends up the producer (or a
    /// fall-through retry after a failed producer). `cancel` unblocks the
    /// wait promptly; an in-flight render keeps running for the remaining
    /// waiters.
    pub async fn get_or_render<F, Fut>(
        &self,
        cancel: &CancellationToken,
        fingerprint: &str,
        render: F,
    ) -> Result<Arc<Vec<u8>>, CoalesceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>, ProcessError>>,
    {
        if let Some(bytes) = self.renditions.get(fingerprint) {
            self.metrics.record_cache_hit();
            return Ok(bytes);
        }
        self.metrics.record_cache_miss();

        // Atomic load-or-store: either claim the fingerprint or subscribe to
        // whoever holds it. The map shard lock is released before any await.
        let registration = match self.in_flight.entry(fingerprint.to_string()) {
            Entry::Occupied(entry) => Registration::Waiter(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (done, _) = broadcast::channel(1);
                entry.insert(done);
                Registration::Producer
            }
        };

        let claimed = match registration {
            Registration::Producer => true,
            Registration::Waiter(mut done) => {
                self.metrics.record_request_coalesced();
                debug!(fingerprint, "coalescing onto in-flight rendition");

                tokio::select! {
                    // Both a delivered signal and a dropped sender mean the
                    // producer is gone; the cache decides what happened.
                    _ = done.recv() => {}
                    _ = cancel.cancelled() => return Err(CoalesceError::Cancelled),
                }

                if let Some(bytes) = self.renditions.get(fingerprint) {
                    return Ok(bytes);
                }
                // Missing after wake: TTL race or producer failure. Render
                // ourselves without re-registering.
                debug!(fingerprint, "rendition missing after wait, retrying as producer");
                false
            }
        };

        // Producer path. The guard releases the claim on every exit.
        let claim = claimed.then(|| InflightClaim {
            map: &self.in_flight,
            fingerprint,
        });

        self.metrics.record_request_processed();
        match render().await {
            Ok(bytes) => {
                let bytes = Arc::new(bytes);
                // Insert before waking waiters so their re-read observes it.
                self.renditions
                    .add(fingerprint, Arc::clone(&bytes));
                drop(claim);
                Ok(bytes)
            }
            Err(e) => {
                drop(claim);
                Err(CoalesceError::Process(e))
            }
        }
    }
}

/// Holds the in-flight claim for a fingerprint. Dropping removes the entry
/// and wakes every waiter, in that order.
struct InflightClaim<'a> {
    map: &'a DashMap<String, broadcast::Sender<()>>,
    fingerprint: &'a str,
}

impl Drop for InflightClaim<'_> {
    fn drop(&mut self) {
        if let Some((_, done)) = self.map.remove(self.fingerprint) {
            // No receivers just means nobody coalesced onto us.
            let _ = done.send(());
        }
    }
}
