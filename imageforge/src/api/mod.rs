//! HTTP API composition.
//!
//! [`Api`] owns every request-path collaborator (processor, coalescer,
//! signer, metrics, tracer) and produces the routed, middleware-wrapped
//! service. It is generic over the processor the same way the pipeline is
//! generic over its stages, so tests can drop in a scripted processor.

mod error;
mod handler;
pub mod middleware;

pub use error::ApiError;

use std::sync::Arc;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::get;
use axum::Router;

use crate::coalesce::RequestCoalescer;
use crate::metrics::Metrics;
use crate::processor::ImageProcessor;
use crate::signer::Signer;
use crate::trace::Tracer;

/// The image API: routing state plus middleware assembly.
pub struct Api<P> {
    pub(crate) processor: Arc<P>,
    pub(crate) coalescer: Arc<RequestCoalescer>,
    pub(crate) signer: Signer,
    pub(crate) metrics: Arc<Metrics>,
    tracer: Tracer,
}

impl<P: ImageProcessor> Api<P> {
    /// Wires the API together and registers the cache-size gauge.
    pub fn new(processor: Arc<P>, signer: Signer, metrics: Arc<Metrics>) -> Arc<Self> {
        let coalescer = Arc::new(RequestCoalescer::new(Arc::clone(&metrics)));
        let gauge_source = Arc::clone(&coalescer);
        metrics.set_cache_size_source(move || gauge_source.cached_renditions() as u64);

        Arc::new(Self {
            processor,
            coalescer,
            signer,
            metrics,
            tracer: Tracer::new(),
        })
    }

    /// Builds the complete service.
    ///
    /// Middleware runs outermost-first: tracer, request log, timeout, panic
    /// recovery, CORS, then the router. Request counting is attached to the
    /// routes so it sees the matched template.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(
                "/id/{id}/{width}/{height_ext}",
                get(handler::serve_image::<P>),
            )
            .route_layer(from_fn_with_state(
                Arc::clone(&self.metrics),
                middleware::count_requests,
            ))
            .fallback(handler::not_found)
            .with_state(Arc::clone(self))
            .layer(middleware::cors())
            .layer(from_fn(middleware::recover_panics))
            .layer(from_fn(middleware::timeout_requests))
            .layer(from_fn(middleware::log_requests))
            .layer(from_fn_with_state(self.tracer, middleware::trace_requests))
    }
}
