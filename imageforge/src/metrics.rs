//! Service metrics.
//!
//! Counters are plain atomics bumped from the hot path; nothing here blocks
//! or allocates per event. A snapshot of every variable is published as JSON
//! on the metrics listener under `/debug/vars`, alongside `/health`:
//!
//! ```text
//! handlers ──► Metrics (AtomicU64 / gauge callback)
//!                  │
//!                  ▼ snapshot()
//!          GET /debug/vars ──► {"counter_imageapi_cache_hits": 42, ...}
//! ```
//!
//! Metric names are fixed and shared with dashboards; do not rename them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::health::HealthHandle;

type GaugeFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Fixed-name counter and gauge registry.
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    requests_coalesced: AtomicU64,
    requests_processed: AtomicU64,
    queue_full_errors: AtomicU64,
    /// Request counts by matched route template.
    route_requests: DashMap<String, AtomicU64>,
    /// Late-bound source for the cache-size gauge; registered once the
    /// rendition cache exists.
    cache_size: Mutex<Option<GaugeFn>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            requests_coalesced: AtomicU64::new(0),
            requests_processed: AtomicU64::new(0),
            queue_full_errors: AtomicU64::new(0),
            route_requests: DashMap::new(),
            cache_size: Mutex::new(None),
        })
    }

    /// Registers the callback backing `gauge_imageapi_cache_size`.
    pub fn set_cache_size_source(&self, source: impl Fn() -> u64 + Send + Sync + 'static) {
        *self.cache_size.lock().unwrap() = Some(Box::new(source));
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_coalesced(&self) {
        self.requests_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_processed(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full_error(&self) {
        self.queue_full_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request against its matched route template.
    pub fn record_request(&self, route: &str) {
        self.route_requests
            .entry(route.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn requests_coalesced(&self) -> u64 {
        self.requests_coalesced.load(Ordering::Relaxed)
    }

    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::Relaxed)
    }

    pub fn queue_full_errors(&self) -> u64 {
        self.queue_full_errors.load(Ordering::Relaxed)
    }

    /// Current value of the cache-size gauge, 0 before registration.
    pub fn cache_size(&self) -> u64 {
        match self.cache_size.lock().unwrap().as_ref() {
            Some(source) => source(),
            None => 0,
        }
    }

    /// JSON snapshot of every published variable.
    pub fn snapshot(&self) -> Value {
        let routes: serde_json::Map<String, Value> = self
            .route_requests
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    json!(entry.value().load(Ordering::Relaxed)),
                )
            })
            .collect();

        json!({
            "counter_imageapi_cache_hits": self.cache_hits(),
            "counter_imageapi_cache_misses": self.cache_misses(),
            "counter_imageapi_requests_coalesced": self.requests_coalesced(),
            "counter_imageapi_requests_processed": self.requests_processed(),
            "counter_imageapi_queue_full_errors": self.queue_full_errors(),
            "gauge_imageapi_cache_size": self.cache_size(),
            "counter_requests": Value::Object(routes),
        })
    }
}

// =============================================================================
// Metrics listener
// =============================================================================

#[derive(Clone)]
struct MetricsState {
    metrics: Arc<Metrics>,
    health: HealthHandle,
}

/// Router for the metrics listener: `/debug/vars` and `/health`.
pub fn router(metrics: Arc<Metrics>, health: HealthHandle) -> Router {
    Router::new()
        .route("/debug/vars", get(debug_vars))
        .route("/health", get(health_report))
        .with_state(MetricsState { metrics, health })
}

/// Serves the metrics endpoints until shutdown.
pub async fn serve(
    shutdown: CancellationToken,
    listen: &str,
    metrics: Arc<Metrics>,
    health: HealthHandle,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "metrics server listening");

    axum::serve(listener, router(metrics, health))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn debug_vars(State(state): State<MetricsState>) -> Json<Value> {
    Json(state.metrics.snapshot())
}

async fn health_report(State(state): State<MetricsState>) -> impl IntoResponse {
    let report = state.health.report();
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}
