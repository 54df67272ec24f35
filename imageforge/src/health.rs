//! Storage health checking.
//!
//! A background task probes blob storage on an interval and publishes the
//! latest result for the `/health` endpoint, so health reads never touch
//! storage themselves.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::storage::Storage;

/// How often storage is probed.
const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Latest health probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub storage: String,
}

impl HealthReport {
    fn unknown() -> Self {
        Self {
            healthy: false,
            storage: "unchecked".to_string(),
        }
    }
}

/// Read handle for the latest health report.
#[derive(Clone)]
pub struct HealthHandle {
    report: Arc<RwLock<HealthReport>>,
}

impl HealthHandle {
    pub fn report(&self) -> HealthReport {
        self.report.read().unwrap().clone()
    }
}

/// Periodic storage prober.
pub struct HealthChecker<S> {
    storage: Arc<S>,
    report: Arc<RwLock<HealthReport>>,
}

impl<S: Storage> HealthChecker<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            report: Arc::new(RwLock::new(HealthReport::unknown())),
        }
    }

    pub fn handle(&self) -> HealthHandle {
        HealthHandle {
            report: Arc::clone(&self.report),
        }
    }

    /// Probes storage until shutdown. The first probe runs immediately so
    /// the endpoint is meaningful as soon as the service is up.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = interval.tick() => self.probe().await,
            }
        }
    }

    async fn probe(&self) {
        let report = match self.storage.health_check().await {
            Ok(()) => HealthReport {
                healthy: true,
                storage: "ok".to_string(),
            },
            Err(e) => {
                warn!(error = %e, "storage health check failed");
                HealthReport {
                    healthy: false,
                    storage: e.to_string(),
                }
            }
        };
        *self.report.write().unwrap() = report;
    }
}
