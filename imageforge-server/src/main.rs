//! Imageforge server - HTTP entry point.
//!
//! Thin wiring around the `imageforge` library: parse flags (with `IMAGE_*`
//! environment fallbacks), initialize logging, build the storage, cache,
//! queue and API components, then serve until SIGINT/SIGTERM.

mod error;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use error::ServerError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use imageforge::api::Api;
use imageforge::cache::SourceCache;
use imageforge::config::{ServiceConfig, DEFAULT_WORKERS};
use imageforge::health::HealthChecker;
use imageforge::logging;
use imageforge::metrics::{self, Metrics};
use imageforge::processor::{ImageBackend, QueuedProcessor, RasterBackend, RenderHandler};
use imageforge::queue::WorkQueue;
use imageforge::signer::Signer;
use imageforge::storage::FileStorage;

#[derive(Parser)]
#[command(name = "imageforge-server")]
#[command(version = imageforge::VERSION)]
#[command(about = "Dynamic image rendition service", long_about = None)]
struct Cli {
    /// Listen address (tcp host:port or unix socket path)
    #[arg(long, env = "IMAGE_LISTEN", default_value = "127.0.0.1:8082")]
    listen: String,

    /// Metrics listen address
    #[arg(long, env = "IMAGE_METRICS_LISTEN", default_value = "127.0.0.1:8083")]
    metrics_listen: String,

    /// Log level (debug, info, warn, error)
    #[arg(long, env = "IMAGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Path to the source image storage directory
    #[arg(long, env = "IMAGE_STORAGE_PATH")]
    storage_path: PathBuf,

    /// HMAC key for authentication between services
    #[arg(long, env = "IMAGE_HMAC_KEY")]
    hmac_key: String,

    /// Render worker concurrency
    #[arg(long, env = "IMAGE_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,
}

impl Cli {
    fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            listen: self.listen.clone(),
            metrics_listen: self.metrics_listen.clone(),
            storage_path: self.storage_path.clone(),
            hmac_key: self.hmac_key.clone(),
            workers: self.workers,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = cli.service_config();
    if let Err(e) = run(&cli.log_level, config).await {
        e.exit();
    }
}

async fn run(log_level: &str, config: ServiceConfig) -> Result<(), ServerError> {
    logging::init(log_level).map_err(|e| ServerError::Logging(e.to_string()))?;

    // Root cancellation: SIGINT/SIGTERM stop intake everywhere, then the
    // servers and the queue drain.
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let storage = Arc::new(FileStorage::new(&config.storage_path)?);
    let sources = Arc::new(SourceCache::new(Arc::clone(&storage)));

    let backend: Arc<dyn RasterBackend> = Arc::new(ImageBackend::new());
    let queue = Arc::new(WorkQueue::new(
        shutdown.clone(),
        config.workers,
        Arc::new(RenderHandler::new(backend)),
    ));
    let queue_task = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            if let Err(e) = queue.run().await {
                error!(error = %e, "render queue failed to start");
            }
        })
    };

    let processor = Arc::new(QueuedProcessor::new(Arc::clone(&sources), queue));
    let signer = Signer::new(config.hmac_key.as_bytes())?;
    let metrics = Metrics::new();
    let api = Api::new(processor, signer, Arc::clone(&metrics));

    let checker = HealthChecker::new(Arc::clone(&storage));
    let health = checker.handle();
    tokio::spawn(checker.run(shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        let metrics_listen = config.metrics_listen.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(shutdown, &metrics_listen, metrics, health).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    let app = api.router();
    serve(&config.listen, app, shutdown.clone()).await?;

    info!("shutting down");
    shutdown.cancel();
    sources.shutdown();
    let _ = queue_task.await;
    Ok(())
}

/// Binds TCP or a Unix socket depending on the listen address shape: an
/// address containing `:` is TCP, anything else is a socket path.
async fn serve(
    listen: &str,
    app: axum::Router,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    if listen.contains(':') {
        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .map_err(|e| ServerError::Bind {
                listen: listen.to_string(),
                source: e,
            })?;
        info!(listen, "http server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(ServerError::Serve)
    } else {
        // Remove a stale socket from an unclean exit before binding.
        if let Err(e) = std::fs::remove_file(listen) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(listen, error = %e, "could not remove stale socket");
            }
        }
        let listener =
            tokio::net::UnixListener::bind(listen).map_err(|e| ServerError::Bind {
                listen: listen.to_string(),
                source: e,
            })?;
        info!(listen, "http server listening on unix socket");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(ServerError::Serve)
    }
}

/// Cancels the shutdown token on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "could not install SIGTERM handler");
                    let _ = ctrl_c.await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received interrupt");
        }

        shutdown.cancel();
    });
}
