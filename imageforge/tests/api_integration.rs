//! Integration tests for the HTTP API.
//!
//! These drive the complete router (middleware included) with in-process
//! requests and verify:
//! - the signed happy path, response headers and body
//! - cache hits and request coalescing across identical requests
//! - rejection of unsigned, tampered and malformed requests
//! - error mapping for storage misses and queue saturation
//! - panic isolation

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use imageforge::api::Api;
use imageforge::cache::SourceCache;
use imageforge::metrics::Metrics;
use imageforge::processor::{
    ImageBackend, ImageProcessor, ProcessError, QueuedProcessor, RasterBackend, RenderHandler,
    RenditionTask,
};
use imageforge::queue::WorkQueue;
use imageforge::signer::{canonical_request, Signer};
use imageforge::storage::FileStorage;

const TEST_KEY: &str = "secret";

// =============================================================================
// Test Helpers
// =============================================================================

/// A full service over temp-dir file storage with ids `123` and `7`.
struct TestService {
    router: Router,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
    _storage_dir: TempDir,
}

impl Drop for TestService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn fixture_jpeg() -> Vec<u8> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{DynamicImage, Rgb, RgbImage};

    let img = RgbImage::from_fn(64, 48, |x, y| Rgb([(x * 4) as u8, (y * 5) as u8, 200]));
    let mut buffer = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buffer, 90);
    DynamicImage::ImageRgb8(img)
        .write_with_encoder(encoder)
        .unwrap();
    buffer
}

fn start_service(workers: usize) -> TestService {
    let storage_dir = TempDir::new().unwrap();
    let jpeg = fixture_jpeg();
    for id in ["123", "7"] {
        std::fs::write(storage_dir.path().join(format!("{id}.jpg")), &jpeg).unwrap();
    }

    let storage = Arc::new(FileStorage::new(storage_dir.path()).unwrap());
    let sources = Arc::new(SourceCache::new(storage));

    let shutdown = CancellationToken::new();
    let backend: Arc<dyn RasterBackend> = Arc::new(ImageBackend::new());
    let queue = Arc::new(WorkQueue::new(
        shutdown.clone(),
        workers,
        Arc::new(RenderHandler::new(backend)),
    ));
    {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let _ = queue.run().await;
        });
    }

    let processor = Arc::new(QueuedProcessor::new(sources, queue));
    let signer = Signer::new(TEST_KEY).unwrap();
    let metrics = Metrics::new();
    let api = Api::new(processor, signer, Arc::clone(&metrics));

    TestService {
        router: api.router(),
        metrics,
        shutdown,
        _storage_dir: storage_dir,
    }
}

/// Builds a correctly signed URI for a path and query pairs.
fn signed_uri(path: &str, query: &[(&str, &str)]) -> String {
    let pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = Signer::new(TEST_KEY)
        .unwrap()
        .sign(&canonical_request(path, &pairs));

    let mut uri = String::from(path);
    uri.push('?');
    for (key, value) in query {
        uri.push_str(key);
        if !value.is_empty() {
            uri.push('=');
            uri.push_str(value);
        }
        uri.push('&');
    }
    uri.push_str(&format!("hmac={signature}"));
    uri
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn header<'a>(response: &'a axum::response::Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {name}"))
        .to_str()
        .unwrap()
}

// =============================================================================
// Happy Path
// =============================================================================

#[tokio::test]
async fn test_signed_request_returns_rendition() {
    let service = start_service(2);
    let uri = signed_uri("/id/123/100/100.jpg", &[]);

    let response = get(&service.router, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/jpeg");
    assert_eq!(header(&response, "picsum-id"), "123");
    assert_eq!(
        header(&response, "content-disposition"),
        "inline; filename=\"123-100x100.jpg\""
    );
    assert_eq!(
        header(&response, "cache-control"),
        "public, max-age=2592000, stale-while-revalidate=60, stale-if-error=43200, immutable"
    );
    assert_eq!(header(&response, "timing-allow-origin"), "*");

    let expected_length: usize = header(&response, "content-length").parse().unwrap();
    let body = body_bytes(response).await;
    assert_eq!(body.len(), expected_length);

    let decoded = image::load_from_memory(&body).unwrap();
    assert_eq!(decoded.width(), 100);
    assert_eq!(decoded.height(), 100);
}

#[tokio::test]
async fn test_webp_with_transforms() {
    let service = start_service(2);
    let uri = signed_uri("/id/7/200/200.webp", &[("blur", "3"), ("grayscale", "")]);

    let response = get(&service.router, &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "image/webp");
    assert_eq!(
        header(&response, "content-disposition"),
        "inline; filename=\"7-200x200.webp-blur_3-grayscale\""
    );

    let body = body_bytes(response).await;
    assert_eq!(
        image::guess_format(&body).unwrap(),
        image::ImageFormat::WebP
    );
}

#[tokio::test]
async fn test_repeat_request_hits_cache() {
    let service = start_service(2);
    let uri = signed_uri("/id/123/100/100.jpg", &[]);

    let first = body_bytes(get(&service.router, &uri).await).await;
    assert_eq!(service.metrics.requests_processed(), 1);
    assert_eq!(service.metrics.cache_hits(), 0);

    let second = body_bytes(get(&service.router, &uri).await).await;
    assert_eq!(first, second);
    assert_eq!(service.metrics.requests_processed(), 1, "processor ran once");
    assert_eq!(service.metrics.cache_hits(), 1);
    assert_eq!(service.metrics.cache_size(), 1);
}

#[tokio::test]
async fn test_concurrent_identical_requests_render_once() {
    let service = start_service(3);
    let uri = signed_uri("/id/7/120/90.jpg", &[]);

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let router = service.router.clone();
        let uri = uri.clone();
        tasks.push(tokio::spawn(async move {
            let response = get(&router, &uri).await;
            assert_eq!(response.status(), StatusCode::OK);
            body_bytes(response).await
        }));
    }

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap());
    }
    for body in &bodies {
        assert_eq!(body, &bodies[0], "all coalesced responses are identical");
    }

    assert_eq!(service.metrics.requests_processed(), 1);
    assert_eq!(
        service.metrics.requests_coalesced() + service.metrics.cache_hits(),
        19,
        "every other request coalesced or hit the cache"
    );
}

#[tokio::test]
async fn test_different_params_render_separately() {
    let service = start_service(2);

    let a = get(&service.router, &signed_uri("/id/123/50/50.jpg", &[])).await;
    let b = get(&service.router, &signed_uri("/id/123/60/60.jpg", &[])).await;
    assert_eq!(a.status(), StatusCode::OK);
    assert_eq!(b.status(), StatusCode::OK);

    assert_eq!(service.metrics.requests_processed(), 2);
    assert_eq!(service.metrics.cache_size(), 2);
}

// =============================================================================
// Rejection Paths
// =============================================================================

#[tokio::test]
async fn test_missing_signature_rejected() {
    let service = start_service(1);

    let response = get(&service.router, "/id/123/100/100.jpg").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_bytes(response).await;
    assert_eq!(body, br#"{"error":"Invalid parameters"}"#);

    assert_eq!(service.metrics.requests_processed(), 0, "processor untouched");
    assert_eq!(service.metrics.cache_misses(), 0);
}

#[tokio::test]
async fn test_tampered_signature_rejected() {
    let service = start_service(1);

    let response = get(
        &service.router,
        "/id/123/100/100.jpg?hmac=deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(service.metrics.requests_processed(), 0);
}

#[tokio::test]
async fn test_signature_covers_query() {
    let service = start_service(1);

    // Signed without blur, requested with blur: the canonical form differs.
    let mut uri = signed_uri("/id/123/100/100.jpg", &[]);
    uri = uri.replace('?', "?blur=5&");

    let response = get(&service.router, &uri).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_parameters_rejected() {
    let service = start_service(1);

    for (path, query) in [
        ("/id/123/0/100.jpg", Vec::new()),
        ("/id/123/100/0.jpg", Vec::new()),
        ("/id/123/5001/100.jpg", Vec::new()),
        ("/id/123/100/5001.jpg", Vec::new()),
        ("/id/123/100/100.png", Vec::new()),
        ("/id/123/100/100.JPG", Vec::new()),
        ("/id/123/100/100.jpg", vec![("blur", "11")]),
        ("/id/123/100/100.jpg", vec![("blur", "soft")]),
    ] {
        let uri = signed_uri(path, &query);
        let response = get(&service.router, &uri).await;
        assert_eq!(
            response.status(),
            StatusCode::BAD_REQUEST,
            "{path} {query:?} should be rejected"
        );
    }
    assert_eq!(service.metrics.requests_processed(), 0);
}

#[tokio::test]
async fn test_unknown_id_is_internal_error() {
    let service = start_service(1);
    let uri = signed_uri("/id/ghost/100/100.jpg", &[]);

    let response = get(&service.router, &uri).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_bytes(response).await;
    assert_eq!(body, br#"{"error":"something went wrong"}"#);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let service = start_service(1);

    let response = get(&service.router, "/definitely/not/a/route").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_bytes(response).await;
    assert_eq!(body, br#"{"error":"page not found"}"#);
}

// =============================================================================
// Scripted-Processor Paths
// =============================================================================

/// Processor stand-in that fails or panics on demand.
enum Script {
    QueueFull,
    Panic,
}

struct ScriptedProcessor {
    script: Script,
    calls: AtomicUsize,
}

impl ImageProcessor for ScriptedProcessor {
    fn process_image(
        &self,
        _cancel: &CancellationToken,
        _task: RenditionTask,
    ) -> impl Future<Output = Result<Vec<u8>, ProcessError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = match self.script {
            Script::QueueFull => Err(ProcessError::QueueFull),
            Script::Panic => Ok(()),
        };
        async move {
            match outcome {
                Err(e) => Err(e),
                Ok(()) => panic!("processor exploded"),
            }
        }
    }
}

fn scripted_service(script: Script) -> (Router, Arc<Metrics>, Arc<ScriptedProcessor>) {
    let processor = Arc::new(ScriptedProcessor {
        script,
        calls: AtomicUsize::new(0),
    });
    let signer = Signer::new(TEST_KEY).unwrap();
    let metrics = Metrics::new();
    let api = Api::new(Arc::clone(&processor), signer, Arc::clone(&metrics));
    (api.router(), metrics, processor)
}

#[tokio::test]
async fn test_queue_full_maps_to_503() {
    let (router, metrics, processor) = scripted_service(Script::QueueFull);
    let uri = signed_uri("/id/123/100/100.jpg", &[]);

    let response = get(&router, &uri).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_bytes(response).await;
    assert_eq!(body, br#"{"error":"service unavailable"}"#);

    assert_eq!(metrics.queue_full_errors(), 1);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    let (router, _metrics, _processor) = scripted_service(Script::Panic);
    let uri = signed_uri("/id/123/100/100.jpg", &[]);

    let response = get(&router, &uri).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The service keeps answering after the panic.
    let response = get(&router, "/definitely/not/a/route").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
