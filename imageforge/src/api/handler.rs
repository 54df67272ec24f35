//! The image route handler.
//!
//! Pipeline per request: verify the signature, validate parameters, derive
//! the fingerprint, then hand off to the coalescer which consults the cache
//! and renders at most once. Response headers identify the rendition and
//! allow long-lived downstream caching; the bytes for a fingerprint never
//! change, so `immutable` is accurate.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::api::error::ApiError;
use crate::api::Api;
use crate::coalesce::CoalesceError;
use crate::params::Params;
use crate::processor::{ImageProcessor, ProcessError, RenditionTask};
use crate::signer::{canonical_request, SIGNATURE_PARAM};
use crate::trace::TraceContext;

/// Month-long public caching; renditions are immutable per fingerprint.
const CACHE_CONTROL: &str =
    "public, max-age=2592000, stale-while-revalidate=60, stale-if-error=43200, immutable";

static PICSUM_ID: HeaderName = HeaderName::from_static("picsum-id");

/// `GET /id/{id}/{width}/{height}{extension}`
pub async fn serve_image<P: ImageProcessor>(
    State(api): State<Arc<Api<P>>>,
    Path((id, width, height_and_extension)): Path<(String, String, String)>,
    Query(query): Query<Vec<(String, String)>>,
    uri: Uri,
    trace: Option<axum::Extension<TraceContext>>,
) -> Result<Response, ApiError> {
    let trace = trace.map(|ext| ext.0);

    // Authenticate before parsing: unsigned garbage should not reach the
    // validators, let alone the queue.
    let Some((_, signature)) = query.iter().find(|(key, _)| key == SIGNATURE_PARAM) else {
        return Err(ApiError::bad_request("Invalid parameters"));
    };
    let canonical = canonical_request(uri.path(), &query);
    if !api.signer.verify(&canonical, signature) {
        return Err(ApiError::bad_request("Invalid parameters"));
    }

    let params = Params::parse(&id, &width, &height_and_extension, &query)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let fingerprint = params.fingerprint();

    // Dropping this request (client disconnect or handler timeout) cancels
    // the token, which short-circuits the job if it is still queued.
    let cancel = CancellationToken::new();
    let _disconnect = cancel.clone().drop_guard();

    let task = RenditionTask::from_params(&params);
    let processor = Arc::clone(&api.processor);
    let result = api
        .coalescer
        .get_or_render(&cancel, &fingerprint, || {
            let cancel = cancel.clone();
            async move { processor.process_image(&cancel, task).await }
        })
        .await;

    let rendition = match result {
        Ok(bytes) => bytes,
        Err(CoalesceError::Cancelled) => {
            // The caller is gone; nobody reads this response. Matches the
            // original behavior of answering 500 without an error log.
            return Err(ApiError::internal_server_error());
        }
        Err(CoalesceError::Process(ProcessError::QueueFull)) => {
            api.metrics.record_queue_full_error();
            log_error(trace.as_ref(), "error processing image: queue is full");
            return Err(ApiError::service_unavailable());
        }
        Err(CoalesceError::Process(e)) => {
            log_process_error(trace.as_ref(), &e);
            return Err(ApiError::internal_server_error());
        }
    };

    Ok(rendition_response(&params, &fingerprint, &rendition))
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found()
}

fn rendition_response(params: &Params, fingerprint: &str, rendition: &Arc<Vec<u8>>) -> Response {
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                params.extension.content_type().to_string(),
            ),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{fingerprint}\""),
            ),
            (header::CONTENT_LENGTH, rendition.len().to_string()),
            (header::CACHE_CONTROL, CACHE_CONTROL.to_string()),
            (PICSUM_ID.clone(), params.id.clone()),
            (
                HeaderName::from_static("timing-allow-origin"),
                "*".to_string(),
            ),
        ],
        rendition.as_ref().clone(),
    )
        .into_response()
}

fn log_error(trace: Option<&TraceContext>, message: &str) {
    let (trace_id, span_id) = match trace {
        Some(ctx) => (ctx.trace_id.as_str(), ctx.span_id.as_str()),
        None => ("", ""),
    };
    error!(trace_id, span_id, "{message}");
}

fn log_process_error(trace: Option<&TraceContext>, err: &ProcessError) {
    let (trace_id, span_id) = match trace {
        Some(ctx) => (ctx.trace_id.as_str(), ctx.span_id.as_str()),
        None => ("", ""),
    };
    error!(trace_id, span_id, error = %err, "error processing image");
}
