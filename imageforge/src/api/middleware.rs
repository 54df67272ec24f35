//! HTTP middleware chain.
//!
//! Outermost to innermost: tracer, request log, per-request timeout, panic
//! recovery, CORS, router. Request counting sits on the routes themselves so
//! it can see the matched route template.
//!
//! The request log picks its severity from how the request ended:
//!
//! - client went away before a response was written: `info` (their choice,
//!   not our failure)
//! - 503 from the handler timeout: `error`
//! - any other 5xx: `error`
//! - everything else: `debug`
//!
//! A dropped request future is the only way a client disconnect manifests
//! here, so the log middleware arms a drop guard and disarms it once a
//! response exists.

use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, Instrument};

use crate::api::error::ApiError;
use crate::config::HANDLER_TIMEOUT;
use crate::metrics::Metrics;
use crate::trace::{TraceContext, Tracer};

/// Body written when the per-request timeout fires.
pub const TIMEOUT_BODY: &str = "Something went wrong. Timed out.";

/// Response extension marking a timeout-generated 503, so the request log
/// can tell it apart from a queue-full 503.
#[derive(Debug, Clone, Copy)]
pub struct HandlerTimedOut;

/// CORS policy: read-only API, any origin, timing headers exposed.
pub fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any)
        .expose_headers([
            header::CONTENT_TYPE,
            header::HeaderName::from_static("picsum-id"),
        ])
}

/// Outermost middleware: mints the trace context and wraps the request in
/// its span.
pub async fn trace_requests(
    State(tracer): State<Tracer>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = tracer.start_request();
    let span = tracing::info_span!(
        "request",
        trace_id = %ctx.trace_id,
        span_id = %ctx.span_id,
    );
    request.extensions_mut().insert(ctx);
    next.run(request).instrument(span).await
}

/// Counts requests against their matched route template. Attached with
/// `route_layer` so `MatchedPath` is populated.
pub async fn count_requests(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string());
    metrics.record_request(route.as_deref().unwrap_or("unmatched"));
    next.run(request).await
}

/// Logs every request with severity based on outcome.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let trace = request.extensions().get::<TraceContext>().cloned();
    let started = Instant::now();

    let mut pending = PendingRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        trace: trace.clone(),
        started,
        armed: true,
    };

    let response = next.run(request).await;
    pending.armed = false;

    let status = response.status();
    let timed_out = response.extensions().get::<HandlerTimedOut>().is_some();
    let elapsed = started.elapsed();
    let (trace_id, span_id) = trace_fields(trace.as_ref());

    if status == StatusCode::SERVICE_UNAVAILABLE && timed_out {
        error!(
            http_method = %method,
            uri = %uri,
            user_agent = %user_agent,
            status_code = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            trace_id,
            span_id,
            "request timeout"
        );
    } else if status.is_server_error() {
        error!(
            http_method = %method,
            uri = %uri,
            user_agent = %user_agent,
            status_code = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            trace_id,
            span_id,
            "request completed"
        );
    } else {
        debug!(
            http_method = %method,
            uri = %uri,
            user_agent = %user_agent,
            status_code = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            trace_id,
            span_id,
            "request completed"
        );
    }

    response
}

/// Armed while a request is in flight; fires only if the future is dropped
/// before a response was produced, which is how a client disconnect looks
/// from inside the service.
struct PendingRequest {
    method: String,
    uri: String,
    trace: Option<TraceContext>,
    started: Instant,
    armed: bool,
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (trace_id, span_id) = trace_fields(self.trace.as_ref());
        info!(
            http_method = %self.method,
            uri = %self.uri,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            trace_id,
            span_id,
            "request cancelled by client"
        );
    }
}

fn trace_fields(trace: Option<&TraceContext>) -> (&str, &str) {
    match trace {
        Some(ctx) => (ctx.trace_id.as_str(), ctx.span_id.as_str()),
        None => ("", ""),
    }
}

/// Enforces the per-request wall clock. On expiry the inner future is
/// dropped (cancelling queued work through its token) and a fixed 503 body
/// is written.
pub async fn timeout_requests(request: Request, next: Next) -> Response {
    match tokio::time::timeout(HANDLER_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            let mut response =
                (StatusCode::SERVICE_UNAVAILABLE, TIMEOUT_BODY).into_response();
            response.extensions_mut().insert(HandlerTimedOut);
            response
        }
    }
}

/// Catches handler panics, logs them with trace correlation and answers 500.
/// The worker pool and the server itself are unaffected.
pub async fn recover_panics(request: Request, next: Next) -> Response {
    let trace = request.extensions().get::<TraceContext>().cloned();

    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let (trace_id, span_id) = trace_fields(trace.as_ref());
            error!(
                panic = panic_message(&panic),
                backtrace = %Backtrace::force_capture(),
                trace_id,
                span_id,
                "panic handling request"
            );
            ApiError::internal_server_error().into_response()
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
