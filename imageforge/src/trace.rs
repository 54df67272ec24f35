//! Request trace identifiers.
//!
//! Every request gets a `(trace_id, span_id)` pair minted at the outermost
//! middleware and carried through request extensions, so every log line
//! produced while serving it can be correlated.

use uuid::Uuid;

/// Identifiers for one request's trace.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// Mints per-request trace contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracer;

impl Tracer {
    pub fn new() -> Self {
        Self
    }

    /// Starts a trace for an incoming request.
    pub fn start_request(&self) -> TraceContext {
        let trace_id = Uuid::new_v4().simple().to_string();
        // A span id is the 8-byte form used by log correlation.
        let span_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        TraceContext { trace_id, span_id }
    }
}
