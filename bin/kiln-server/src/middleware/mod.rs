//! HTTP middleware stack: CORS and per-request tracing / health spans.

pub mod cors;
pub mod trace;
