use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use kiln_core::ErrorKind;
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::state::AppState;

pub static X_TRACE_ID: &str = "x-trace-id";

/// Rejections that never reach a converter.
fn is_rejection(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::RateLimited
            | ErrorKind::Busy
            | ErrorKind::BadRequest
            | ErrorKind::PayloadTooLarge
            | ErrorKind::PollTooFrequent
    )
}

/// Wrap each request in an `http_request` span keyed by a trace id and time
/// it against the health monitor under its route template.
pub async fn trace_middleware(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let start_time = Instant::now();

    // Extract or generate the trace id.
    let trace_id = req
        .headers()
        .get(X_TRACE_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    let trace_value = HeaderValue::from_str(&trace_id.to_string()).ok();
    if let Some(value) = &trace_value {
        req.headers_mut().insert(X_TRACE_ID, value.clone());
    }

    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());

    let span = info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
    );

    async move {
        info!("→ request started");
        let health_span = state.health.start_span(format!("{method} {route}"));

        let mut response = next.run(req).await;

        if let Some(kind) = response.extensions().get::<ErrorKind>().copied() {
            if is_rejection(kind) {
                state.health.record_rejection(kind);
            }
        }
        health_span.end(!response.status().is_server_error());

        if let Some(value) = trace_value {
            response.headers_mut().insert(X_TRACE_ID, value);
        }
        info!(
            status = response.status().as_u16(),
            latency_ms = start_time.elapsed().as_millis(),
            "← response finished"
        );
        response
    }
    .instrument(span)
    .await
}
