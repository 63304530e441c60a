//! Axum router construction.
//!
//! [`build`] assembles the complete application router, including:
//! - Middleware layers (CORS, trace id and health span per request)
//! - The upload body limit derived from `KILN_MAX_UPLOAD_BYTES`
//! - Conversion, task, health and format routes
//! - Optional OpenAPI document (disable with `KILN_ENABLE_OPENAPI=false`)

pub mod convert;
pub mod doc;
mod health;
mod tasks;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::{Json, Router, middleware};

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Room for multipart boundaries and the small text parts.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let upload_limit = usize::try_from(state.service.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    let mut app = Router::new()
        .merge(convert::router())
        .merge(tasks::router())
        .merge(health::router());

    if state.config.enable_openapi {
        app = app.route("/api-docs/openapi.json", get(|| async { Json(doc::get_docs()) }));
    }

    app
        // Outermost layers execute first on the way in.
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            trace::trace_middleware,
        ))
        .layer(cors::cors_layer(&state))
        .with_state(state)
}

#[cfg(test)]
mod tests;
