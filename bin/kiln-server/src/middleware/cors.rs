use std::sync::Arc;

use axum::http::HeaderName;
use tower_http::cors::{Any, CorsLayer};

use crate::middleware::trace::X_TRACE_ID;
use crate::routes::convert::X_KILN_CACHE;
use crate::state::AppState;

pub fn cors_layer(state: &Arc<AppState>) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = state
        .config
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .expose_headers([
            axum::http::header::CONTENT_DISPOSITION,
            axum::http::header::RETRY_AFTER,
            HeaderName::from_static(X_TRACE_ID),
            HeaderName::from_static(X_KILN_CACHE),
        ]);
    if origins.is_empty() {
        // Wildcard; set KILN_CORS_ORIGINS in production.
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
