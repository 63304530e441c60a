//! Health and format discovery endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use kiln_core::Category;
use strum::IntoEnumIterator;

use crate::schemas::health::HealthResponse;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(get_health))
        .route("/formats", get(get_formats))
}

/// Current metrics, health score, scheduler load and tool availability.
///
/// Always answers 200; load balancers should read `report.status`.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health report", body = HealthResponse)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        report: state.health.report(),
        load: state.scheduler.load(),
        tools: state.tools.inventory().await,
    })
}

/// Allowed target formats per category.
#[utoipa::path(
    get,
    path = "/formats",
    tag = "health",
    responses(
        (status = 200, description = "Target formats by category", body = BTreeMap<String, Vec<String>>)
    )
)]
pub async fn get_formats(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Vec<String>>> {
    let formats = Category::iter()
        .map(|category| {
            let targets = state
                .service
                .allowed_targets(category)
                .iter()
                .map(|f| f.as_str().to_owned())
                .collect();
            (category.to_string(), targets)
        })
        .collect();
    Json(formats)
}
