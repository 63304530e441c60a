use std::collections::BTreeMap;

use kiln_core::HealthReport;
use kiln_core::scheduler::SchedulerLoad;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub version: &'static str,
    /// Status, five-dimension score and the metrics it was computed from.
    #[schema(value_type = Object)]
    pub report: HealthReport,
    #[schema(value_type = Object)]
    pub load: SchedulerLoad,
    /// External tool availability, by tool name.
    pub tools: BTreeMap<String, bool>,
}
