//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use kiln_core::admission::AdmissionLimits;
use kiln_core::scheduler::ConversionPipeline;
use kiln_core::{
    AdmissionGate, ConversionCache, HealthMonitor, PollGuard, PollPolicy, Scheduler,
    ServiceConfig, ToolAdapter,
};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Conversion limits shared with the core.
    pub service: Arc<ServiceConfig>,
    pub gate: Arc<AdmissionGate>,
    pub scheduler: Scheduler,
    pub tools: Arc<ToolAdapter>,
    pub health: Arc<HealthMonitor>,
    pub poll_guard: Arc<PollGuard>,
    pub poll_policy: PollPolicy,
}

impl AppState {
    /// Wire the core components together. Must run inside a tokio runtime
    /// because the scheduler spawns its dispatch loop.
    pub fn new(
        config: Config,
        service: ServiceConfig,
        cache: ConversionCache,
        health: Arc<HealthMonitor>,
    ) -> Arc<Self> {
        let service = Arc::new(service);
        let tools = Arc::new(ToolAdapter::new(&service));
        let converter = Arc::new(ConversionPipeline::new(Arc::clone(&tools)));
        // One gate bounds both synchronous requests and scheduled tasks.
        let gate = Arc::new(AdmissionGate::new(AdmissionLimits::from(service.as_ref())));
        let scheduler = Scheduler::start(
            Arc::clone(&service),
            converter,
            cache,
            Arc::clone(&health),
            Arc::clone(&gate),
        );

        Arc::new(Self {
            config: Arc::new(config),
            gate,
            poll_guard: Arc::new(PollGuard::new(service.poll_min_interval)),
            poll_policy: PollPolicy::new(&service),
            service,
            scheduler,
            tools,
            health,
        })
    }
}
