//! Health monitor: tumbling-window request metrics, a weighted five-dimension
//! score, and rate-limited alerts.
//!
//! Recording never blocks on I/O and never fails; the monitor only observes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display};
use sysinfo::System;

use crate::config::ServiceConfig;
use crate::error::ErrorKind;

/// Minimum spacing between two alerts with the same dedup key.
const ALERT_COOLDOWN: Duration = Duration::from_secs(30);

pub const WEIGHT_PERFORMANCE: f64 = 0.30;
pub const WEIGHT_STABILITY: f64 = 0.25;
pub const WEIGHT_SECURITY: f64 = 0.15;
pub const WEIGHT_MAINTAINABILITY: f64 = 0.10;
pub const WEIGHT_EFFICIENCY: f64 = 0.20;

// ── Alerts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    LowHealthScore { score: f64, threshold: f64 },
    QueueSoftLimit { pending: usize, limit: usize },
    ConfigClamped {
        key: String,
        requested: String,
        applied: String,
        reason: String,
    },
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        match self {
            Alert::LowHealthScore { .. } => "low_health_score",
            Alert::QueueSoftLimit { .. } => "queue_soft_limit",
            Alert::ConfigClamped { .. } => "config_clamped",
        }
    }

    /// Alerts sharing a key are throttled together.
    fn dedup_key(&self) -> String {
        match self {
            Alert::ConfigClamped { key, .. } => format!("config_clamped:{key}"),
            other => other.kind().to_owned(),
        }
    }
}

/// Destination for alerts (log, pager, metrics pipeline).
pub trait AlertSink: Send + Sync + 'static {
    fn dispatch(&self, alert: &Alert);
}

/// Default sink: one `warn` event per alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn dispatch(&self, alert: &Alert) {
        match alert {
            Alert::LowHealthScore { score, threshold } => {
                tracing::warn!(alert = alert.kind(), score, threshold, "health score below threshold");
            }
            Alert::QueueSoftLimit { pending, limit } => {
                tracing::warn!(alert = alert.kind(), pending, limit, "task queue above soft limit");
            }
            Alert::ConfigClamped { key, requested, applied, reason } => {
                tracing::warn!(
                    alert = alert.kind(),
                    key = %key,
                    requested = %requested,
                    applied = %applied,
                    %reason,
                    "configuration value adjusted"
                );
            }
        }
    }
}

// ── Metrics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetrics {
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

/// Snapshot of the current window plus process and host readings.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub window_secs: u64,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub throughput_per_sec: f64,
    pub rejections: BTreeMap<String, u64>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub cache_hits: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_ratio: f64,
    pub cpu_percent: f32,
    pub loop_lag_ms: u64,
    pub routes: BTreeMap<String, RouteMetrics>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthScore {
    pub overall: f64,
    pub performance: f64,
    pub stability: f64,
    pub security: f64,
    pub maintainability: f64,
    pub efficiency: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub score: HealthScore,
    pub metrics: HealthMetrics,
    pub generated_at: DateTime<Utc>,
}

/// Map `value` onto 10/8/6/4/2 using four ascending cut-offs.
fn band(value: f64, cutoffs: [f64; 4]) -> f64 {
    match cutoffs.iter().position(|c| value < *c) {
        Some(0) => 10.0,
        Some(1) => 8.0,
        Some(2) => 6.0,
        Some(3) => 4.0,
        _ => 2.0,
    }
}

/// Score a metrics snapshot. Pure; exposed for tests and dashboards.
pub fn score_from(metrics: &HealthMetrics) -> HealthScore {
    let performance = band(metrics.avg_latency_ms, [200.0, 500.0, 1_000.0, 3_000.0]);

    let task_total = metrics.tasks_completed + metrics.tasks_failed;
    let task_failure_rate = ratio(metrics.tasks_failed, task_total);
    let stability = band(
        metrics.error_rate.max(task_failure_rate),
        [0.01, 0.05, 0.10, 0.25],
    );

    let rejected: u64 = metrics.rejections.values().sum();
    let security = band(
        ratio(rejected, metrics.requests.max(rejected)),
        [0.05, 0.15, 0.30, 0.50],
    );

    let maintainability = band(metrics.loop_lag_ms as f64, [10.0, 50.0, 100.0, 250.0]);
    let efficiency = band(metrics.memory_ratio, [0.60, 0.75, 0.85, 0.95]);

    let overall = performance * WEIGHT_PERFORMANCE
        + stability * WEIGHT_STABILITY
        + security * WEIGHT_SECURITY
        + maintainability * WEIGHT_MAINTAINABILITY
        + efficiency * WEIGHT_EFFICIENCY;

    HealthScore {
        overall: (overall * 100.0).round() / 100.0,
        performance,
        stability,
        security,
        maintainability,
        efficiency,
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

// ── Monitor ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RouteWindow {
    requests: u64,
    errors: u64,
    total_latency: Duration,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    requests: u64,
    errors: u64,
    total_latency: Duration,
    max_latency: Duration,
    rejections: BTreeMap<String, u64>,
    tasks_completed: u64,
    tasks_failed: u64,
    cache_hits: u64,
    routes: BTreeMap<String, RouteWindow>,
}

impl Window {
    fn new(started: Instant) -> Self {
        Self {
            started,
            requests: 0,
            errors: 0,
            total_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            rejections: BTreeMap::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            cache_hits: 0,
            routes: BTreeMap::new(),
        }
    }
}

pub struct HealthMonitor {
    window_len: Duration,
    threshold: f64,
    window: Mutex<Window>,
    loop_lag_ms: AtomicU64,
    system: Mutex<System>,
    sink: Arc<dyn AlertSink>,
    last_alerts: Mutex<HashMap<String, Instant>>,
    last_score: Mutex<Option<f64>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("window_len", &self.window_len)
            .field("threshold", &self.threshold)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HealthMonitor {
    pub fn new(config: &ServiceConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self::with_window(config.health_window, config.health_alert_threshold, sink)
    }

    pub fn with_window(window_len: Duration, threshold: f64, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            window_len,
            threshold,
            window: Mutex::new(Window::new(Instant::now())),
            loop_lag_ms: AtomicU64::new(0),
            system: Mutex::new(System::new()),
            sink,
            last_alerts: Mutex::new(HashMap::new()),
            last_score: Mutex::new(None),
        }
    }

    pub fn alert_threshold(&self) -> f64 {
        self.threshold
    }

    /// Start timing one request on `route`.
    pub fn start_span(self: &Arc<Self>, route: impl Into<String>) -> RequestSpan {
        RequestSpan {
            monitor: Arc::clone(self),
            route: route.into(),
            started: Instant::now(),
            ended: false,
        }
    }

    fn with_window_mut(&self, f: impl FnOnce(&mut Window)) {
        let now = Instant::now();
        let mut window = lock(&self.window);
        if now.duration_since(window.started) >= self.window_len {
            *window = Window::new(now);
        }
        f(&mut window);
    }

    fn record_request(&self, route: &str, latency: Duration, success: bool) {
        self.with_window_mut(|w| {
            w.requests += 1;
            w.total_latency += latency;
            w.max_latency = w.max_latency.max(latency);
            let r = w.routes.entry(route.to_owned()).or_default();
            r.requests += 1;
            r.total_latency += latency;
            if !success {
                w.errors += 1;
                r.errors += 1;
            }
        });
    }

    /// Count a request turned away by admission or validation.
    pub fn record_rejection(&self, kind: ErrorKind) {
        self.with_window_mut(|w| {
            *w.rejections.entry(kind.as_ref().to_owned()).or_default() += 1;
        });
    }

    /// Count a task reaching a terminal state.
    pub fn record_task_outcome(&self, success: bool, cache_hit: bool) {
        self.with_window_mut(|w| {
            if success {
                w.tasks_completed += 1;
            } else {
                w.tasks_failed += 1;
            }
            if cache_hit {
                w.cache_hits += 1;
            }
        });
    }

    pub fn record_loop_lag(&self, lag: Duration) {
        self.loop_lag_ms
            .store(lag.as_millis().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    /// Measure timer overshoot every `interval` until the monitor is dropped.
    pub fn spawn_lag_probe(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                tokio::time::sleep(interval).await;
                let lag = started.elapsed().saturating_sub(interval);
                match weak.upgrade() {
                    Some(monitor) => monitor.record_loop_lag(lag),
                    None => break,
                }
            }
        })
    }

    /// Recompute the report every `interval` until the monitor is dropped, so
    /// the score behind poll hints and low-score alerts stays current without
    /// anyone calling `/health`.
    pub fn spawn_score_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = weak.upgrade() else { break };
                let report = monitor.report();
                tracing::debug!(score = report.score.overall, status = ?report.status, "health score refreshed");
            }
        })
    }

    /// Send `alert` unless one with the same key went out within the cooldown.
    pub fn alert(&self, alert: Alert) {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_alerts);
            let key = alert.dedup_key();
            if last.get(&key).is_some_and(|t| now.duration_since(*t) < ALERT_COOLDOWN) {
                return;
            }
            last.insert(key, now);
        }
        self.sink.dispatch(&alert);
    }

    /// Score from the most recent report, if any.
    pub fn last_score(&self) -> Option<f64> {
        *lock(&self.last_score)
    }

    pub fn metrics(&self) -> HealthMetrics {
        let now = Instant::now();
        let mut metrics = {
            let mut window = lock(&self.window);
            if now.duration_since(window.started) >= self.window_len {
                *window = Window::new(now);
            }
            snapshot(&window, now, self.window_len)
        };

        let mut system = lock(&self.system);
        system.refresh_memory();
        system.refresh_cpu_usage();
        metrics.memory_total_bytes = system.total_memory();
        metrics.memory_used_bytes = system.used_memory();
        metrics.memory_ratio = ratio(metrics.memory_used_bytes, metrics.memory_total_bytes);
        metrics.cpu_percent = system.global_cpu_usage();
        metrics.loop_lag_ms = self.loop_lag_ms.load(Ordering::Relaxed);
        metrics
    }

    /// Compute metrics and score; alert when the score is below threshold.
    pub fn report(&self) -> HealthReport {
        let metrics = self.metrics();
        let score = score_from(&metrics);
        *lock(&self.last_score) = Some(score.overall);

        // The threshold wins even when it is configured above the healthy band.
        let status = if score.overall < self.threshold {
            self.alert(Alert::LowHealthScore {
                score: score.overall,
                threshold: self.threshold,
            });
            HealthStatus::Unhealthy
        } else if score.overall >= 8.0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            score,
            metrics,
            generated_at: Utc::now(),
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

fn snapshot(w: &Window, now: Instant, window_len: Duration) -> HealthMetrics {
    let elapsed = now.duration_since(w.started).max(Duration::from_secs(1));
    let avg = |total: Duration, n: u64| if n == 0 { 0.0 } else { millis(total) / n as f64 };
    HealthMetrics {
        window_secs: window_len.as_secs(),
        requests: w.requests,
        errors: w.errors,
        error_rate: ratio(w.errors, w.requests),
        avg_latency_ms: avg(w.total_latency, w.requests),
        max_latency_ms: millis(w.max_latency),
        throughput_per_sec: w.requests as f64 / elapsed.as_secs_f64(),
        rejections: w.rejections.clone(),
        tasks_completed: w.tasks_completed,
        tasks_failed: w.tasks_failed,
        cache_hits: w.cache_hits,
        routes: w
            .routes
            .iter()
            .map(|(name, r)| {
                let metrics = RouteMetrics {
                    requests: r.requests,
                    errors: r.errors,
                    avg_latency_ms: avg(r.total_latency, r.requests),
                };
                (name.clone(), metrics)
            })
            .collect(),
        ..HealthMetrics::default()
    }
}

/// One in-flight observation. Finish it with [`RequestSpan::end`]; a span that
/// is dropped without `end` counts as a failed request.
pub struct RequestSpan {
    monitor: Arc<HealthMonitor>,
    route: String,
    started: Instant,
    ended: bool,
}

impl RequestSpan {
    pub fn end(mut self, success: bool) {
        self.finish(success);
    }

    fn finish(&mut self, success: bool) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.monitor
            .record_request(&self.route, self.started.elapsed(), success);
    }
}

impl Drop for RequestSpan {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollPolicy;
    use crate::scheduler::SchedulerLoad;

    #[derive(Default)]
    struct CollectingSink(Mutex<Vec<Alert>>);

    impl AlertSink for CollectingSink {
        fn dispatch(&self, alert: &Alert) {
            self.0.lock().unwrap().push(alert.clone());
        }
    }

    fn monitor(sink: Arc<CollectingSink>) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::with_window(Duration::from_secs(60), 6.0, sink))
    }

    #[test]
    fn weights_sum_to_one() {
        let total = WEIGHT_PERFORMANCE
            + WEIGHT_STABILITY
            + WEIGHT_SECURITY
            + WEIGHT_MAINTAINABILITY
            + WEIGHT_EFFICIENCY;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn idle_service_scores_perfectly() {
        let score = score_from(&HealthMetrics::default());
        assert_eq!(score.overall, 10.0);
    }

    #[test]
    fn slow_and_failing_service_scores_low() {
        let metrics = HealthMetrics {
            requests: 100,
            errors: 40,
            error_rate: 0.4,
            avg_latency_ms: 4_000.0,
            memory_ratio: 0.97,
            loop_lag_ms: 300,
            ..Default::default()
        };
        let score = score_from(&metrics);
        assert_eq!(score.performance, 2.0);
        assert_eq!(score.stability, 2.0);
        assert_eq!(score.efficiency, 2.0);
        assert_eq!(score.maintainability, 2.0);
        assert_eq!(score.security, 10.0);
        // 2*.30 + 2*.25 + 10*.15 + 2*.10 + 2*.20
        assert_eq!(score.overall, 3.2);
    }

    #[test]
    fn rejections_drag_security_down() {
        let metrics = HealthMetrics {
            requests: 10,
            rejections: BTreeMap::from([("RateLimited".to_owned(), 4)]),
            ..Default::default()
        };
        assert_eq!(score_from(&metrics).security, 4.0);
    }

    #[test]
    fn spans_record_once_and_drop_counts_as_failure() {
        let m = monitor(Arc::default());
        m.start_span("/tasks").end(true);
        drop(m.start_span("/tasks"));
        let metrics = m.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.routes["/tasks"].requests, 2);
    }

    #[test]
    fn window_resets_after_expiry() {
        let m = Arc::new(HealthMonitor::with_window(
            Duration::from_millis(20),
            6.0,
            Arc::new(TracingAlertSink),
        ));
        m.start_span("/health").end(false);
        assert_eq!(m.metrics().errors, 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(m.metrics().errors, 0);
    }

    #[test]
    fn alerts_are_rate_limited_per_key() {
        let sink = Arc::new(CollectingSink::default());
        let m = monitor(sink.clone());
        m.alert(Alert::QueueSoftLimit { pending: 51, limit: 50 });
        m.alert(Alert::QueueSoftLimit { pending: 52, limit: 50 });
        for key in ["A", "B"] {
            m.alert(Alert::ConfigClamped {
                key: key.into(),
                requested: "0".into(),
                applied: "1".into(),
                reason: "below minimum".into(),
            });
        }
        let kinds: Vec<&str> = sink.0.lock().unwrap().iter().map(Alert::kind).collect();
        assert_eq!(kinds, ["queue_soft_limit", "config_clamped", "config_clamped"]);
    }

    #[test]
    fn threshold_above_healthy_band_still_reports_unhealthy() {
        let sink = Arc::new(CollectingSink::default());
        let m = Arc::new(HealthMonitor::with_window(Duration::from_secs(60), 9.0, sink.clone()));
        for _ in 0..4 {
            m.start_span("/convert/{category}").end(false);
        }
        // Every request failed, so stability caps the score at 8.0.
        let report = m.report();
        assert!(report.score.overall <= 8.0, "{}", report.score.overall);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(matches!(sink.0.lock().unwrap()[0], Alert::LowHealthScore { threshold, .. } if threshold == 9.0));
    }

    #[tokio::test]
    async fn score_refreshes_without_a_report_request() {
        let sink = Arc::new(CollectingSink::default());
        let m = Arc::new(HealthMonitor::with_window(Duration::from_secs(60), 9.0, sink.clone()));
        let mut config = ServiceConfig::default();
        config.health_alert_threshold = 9.0;
        let policy = PollPolicy::new(&config);
        let load = SchedulerLoad { queued: 0, running: 0, capacity: 4 };
        let calm = policy.scaled_ms(load, m.last_score());

        for _ in 0..4 {
            m.start_span("/tasks").end(false);
        }
        let refresher = m.spawn_score_refresh(Duration::from_millis(10));
        let deadline = Instant::now() + Duration::from_secs(5);
        while m.last_score().is_none() {
            assert!(Instant::now() < deadline, "score never refreshed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        refresher.abort();

        assert_eq!(policy.scaled_ms(load, m.last_score()), calm * 1.5);
        assert!(matches!(sink.0.lock().unwrap()[0], Alert::LowHealthScore { .. }));
    }

    #[test]
    fn low_score_raises_alert() {
        let sink = Arc::new(CollectingSink::default());
        let m = Arc::new(HealthMonitor::with_window(Duration::from_secs(60), 10.5, sink.clone()));
        let report = m.report();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(m.last_score(), Some(report.score.overall));
        assert!(matches!(sink.0.lock().unwrap()[0], Alert::LowHealthScore { .. }));
    }
}
