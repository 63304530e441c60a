//! Adaptive poll hints and the per-client minimum poll interval.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::ServiceConfig;
use crate::error::ConvertError;
use crate::scheduler::SchedulerLoad;
use crate::scheduler::TaskId;

/// Health factor applied when the last score fell below the alert threshold.
const UNHEALTHY_FACTOR: f64 = 1.5;
const JITTER: f64 = 0.10;

/// Computes the `retryAfterMs` hint returned with every progress poll.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
    pub alert_threshold: f64,
}

impl PollPolicy {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            base: config.poll_base,
            min: config.poll_min_interval,
            max: config.poll_max,
            alert_threshold: config.health_alert_threshold,
        }
    }

    /// The hint before jitter: base scaled by queue and slot saturation, and
    /// by 1.5 when the service is unhealthy.
    pub fn scaled_ms(&self, load: SchedulerLoad, health_score: Option<f64>) -> f64 {
        let capacity = load.capacity.max(1) as f64;
        let saturation = 1.0 + load.queued as f64 / capacity + load.running as f64 / capacity;
        let health = match health_score {
            Some(score) if score < self.alert_threshold => UNHEALTHY_FACTOR,
            _ => 1.0,
        };
        self.base.as_millis() as f64 * saturation * health
    }

    /// `scaled_ms` with ±10 % jitter, clamped to `[min, max]`.
    pub fn retry_after_ms(&self, load: SchedulerLoad, health_score: Option<f64>) -> u64 {
        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        let jittered = self.scaled_ms(load, health_score) * (1.0 + jitter);
        let (min, max) = (self.min.as_millis() as f64, self.max.as_millis() as f64);
        jittered.clamp(min, max).round() as u64
    }
}

/// Rejects polls of the same task by the same client that arrive closer
/// together than the minimum interval.
#[derive(Debug)]
pub struct PollGuard {
    min_interval: Duration,
    last_seen: Mutex<HashMap<(String, TaskId), Instant>>,
}

impl PollGuard {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client: &str, task: &TaskId) -> Result<(), ConvertError> {
        self.check_at(client, task, Instant::now())
    }

    pub fn check_at(&self, client: &str, task: &TaskId, now: Instant) -> Result<(), ConvertError> {
        let mut seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let key = (client.to_owned(), task.clone());
        if let Some(last) = seen.get(&key) {
            if now.saturating_duration_since(*last) < self.min_interval {
                return Err(ConvertError::PollTooFrequent {
                    retry_after_ms: self.min_interval.as_millis() as u64,
                });
            }
        }
        seen.insert(key, now);

        // Forget pollers that went quiet so the map tracks active clients only.
        let stale = self.min_interval.saturating_mul(10);
        seen.retain(|_, at| now.saturating_duration_since(*at) < stale);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PollPolicy {
        PollPolicy {
            base: Duration::from_millis(1_000),
            min: Duration::from_millis(500),
            max: Duration::from_millis(10_000),
            alert_threshold: 6.0,
        }
    }

    fn load(queued: usize, running: usize, capacity: usize) -> SchedulerLoad {
        SchedulerLoad { queued, running, capacity }
    }

    #[test]
    fn idle_service_returns_roughly_base() {
        let ms = policy().retry_after_ms(load(0, 0, 4), Some(9.0));
        assert!((900..=1_100).contains(&ms), "{ms}");
    }

    #[test]
    fn saturation_and_poor_health_scale_up() {
        let p = policy();
        assert_eq!(p.scaled_ms(load(4, 4, 4), None), 3_000.0);
        assert_eq!(p.scaled_ms(load(4, 4, 4), Some(5.0)), 4_500.0);
    }

    #[test]
    fn hint_is_clamped() {
        let ms = policy().retry_after_ms(load(400, 4, 4), Some(1.0));
        assert_eq!(ms, 10_000);
    }

    #[test]
    fn second_poll_within_interval_is_rejected_with_minimum() {
        let guard = PollGuard::new(Duration::from_millis(1_000));
        let task = TaskId::new();
        let t0 = Instant::now();
        guard.check_at("alice", &task, t0).unwrap();

        let err = guard
            .check_at("alice", &task, t0 + Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ConvertError::PollTooFrequent { retry_after_ms: 1_000 }));

        // Other clients and other tasks are tracked separately.
        guard.check_at("bob", &task, t0 + Duration::from_millis(200)).unwrap();
        guard.check_at("alice", &TaskId::new(), t0 + Duration::from_millis(200)).unwrap();

        guard.check_at("alice", &task, t0 + Duration::from_millis(1_000)).unwrap();
    }
}
