//! Admission control: a sliding-window rate limiter plus per-client and
//! global running-task counters.
//!
//! All state lives behind one mutex so that an `acquire` checks and bumps
//! both counters atomically; there is never a partial increment. The same
//! counters bound synchronous requests and scheduled tasks: HTTP handlers
//! take a permit with [`AdmissionGate::acquire`] and fail fast, the
//! scheduler's dispatch loop waits with [`AdmissionGate::acquire_wait`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config::ServiceConfig;

/// Limits enforced by the gate, copied out of [`ServiceConfig`].
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    pub window: Duration,
    pub max_per_client: u32,
    pub client_concurrency: u32,
    pub global_concurrency: u32,
}

impl From<&ServiceConfig> for AdmissionLimits {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            window: config.rate_window,
            max_per_client: config.rate_max_per_client,
            client_concurrency: config.client_concurrency,
            global_concurrency: config.global_concurrency,
        }
    }
}

/// Outcome of [`AdmissionGate::check_rate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls left in the current window after this one.
    pub remaining: u32,
    /// When rejected, how long until the oldest call leaves the window.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Default)]
struct Bucket {
    hits: VecDeque<Instant>,
    running: u32,
}

#[derive(Debug, Default)]
struct GateState {
    buckets: HashMap<String, Bucket>,
    running_total: u32,
}

#[derive(Debug)]
pub struct AdmissionGate {
    limits: AdmissionLimits,
    state: Mutex<GateState>,
    released: Notify,
}

impl AdmissionGate {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(GateState::default()),
            released: Notify::new(),
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    pub fn check_rate(&self, client: &str) -> RateDecision {
        self.check_rate_at(client, Instant::now())
    }

    /// Count the calls in `[now - window, now)`; admit and record `now` only
    /// while that count is below the per-client maximum.
    pub fn check_rate_at(&self, client: &str, now: Instant) -> RateDecision {
        let window = self.limits.window;
        let max = self.limits.max_per_client;
        let mut state = self.lock();
        let bucket = state.buckets.entry(client.to_owned()).or_default();

        if let Some(cutoff) = now.checked_sub(window) {
            while bucket.hits.front().is_some_and(|t| *t < cutoff) {
                bucket.hits.pop_front();
            }
        }

        let used = bucket.hits.len() as u32;
        if used < max {
            bucket.hits.push_back(now);
            return RateDecision {
                allowed: true,
                remaining: max - used - 1,
                retry_after: None,
            };
        }

        let retry_after = bucket
            .hits
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(window);
        tracing::debug!(client, used, max, "rate limit reached");
        RateDecision {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after.max(Duration::from_millis(1))),
        }
    }

    /// Take one running slot for `client` iff both its own cap and the global
    /// cap have room. Nothing changes on refusal.
    pub fn try_acquire(&self, client: &str) -> bool {
        let mut state = self.lock();
        if state.running_total >= self.limits.global_concurrency {
            return false;
        }
        let bucket = state.buckets.entry(client.to_owned()).or_default();
        if bucket.running >= self.limits.client_concurrency {
            return false;
        }
        bucket.running += 1;
        state.running_total += 1;
        true
    }

    /// Give back one slot. Saturates at zero on both counters.
    pub fn release(&self, client: &str) {
        let mut state = self.lock();
        let released = match state.buckets.get_mut(client) {
            Some(bucket) if bucket.running > 0 => {
                bucket.running -= 1;
                true
            }
            _ => false,
        };
        if released {
            state.running_total = state.running_total.saturating_sub(1);
            drop(state);
            self.released.notify_waiters();
        }
    }

    /// Like [`Self::try_acquire`], but returns an RAII permit that releases the
    /// slot when dropped.
    pub fn acquire(self: &Arc<Self>, client: &str) -> Option<ConcurrencyPermit> {
        self.try_acquire(client).then(|| ConcurrencyPermit {
            gate: Arc::clone(self),
            client: client.to_owned(),
        })
    }

    /// Wait until `client` fits under both caps, then take the slot.
    pub async fn acquire_wait(self: &Arc<Self>, client: &str) -> ConcurrencyPermit {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();
            if let Some(permit) = self.acquire(client) {
                return permit;
            }
            notified.await;
        }
    }

    pub fn running(&self, client: &str) -> u32 {
        self.lock().buckets.get(client).map_or(0, |b| b.running)
    }

    pub fn running_total(&self) -> u32 {
        self.lock().running_total
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // Every critical section leaves the counters consistent, so a
        // poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII guard for one running slot; dropping it calls [`AdmissionGate::release`].
pub struct ConcurrencyPermit {
    gate: Arc<AdmissionGate>,
    client: String,
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("client", &self.client)
            .finish()
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.gate.release(&self.client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn gate(window_ms: u64, max: u32, client_cap: u32, global_cap: u32) -> AdmissionGate {
        AdmissionGate::new(AdmissionLimits {
            window: Duration::from_millis(window_ms),
            max_per_client: max,
            client_concurrency: client_cap,
            global_concurrency: global_cap,
        })
    }

    #[test]
    fn rate_limit_counts_down_then_rejects() {
        let g = gate(1_000, 3, 1, 1);
        let t0 = Instant::now();
        let remaining: Vec<u32> = (0..3).map(|_| g.check_rate_at("a", t0).remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let rejected = g.check_rate_at("a", t0 + Duration::from_millis(400));
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Some(Duration::from_millis(600)));

        // Other clients have their own window.
        assert!(g.check_rate_at("b", t0).allowed);
    }

    #[test]
    fn rejected_calls_are_not_recorded() {
        let g = gate(1_000, 1, 1, 1);
        let t0 = Instant::now();
        assert!(g.check_rate_at("a", t0).allowed);
        for i in 1..10 {
            assert!(!g.check_rate_at("a", t0 + Duration::from_millis(i * 50)).allowed);
        }
        // Only the first call occupies the window, so it frees at t0 + 1s.
        assert!(g.check_rate_at("a", t0 + Duration::from_millis(1_001)).allowed);
    }

    #[test]
    fn acquire_is_all_or_nothing() {
        let g = gate(1_000, 10, 2, 3);
        assert!(g.try_acquire("a"));
        assert!(g.try_acquire("a"));
        assert!(!g.try_acquire("a"), "client cap");
        assert!(g.try_acquire("b"));
        assert!(!g.try_acquire("c"), "global cap");
        assert_eq!(g.running("c"), 0);
        assert_eq!(g.running_total(), 3);
    }

    #[test]
    fn release_never_underflows() {
        let g = gate(1_000, 10, 2, 2);
        g.release("ghost");
        assert!(g.try_acquire("a"));
        g.release("a");
        g.release("a");
        assert_eq!(g.running("a"), 0);
        assert_eq!(g.running_total(), 0);
    }

    #[test]
    fn permit_releases_on_drop() {
        let g = Arc::new(gate(1_000, 10, 1, 1));
        let permit = g.acquire("a").expect("slot free");
        assert!(g.acquire("a").is_none());
        drop(permit);
        assert_eq!(g.running_total(), 0);
        assert!(g.acquire("a").is_some());
    }

    #[tokio::test]
    async fn waiter_takes_the_slot_once_released() {
        let g = Arc::new(gate(1_000, 10, 1, 1));
        let held = g.acquire("a").expect("slot free");

        let waiter = tokio::spawn({
            let g = Arc::clone(&g);
            async move { g.acquire_wait("b").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "global cap holds the waiter back");

        drop(held);
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken by release")
            .unwrap();
        assert_eq!(g.running("b"), 1);
        drop(permit);
        assert_eq!(g.running_total(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u8),
        Release(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4).prop_map(Op::Acquire),
            (0u8..4).prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn counters_stay_within_caps(
            ops in prop::collection::vec(op(), 0..200),
            client_cap in 1u32..4,
            global_cap in 1u32..6,
        ) {
            let g = gate(1_000, 10, client_cap, global_cap);
            for op in ops {
                match op {
                    Op::Acquire(c) => { g.try_acquire(&c.to_string()); }
                    Op::Release(c) => g.release(&c.to_string()),
                }
                let per_client: Vec<u32> = (0u8..4).map(|c| g.running(&c.to_string())).collect();
                prop_assert!(g.running_total() <= global_cap);
                prop_assert!(per_client.iter().all(|r| *r <= client_cap));
                prop_assert_eq!(per_client.iter().sum::<u32>(), g.running_total());
            }
        }

        #[test]
        fn at_most_max_calls_in_any_window(
            gaps in prop::collection::vec(0u64..400, 1..120),
            max in 1u32..6,
        ) {
            let window = 1_000u64;
            let g = gate(window, max, 1, 1);
            let t0 = Instant::now();
            let mut at = 0u64;
            let mut accepted = Vec::new();
            for gap in gaps {
                at += gap;
                if g.check_rate_at("c", t0 + Duration::from_millis(at)).allowed {
                    accepted.push(at);
                }
            }
            for (i, start) in accepted.iter().enumerate() {
                let in_window = accepted[i..].iter().take_while(|t| **t < start + window).count();
                prop_assert!(in_window as u32 <= max);
            }
        }
    }
}
