//! Admission gate for the network's published per-window request caps.
//!
//! Fixed-window counters per endpoint class. The gate is admission control,
//! not a queue: fairness among concurrent waiters is best-effort and no
//! ordering is guaranteed between unrelated callers.

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use skywrite_model::EndpointLimits;

use crate::error::{Error, Result};

/// Endpoint class names for the two mandatory buckets.
pub const ENDPOINT_API: &str = "api";
pub const ENDPOINT_OAUTH: &str = "oauth";

#[derive(Debug)]
struct Window {
    max: u32,
    window_len: Duration,
    count: u32,
    resets_at: Instant,
}

impl Window {
    fn new(max: u32, window_len: Duration) -> Self {
        Self {
            max,
            window_len,
            count: 0,
            resets_at: Instant::now() + window_len,
        }
    }

    fn roll_if_elapsed(&mut self, now: Instant) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + self.window_len;
        }
    }

    /// Time until admission could next succeed, ignoring other contenders.
    fn wait_for(&self, now: Instant) -> Duration {
        self.resets_at.saturating_duration_since(now)
    }
}

/// Snapshot of one endpoint class, for health reporting.
#[derive(Debug, Clone)]
pub struct GateSnapshot {
    pub endpoint: String,
    pub used: u32,
    pub max: u32,
    pub resets_in: Duration,
}

/// Multi-window fixed-counter admission gate keyed by endpoint class.
#[derive(Debug)]
pub struct RateGate {
    windows: DashMap<String, Window>,
}

impl RateGate {
    /// Gate with the two mandatory buckets registered.
    pub fn new(limits: &EndpointLimits) -> Self {
        let gate = Self {
            windows: DashMap::new(),
        };
        gate.register(ENDPOINT_API, limits.api.limit, limits.api.window);
        gate.register(ENDPOINT_OAUTH, limits.oauth.limit, limits.oauth.window);
        gate
    }

    /// Register an additional endpoint class. Re-registering replaces the
    /// window and resets its counter.
    pub fn register(&self, endpoint: &str, max: u32, window_len: Duration) {
        self.windows
            .insert(endpoint.to_string(), Window::new(max, window_len));
    }

    /// Whether admitting `n` requests now would break the cap. Non-mutating.
    pub fn would_exceed(&self, endpoint: &str, n: u32) -> bool {
        let Some(window) = self.windows.get(endpoint) else {
            return false;
        };
        let now = Instant::now();
        let effective_count = if now >= window.resets_at { 0 } else { window.count };
        effective_count + n > window.max
    }

    /// Count `n` admitted requests. Returns the remaining budget in the
    /// current window.
    pub fn record(&self, endpoint: &str, n: u32) -> u32 {
        let Some(mut window) = self.windows.get_mut(endpoint) else {
            return u32::MAX;
        };
        let now = Instant::now();
        window.roll_if_elapsed(now);
        window.count = window.count.saturating_add(n);
        window.max.saturating_sub(window.count)
    }

    /// Block until `n` requests can be admitted, then count them. Polls
    /// once per window reset plus a small jitter; cancellation returns
    /// `Cancelled` without touching the counter.
    pub async fn wait_for_availability(
        &self,
        endpoint: &str,
        n: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let wait = {
                let Some(mut window) = self.windows.get_mut(endpoint) else {
                    return Ok(());
                };
                let now = Instant::now();
                window.roll_if_elapsed(now);
                if window.count + n <= window.max {
                    window.count += n;
                    return Ok(());
                }
                window.wait_for(now).min(window.window_len)
            };

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(10..250));
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait + jitter) => {}
            }
        }
    }

    pub fn snapshot(&self) -> Vec<GateSnapshot> {
        let now = Instant::now();
        self.windows
            .iter()
            .map(|entry| {
                let used = if now >= entry.resets_at { 0 } else { entry.count };
                GateSnapshot {
                    endpoint: entry.key().clone(),
                    used,
                    max: entry.max,
                    resets_in: entry.wait_for(now),
                }
            })
            .collect()
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new(&EndpointLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_gate(max: u32, window: Duration) -> RateGate {
        let gate = RateGate {
            windows: DashMap::new(),
        };
        gate.register("test", max, window);
        gate
    }

    #[test]
    fn would_exceed_is_non_mutating() {
        let gate = tiny_gate(2, Duration::from_secs(60));
        assert!(!gate.would_exceed("test", 2));
        assert!(gate.would_exceed("test", 3));
        // Asking did not consume budget.
        assert_eq!(gate.record("test", 2), 0);
        assert!(gate.would_exceed("test", 1));
    }

    #[test]
    fn record_counts_down_remaining() {
        let gate = tiny_gate(5, Duration::from_secs(60));
        assert_eq!(gate.record("test", 1), 4);
        assert_eq!(gate.record("test", 3), 1);
        assert_eq!(gate.record("test", 2), 0);
    }

    #[test]
    fn unknown_endpoint_is_unlimited() {
        let gate = tiny_gate(1, Duration::from_secs(60));
        assert!(!gate.would_exceed("other", 1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over_after_reset() {
        let gate = tiny_gate(1, Duration::from_millis(100));
        let cancel = CancellationToken::new();

        gate.wait_for_availability("test", 1, &cancel).await.unwrap();
        assert!(gate.would_exceed("test", 1));

        // Second admission has to wait for the window to elapse.
        gate.wait_for_availability("test", 1, &cancel).await.unwrap();
        assert!(gate.would_exceed("test", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_leaves_state_untouched() {
        let gate = tiny_gate(1, Duration::from_secs(300));
        let cancel = CancellationToken::new();
        gate.wait_for_availability("test", 1, &cancel).await.unwrap();

        let blocked = gate.wait_for_availability("test", 1, &cancel);
        cancel.cancel();
        assert!(matches!(blocked.await, Err(Error::Cancelled)));

        // The failed waiter consumed nothing.
        let snap = gate.snapshot();
        assert_eq!(snap[0].used, 1);
    }
}
