// =============================================================================
// Request-weight gate — mutex-guarded weight + window start, block-until-reset
// =============================================================================
//
// Binance enforces a rolling 60-second request-weight budget. Unlike a
// hard-cap atomic counter, the gate here also tracks *when* the current
// window began so a caller whose declared weight would overflow the budget
// can be made to wait out the remainder of the window rather than be
// rejected outright.
//
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Hard budget per rolling 60-second window.
pub const WEIGHT_LIMIT_PER_MINUTE: u32 = 6000;
const WINDOW: Duration = Duration::from_secs(60);

struct Window {
    used_weight: u32,
    window_start: Instant,
}

/// Tracks request-weight consumption in the current 60-second window and
/// blocks callers whose next call would exceed the budget until the window
/// rolls over.
pub struct WeightGate {
    inner: Mutex<Window>,
}

impl WeightGate {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Window {
                used_weight: 0,
                window_start: Instant::now(),
            }),
        }
    }

    /// Reserve `weight` units of budget, awaiting a window roll-over if
    /// needed. Returns once the reservation has been recorded.
    pub async fn acquire(&self, weight: u32) {
        loop {
            let wait = {
                let mut window = self.inner.lock();
                if window.window_start.elapsed() >= WINDOW {
                    window.used_weight = 0;
                    window.window_start = Instant::now();
                }

                if window.used_weight + weight <= WEIGHT_LIMIT_PER_MINUTE {
                    window.used_weight += weight;
                    debug!(used = window.used_weight, weight, "weight reserved");
                    return;
                }

                let remaining = WINDOW.saturating_sub(window.window_start.elapsed());
                warn!(
                    used = window.used_weight,
                    weight,
                    wait_secs = remaining.as_secs(),
                    "weight budget exhausted, blocking until window reset"
                );
                remaining
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Replace the local counter with the exchange's authoritative
    /// used-weight header value, when present.
    pub fn update_from_header(&self, used_weight_1m: Option<u32>) {
        if let Some(w) = used_weight_1m {
            let mut window = self.inner.lock();
            window.used_weight = w;
        }
    }

    pub fn current_usage(&self) -> u32 {
        self.inner.lock().used_weight
    }
}

impl Default for WeightGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_does_not_block_within_budget() {
        let gate = WeightGate::new();
        gate.acquire(100).await;
        assert_eq!(gate.current_usage(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_until_window_reset() {
        let gate = WeightGate::new();
        gate.acquire(5995).await;

        tokio::time::advance(Duration::from_secs(10)).await;

        let start = tokio::time::Instant::now();
        gate.acquire(20).await;
        let elapsed = start.elapsed();

        // Window started ~10s ago; acquiring past the limit should have
        // blocked for roughly the remaining ~50s before resetting.
        assert!(elapsed >= Duration::from_secs(49));
        assert_eq!(gate.current_usage(), 20);
    }

    #[test]
    fn header_update_overrides_local_counter() {
        let gate = WeightGate::new();
        gate.update_from_header(Some(4321));
        assert_eq!(gate.current_usage(), 4321);
    }
}
