use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Observable circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct Inner {
    state: CircuitState,
    failures: u32,
    /// Bumped on every transition out of `Open`. A cooldown timer captures
    /// the generation it was armed under and no-ops if it no longer matches,
    /// which makes cancellation idempotent from any thread.
    generation: u64,
}

/// Three-state breaker guarding the remote queue.
///
/// `Closed` counts consecutive failures; at the threshold the breaker opens
/// and arms a one-shot cooldown timer. The timer (or an external probe
/// success signal) moves it to `HalfOpen`, where the next write acts as the
/// probe. Note the timer does not issue a probe itself: if writes stop, the
/// breaker idles in `HalfOpen` until the next write arrives.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    failure_threshold: u32,
    cooldown: Duration,
    this: Weak<CircuitBreaker>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                generation: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            this: this.clone(),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.generation += 1;
                drop(inner);
                tracing::info!("circuit breaker closed after successful probe");
            }
            // No writes are routed while open; a straggler success changes nothing.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                let failures = inner.failures;
                if failures >= self.failure_threshold {
                    let generation = self.open(&mut inner);
                    drop(inner);
                    tracing::warn!(failures, "circuit breaker opened");
                    self.arm_cooldown(generation);
                } else {
                    drop(inner);
                    tracing::debug!(
                        failures,
                        threshold = self.failure_threshold,
                        "circuit breaker failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                let generation = self.open(&mut inner);
                drop(inner);
                tracing::warn!("probe failed; circuit breaker re-opened");
                self.arm_cooldown(generation);
            }
            CircuitState::Open => {}
        }
    }

    /// Externally forced `Open -> HalfOpen`, used when the failover detector
    /// announces a new master or a write probe succeeds out of band. Cancels
    /// the pending cooldown and clears the failure count. A no-op outside
    /// `Open`.
    pub fn transition_to_half_open(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return;
        }
        inner.state = CircuitState::HalfOpen;
        inner.failures = 0;
        inner.generation += 1;
        drop(inner);
        tracing::info!("circuit breaker forced to half-open");
    }

    /// Back to `Closed(0)`; cancels any pending cooldown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.generation += 1;
    }

    fn open(&self, inner: &mut Inner) -> u64 {
        inner.state = CircuitState::Open;
        inner.generation += 1;
        inner.generation
    }

    fn arm_cooldown(&self, generation: u64) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            this.cooldown_elapsed(generation);
        });
    }

    fn cooldown_elapsed(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open || inner.generation != generation {
            // Timer was cancelled by a forced transition or a reset.
            return;
        }
        inner.state = CircuitState::HalfOpen;
        inner.failures = 0;
        inner.generation += 1;
        drop(inner);
        tracing::info!("circuit breaker cooldown elapsed; half-open");
    }
}

#[cfg(test)]
mod tests {
    use super::{CircuitBreaker, CircuitState};
    use std::time::Duration;

    const COOLDOWN: Duration = Duration::from_millis(2000);

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(5, COOLDOWN);
        for expected in 1..5u32 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
            assert_eq!(breaker.failure_count(), expected);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count_while_closed() {
        let breaker = CircuitBreaker::new(5, COOLDOWN);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_moves_open_to_half_open() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(COOLDOWN + Duration::from_millis(100)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_probe_outcomes() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        tokio::time::sleep(COOLDOWN + Duration::from_millis(100)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Failed probe re-opens and re-arms the cooldown.
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        tokio::time::sleep(COOLDOWN + Duration::from_millis(100)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Successful probe closes.
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_half_open_cancels_pending_cooldown() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.transition_to_half_open();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        // The stale timer firing later must not disturb the closed state.
        tokio::time::sleep(COOLDOWN * 2).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_half_open_is_a_noop_outside_open() {
        let breaker = CircuitBreaker::new(5, COOLDOWN);
        breaker.transition_to_half_open();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_to_closed_and_cancels_timer() {
        let breaker = CircuitBreaker::new(1, COOLDOWN);
        breaker.record_failure();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        tokio::time::sleep(COOLDOWN * 2).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
