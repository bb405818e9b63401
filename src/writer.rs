use crate::breaker::{CircuitBreaker, CircuitState};
use crate::car::Car;
use crate::errors::{classify, ErrorKind};
use crate::metrics::FailoverMetrics;
use crate::queue::{EnqueueOpts, JobQueue, CAR_JOB};
use crate::state::{SeederMode, StateManager};
use crate::store::SqliteStore;
use eyre::Result;
use std::sync::Arc;
use std::time::Duration;

/// Backoffs between durable-save retries; after these are exhausted the
/// record is reported lost.
const SAVE_RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(200)];

/// Routes each generated car to the remote queue or the durable store,
/// feeding the circuit breaker with the outcome.
pub struct WriteHandler<Q: JobQueue> {
    queue: Arc<Q>,
    store: SqliteStore,
    breaker: Arc<CircuitBreaker>,
    state: Arc<StateManager>,
    metrics: Arc<FailoverMetrics>,
}

impl<Q: JobQueue> WriteHandler<Q> {
    pub fn new(
        queue: Arc<Q>,
        store: SqliteStore,
        breaker: Arc<CircuitBreaker>,
        state: Arc<StateManager>,
        metrics: Arc<FailoverMetrics>,
    ) -> Self {
        Self {
            queue,
            store,
            breaker,
            state,
            metrics,
        }
    }

    pub async fn write_car(&self, car: Car) -> Result<()> {
        // A half-open breaker overrides the mode: the next write probes the
        // remote regardless of where records currently route.
        let probe = self.breaker.state() == CircuitState::HalfOpen;
        if probe || self.state.mode() == SeederMode::Redis {
            self.attempt_remote(car, probe).await
        } else {
            self.save_durably(car).await
        }
    }

    async fn attempt_remote(&self, car: Car, probe: bool) -> Result<()> {
        if self.breaker.state() == CircuitState::Open {
            // Breaker opened between the routing check and this attempt.
            self.enter_sqlite_mode();
            return self.save_durably(car).await;
        }

        match self.queue.enqueue(CAR_JOB, &car, EnqueueOpts::default()).await {
            Ok(job_id) => {
                self.breaker.record_success();
                if self.state.set_mode(SeederMode::Redis) == SeederMode::Sqlite {
                    tracing::info!(probe, "redis delivery restored");
                    self.metrics.record_state_transition_to_redis();
                }
                tracing::trace!(job_id = %job_id, "car enqueued");
                Ok(())
            }
            Err(err) => match classify(&err) {
                ErrorKind::Transport => {
                    self.breaker.record_failure();
                    tracing::warn!(
                        error = %err,
                        failures = self.breaker.failure_count(),
                        probe,
                        "queue write failed"
                    );
                    if self.breaker.state() == CircuitState::Open {
                        self.enter_sqlite_mode();
                        self.save_durably(car).await
                    } else {
                        Err(err)
                    }
                }
                // Validation and the like: not the transport's fault, so the
                // breaker stays out of it and the caller decides.
                _ => Err(err),
            },
        }
    }

    fn enter_sqlite_mode(&self) {
        if self.state.set_mode(SeederMode::Sqlite) == SeederMode::Redis {
            self.metrics.record_master_failure();
            self.metrics.record_state_transition_to_sqlite();
        }
    }

    async fn save_durably(&self, car: Car) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.save_car(car.clone()).await {
                Ok(()) => {
                    self.metrics.increment_sqlite_fallback();
                    return Ok(());
                }
                Err(err) if attempt < SAVE_RETRY_BACKOFF.len() => {
                    tracing::warn!(
                        error = %err,
                        attempt = attempt + 1,
                        kind = ?classify(&err),
                        "durable save failed; retrying"
                    );
                    tokio::time::sleep(SAVE_RETRY_BACKOFF[attempt]).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(error = %err, "durable save retries exhausted; data will be lost");
                    return Err(err);
                }
            }
        }
    }
}
