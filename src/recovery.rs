use crate::breaker::{CircuitBreaker, CircuitState};
use crate::metrics::FailoverMetrics;
use crate::queue::{EnqueueOpts, JobQueue, QueueEvent, CAR_JOB};
use crate::state::{SeederMode, StateManager};
use crate::store::SqliteStore;
use eyre::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

const PING_TIMEOUT: Duration = Duration::from_secs(2);
/// Claims older than this are considered abandoned by a dead instance.
const STALE_CLAIM_MAX_AGE: Duration = Duration::from_secs(5 * 60);
const RECONNECT_SETTLE: Duration = Duration::from_millis(500);
const RECONNECT_STABILIZE: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Records claimed per drain iteration.
    pub chunk_size: usize,
    /// Minimum gap between two drains.
    pub drain_cooldown: Duration,
    /// Period of the backup health probe.
    pub check_interval: Duration,
    /// Minimum spacing between forced reconnects.
    pub reconnect_cooldown: Duration,
    /// Master to act on in `+switch-master` messages; `None` accepts any
    /// (direct mode never receives them).
    pub master_name: Option<String>,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            drain_cooldown: Duration::from_millis(10_000),
            check_interval: Duration::from_millis(5_000),
            reconnect_cooldown: Duration::from_millis(2_000),
            master_name: None,
        }
    }
}

/// Detects remote recovery, drives breaker/state transitions and drains the
/// durable store back into the queue.
///
/// Two independent signals feed it: sentinel `+switch-master` events (fast
/// path) and the periodic health probe (backup path). Both funnel into the
/// same guarded `trigger_recovery`.
pub struct RecoveryManager<Q: JobQueue> {
    queue: Arc<Q>,
    store: SqliteStore,
    breaker: Arc<CircuitBreaker>,
    state: Arc<StateManager>,
    metrics: Arc<FailoverMetrics>,
    opts: RecoveryOptions,
    is_handling_reconnection: AtomicBool,
    is_recovering: AtomicBool,
    last_reconnect: Mutex<Option<Instant>>,
    last_drain: Mutex<Option<Instant>>,
}

impl<Q: JobQueue> RecoveryManager<Q> {
    pub fn new(
        queue: Arc<Q>,
        store: SqliteStore,
        breaker: Arc<CircuitBreaker>,
        state: Arc<StateManager>,
        metrics: Arc<FailoverMetrics>,
        opts: RecoveryOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            breaker,
            state,
            metrics,
            opts,
            is_handling_reconnection: AtomicBool::new(false),
            is_recovering: AtomicBool::new(false),
            last_reconnect: Mutex::new(None),
            last_drain: Mutex::new(None),
        })
    }

    /// Backup path: runs until shutdown, probing the remote while degraded
    /// and kicking off drains whenever pending records exist.
    pub async fn run_health_probe(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.opts.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => {}
            }
            self.health_probe_tick().await;
        }
    }

    async fn health_probe_tick(&self) {
        if self.state.mode() == SeederMode::Sqlite && self.breaker.state() == CircuitState::Open {
            match self.queue.test_write().await {
                Ok(()) => {
                    tracing::info!("write probe succeeded while circuit open; half-opening");
                    self.breaker.transition_to_half_open();
                }
                Err(err) => {
                    tracing::debug!(error = %err, "write probe failed; remote still down");
                }
            }
        }

        match self.store.pending_count().await {
            Ok(0) => {}
            Ok(pending) => {
                tracing::debug!(pending, "pending records found by health probe");
                self.trigger_recovery().await;
            }
            Err(err) => tracing::warn!(error = %err, "failed to read pending count"),
        }
    }

    /// Consumes transport events until shutdown.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<QueueEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            match event {
                QueueEvent::SwitchMaster { master, old, new } => {
                    self.handle_switch_master(&master, old, new).await;
                }
                QueueEvent::Ready => self.handle_connection_ready().await,
            }
        }
    }

    pub async fn handle_switch_master(
        &self,
        master: &str,
        old: (String, u16),
        new: (String, u16),
    ) {
        if let Some(expected) = &self.opts.master_name {
            if master != expected {
                tracing::debug!(master, expected, "ignoring switch-master for other master");
                return;
            }
        }
        if self.is_handling_reconnection.swap(true, Ordering::AcqRel) {
            tracing::debug!("reconnection already in progress; ignoring switch-master");
            return;
        }

        let admitted = {
            let mut last = self.last_reconnect.lock();
            match *last {
                Some(at) if at.elapsed() < self.opts.reconnect_cooldown => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if admitted {
            tracing::info!(
                master,
                old = %format!("{}:{}", old.0, old.1),
                new = %format!("{}:{}", new.0, new.1),
                "master switch announced; forcing reconnection"
            );
            if let Err(err) = self.force_reconnection().await {
                tracing::error!(error = %err, "forced reconnection failed");
            }
        } else {
            tracing::debug!("switch-master within reconnect cooldown; skipped");
        }
        self.is_handling_reconnection.store(false, Ordering::Release);
    }

    async fn force_reconnection(&self) -> Result<()> {
        self.queue.disconnect().await;
        tokio::time::sleep(RECONNECT_SETTLE).await;
        self.queue.connect().await?;
        // Let the freshly promoted master settle before probing it.
        tokio::time::sleep(RECONNECT_STABILIZE).await;
        self.queue.test_write().await?;

        if self.state.mode() == SeederMode::Sqlite {
            self.metrics.record_sentinel_promotion();
            self.breaker.transition_to_half_open();
            self.trigger_recovery().await;
        }
        Ok(())
    }

    pub async fn handle_connection_ready(&self) {
        if self.is_handling_reconnection.load(Ordering::Acquire) {
            // The switch-master path is mid-reconnect and will finish the job.
            return;
        }
        tokio::time::sleep(RECONNECT_SETTLE).await;
        if self.state.mode() != SeederMode::Sqlite {
            return;
        }
        // A write probe, not `is_redis_available`: the breaker is usually
        // still open here and must not veto its own recovery signal.
        match self.queue.test_write().await {
            Ok(()) => {
                tracing::info!("transport ready and remote reachable; half-opening circuit");
                self.breaker.transition_to_half_open();
                self.trigger_recovery().await;
            }
            Err(err) => {
                tracing::debug!(error = %err, "transport ready but write probe failed");
            }
        }
    }

    /// Runs at most one drain at a time, throttled by the drain cooldown and
    /// gated on remote availability.
    pub async fn trigger_recovery(&self) {
        if self.is_recovering.swap(true, Ordering::AcqRel) {
            tracing::debug!("drain already running");
            return;
        }

        let cooled_down = {
            let last = self.last_drain.lock();
            match *last {
                Some(at) => at.elapsed() >= self.opts.drain_cooldown,
                None => true,
            }
        };
        if !cooled_down {
            tracing::debug!("drain cooldown not elapsed; skipped");
            self.is_recovering.store(false, Ordering::Release);
            return;
        }
        if !self.is_redis_available().await {
            tracing::debug!("remote unavailable; drain postponed");
            self.is_recovering.store(false, Ordering::Release);
            return;
        }
        *self.last_drain.lock() = Some(Instant::now());

        let (recovered, failed) = self.drain().await;
        self.metrics.record_recovery_completed(recovered, failed);
        tracing::info!(recovered, failed, "recovery drain finished");

        self.is_recovering.store(false, Ordering::Release);
    }

    async fn drain(&self) -> (u64, u64) {
        self.metrics.record_recovery_started();

        match self.store.cleanup_stale_claims(STALE_CLAIM_MAX_AGE).await {
            Ok(0) => {}
            Ok(reverted) => tracing::info!(reverted, "reverted stale recovery claims"),
            Err(err) => tracing::warn!(error = %err, "stale-claim cleanup failed"),
        }

        let instance = self.store.instance_id().to_string();
        let mut recovered: u64 = 0;
        let mut failed: u64 = 0;

        loop {
            let claimed = match self.store.claim_pending(self.opts.chunk_size, &instance).await {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(error = %err, "claim failed; aborting drain");
                    break;
                }
            };
            if claimed.is_empty() {
                break;
            }

            // The remote can vanish between chunks; release the whole claim
            // rather than timing out record by record.
            if !self.is_redis_available().await {
                let ids: Vec<String> = claimed.iter().map(|r| r.id.clone()).collect();
                failed += claimed.len() as u64;
                if let Err(err) = self.store.mark_pending(ids).await {
                    tracing::error!(error = %err, "failed to release claimed records");
                }
                tracing::warn!("remote lost mid-drain; released claimed records");
                break;
            }

            let mut delivered: Vec<(String, Option<String>)> = Vec::new();
            let mut released: Vec<String> = Vec::new();
            for record in &claimed {
                match self
                    .queue
                    .enqueue(CAR_JOB, &record.car, EnqueueOpts::default())
                    .await
                {
                    Ok(job_id) => delivered.push((record.id.clone(), Some(job_id))),
                    Err(err) => {
                        tracing::warn!(
                            id = %record.id,
                            retry_count = record.retry_count,
                            error = %err,
                            "redelivery failed; record returns to pending"
                        );
                        released.push(record.id.clone());
                    }
                }
            }

            let delivered_count = delivered.len() as u64;
            let released_count = released.len() as u64;
            let bookkeeping: Result<()> = async {
                self.store.mark_sent(delivered).await?;
                self.store.mark_pending(released).await?;
                Ok(())
            }
            .await;

            match bookkeeping {
                Ok(()) => {
                    recovered += delivered_count;
                    failed += released_count;
                }
                Err(err) => {
                    // Batch-level failure: revert every claim this chunk took.
                    // mark_pending skips rows already sent, so nothing moves
                    // backwards.
                    tracing::error!(error = %err, "drain bookkeeping failed; reverting chunk");
                    let ids: Vec<String> = claimed.iter().map(|r| r.id.clone()).collect();
                    if let Err(err) = self.store.mark_pending(ids).await {
                        tracing::error!(error = %err, "failed to revert chunk");
                    }
                    failed += claimed.len() as u64;
                    break;
                }
            }
        }

        (recovered, failed)
    }

    /// Cheap gate used before and during drains: an open breaker means no,
    /// then a bounded ping, then a full write probe as the last word.
    pub async fn is_redis_available(&self) -> bool {
        if self.breaker.state() == CircuitState::Open {
            return false;
        }
        match tokio::time::timeout(PING_TIMEOUT, self.queue.ping()).await {
            Ok(Ok(())) => true,
            _ => self.queue.test_write().await.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RecoveryManager, RecoveryOptions};
    use crate::breaker::{CircuitBreaker, CircuitState};
    use crate::car::Car;
    use crate::metrics::FailoverMetrics;
    use crate::queue::testing::{MockMode, MockQueue};
    use crate::state::{SeederMode, StateManager};
    use crate::store::{SqliteStore, StoreOptions};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        queue: Arc<MockQueue>,
        store: SqliteStore,
        breaker: Arc<CircuitBreaker>,
        state: Arc<StateManager>,
        metrics: Arc<FailoverMetrics>,
        recovery: Arc<RecoveryManager<MockQueue>>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    async fn fixture(mode: MockMode) -> Fixture {
        let db_dir = tempfile::tempdir().unwrap();
        let log_dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MockQueue::new(mode));
        let store = SqliteStore::open(
            StoreOptions {
                path: db_dir.path().join("cars.db"),
                batch_size: 1,
                flush_interval: Duration::from_millis(1000),
            },
            "4242-1700000000000".into(),
        )
        .await
        .unwrap();
        let breaker = CircuitBreaker::new(5, Duration::from_millis(2000));
        let state = Arc::new(StateManager::new());
        let metrics = Arc::new(FailoverMetrics::new(log_dir.path().to_path_buf()).unwrap());
        let recovery = RecoveryManager::new(
            queue.clone(),
            store.clone(),
            breaker.clone(),
            state.clone(),
            metrics.clone(),
            RecoveryOptions {
                chunk_size: 50,
                // Tests fire drains back to back.
                drain_cooldown: Duration::ZERO,
                check_interval: Duration::from_millis(5000),
                reconnect_cooldown: Duration::from_millis(2000),
                master_name: Some("mymaster".into()),
            },
        );
        Fixture {
            queue,
            store,
            breaker,
            state,
            metrics,
            recovery,
            _dirs: (db_dir, log_dir),
        }
    }

    fn test_car(n: usize) -> Car {
        Car {
            normalized_make: "skoda".into(),
            normalized_model: format!("octavia-{n}"),
            year: 2016,
            price: 12000.0,
            location: "vilnius".into(),
        }
    }

    async fn seed_pending(fx: &Fixture, n: usize) {
        for i in 0..n {
            fx.store.save_car(test_car(i)).await.unwrap();
        }
        assert_eq!(fx.store.pending_count().await.unwrap(), n as u64);
    }

    #[tokio::test]
    async fn drain_delivers_all_pending_records() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 5).await;

        fx.recovery.trigger_recovery().await;

        assert_eq!(fx.store.pending_count().await.unwrap(), 0);
        assert_eq!(fx.queue.enqueued_count(), 5);
        // Everything is sent: nothing left to claim.
        assert!(fx
            .store
            .claim_pending(50, "verifier")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unavailable_remote_postpones_the_drain() {
        let fx = fixture(MockMode::TransportDown).await;
        seed_pending(&fx, 3).await;

        fx.recovery.trigger_recovery().await;

        assert_eq!(fx.store.pending_count().await.unwrap(), 3);
        assert_eq!(fx.queue.enqueued_count(), 0);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_availability() {
        let fx = fixture(MockMode::Healthy).await;
        for _ in 0..5 {
            fx.breaker.record_failure();
        }
        assert!(!fx.recovery.is_redis_available().await);
    }

    #[tokio::test]
    async fn per_record_failure_releases_only_that_record() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 3).await;
        fx.queue.fail_next_enqueues(1);

        fx.recovery.trigger_recovery().await;

        // One record went back to pending with its retry bumped.
        assert_eq!(fx.store.pending_count().await.unwrap(), 1);
        assert_eq!(fx.queue.enqueued_count(), 2);
        let retried = fx.store.claim_pending(10, "verifier").await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].retry_count, 1);
    }

    #[tokio::test]
    async fn stale_claims_are_recovered_by_the_next_drain() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 20).await;

        // Another instance claimed everything and died six minutes ago.
        let claimed = fx.store.claim_pending(20, "dead-instance").await.unwrap();
        assert_eq!(claimed.len(), 20);
        fx.store
            .backdate_claims(Duration::from_secs(6 * 60))
            .await
            .unwrap();

        fx.recovery.trigger_recovery().await;

        assert_eq!(fx.store.pending_count().await.unwrap(), 0);
        assert_eq!(fx.queue.enqueued_count(), 20);
    }

    #[tokio::test]
    async fn drain_cooldown_throttles_back_to_back_drains() {
        let mut fx = fixture(MockMode::Healthy).await;
        // Rebuild with a real cooldown.
        fx.recovery = RecoveryManager::new(
            fx.queue.clone(),
            fx.store.clone(),
            fx.breaker.clone(),
            fx.state.clone(),
            fx.metrics.clone(),
            RecoveryOptions {
                drain_cooldown: Duration::from_millis(10_000),
                master_name: Some("mymaster".into()),
                ..RecoveryOptions::default()
            },
        );
        seed_pending(&fx, 2).await;

        fx.recovery.trigger_recovery().await;
        assert_eq!(fx.queue.enqueued_count(), 2);

        seed_pending(&fx, 1).await;
        fx.recovery.trigger_recovery().await;
        // Second drain skipped: still only the first batch delivered.
        assert_eq!(fx.queue.enqueued_count(), 2);
        assert_eq!(fx.store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_master_for_the_configured_master_reconnects_and_drains() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 2).await;
        fx.state.set_mode(SeederMode::Sqlite);
        for _ in 0..5 {
            fx.breaker.record_failure();
        }
        assert_eq!(fx.breaker.state(), CircuitState::Open);

        fx.recovery
            .handle_switch_master(
                "mymaster",
                ("10.0.0.1".into(), 6379),
                ("10.0.0.2".into(), 6379),
            )
            .await;

        assert_eq!(fx.queue.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.queue.connects.load(Ordering::SeqCst), 1);
        // Probe succeeded while degraded: promotion recorded, breaker nudged
        // out of open, store drained.
        assert!(fx.metrics.has_active_session());
        assert_ne!(fx.breaker.state(), CircuitState::Open);
        assert_eq!(fx.store.pending_count().await.unwrap(), 0);
        assert_eq!(fx.queue.enqueued_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn switch_master_for_another_master_is_ignored() {
        let fx = fixture(MockMode::Healthy).await;

        fx.recovery
            .handle_switch_master(
                "other-master",
                ("10.0.0.1".into(), 6379),
                ("10.0.0.2".into(), 6379),
            )
            .await;

        assert_eq!(fx.queue.connects.load(Ordering::SeqCst), 0);
        assert_eq!(fx.queue.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_reconnects_respect_the_cooldown() {
        let fx = fixture(MockMode::Healthy).await;

        let old = ("10.0.0.1".to_string(), 6379);
        let new = ("10.0.0.2".to_string(), 6379);
        fx.recovery
            .handle_switch_master("mymaster", old.clone(), new.clone())
            .await;
        fx.recovery.handle_switch_master("mymaster", old, new).await;

        // Paused clock: no wall time passed, so the second call is inside
        // the 2s spacing window.
        assert_eq!(fx.queue.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_event_while_degraded_half_opens_and_drains() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 3).await;
        fx.state.set_mode(SeederMode::Sqlite);
        for _ in 0..5 {
            fx.breaker.record_failure();
        }

        fx.recovery.handle_connection_ready().await;

        assert_ne!(fx.breaker.state(), CircuitState::Open);
        assert_eq!(fx.store.pending_count().await.unwrap(), 0);
        assert_eq!(fx.queue.enqueued_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_event_in_redis_mode_changes_nothing() {
        let fx = fixture(MockMode::Healthy).await;
        seed_pending(&fx, 1).await;

        fx.recovery.handle_connection_ready().await;

        assert_eq!(fx.store.pending_count().await.unwrap(), 1);
        assert_eq!(fx.queue.enqueued_count(), 0);
    }
}
