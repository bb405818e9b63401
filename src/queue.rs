use crate::car::Car;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};

/// Stream the downstream workers consume from.
pub const QUEUE_NAME: &str = "car-seeder-queue";
/// Job name for real work.
pub const CAR_JOB: &str = "car";
/// Sentinel job used by write probes; removed right after the probe.
pub const HEALTH_CHECK_JOB: &str = "health-check-test";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TEST_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const SENTINEL_QUERY_TIMEOUT: Duration = Duration::from_secs(2);
/// Reconnect backoff: min(attempt * 50, 2000) ms.
const BACKOFF_FACTOR_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 2000;

/// Options attached to an enqueued job for the consumer to honor.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOpts {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for EnqueueOpts {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 2000,
        }
    }
}

/// Transport-level notifications consumed by the recovery manager.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The transport finished a verified (re)connect.
    Ready,
    /// A sentinel announced a master promotion.
    SwitchMaster {
        master: String,
        old: (String, u16),
        new: (String, u16),
    },
}

/// The seam between the write/recovery paths and the concrete transport.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Establishes a verified connection; callers are not released until a
    /// ping round-trips.
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    /// Returns the job id assigned by the queue.
    async fn enqueue(&self, job_name: &str, car: &Car, opts: EnqueueOpts) -> Result<String>;
    async fn ping(&self) -> Result<()>;
    /// Enqueues a self-removing sentinel job to prove writes go through.
    async fn test_write(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum RedisEndpoints {
    Direct {
        host: String,
        port: u16,
    },
    Sentinel {
        sentinels: Vec<(String, u16)>,
        master_name: String,
    },
}

/// Redis-backed work queue. Jobs are XADDed to a stream; the entry id is the
/// job id downstream workers ack against.
///
/// Offline queueing is intentionally disabled: when the transport is down,
/// writes fail immediately so the circuit breaker sees them instead of a
/// client-side buffer swallowing them.
pub struct RedisQueue {
    endpoints: RedisEndpoints,
    manager: RwLock<Option<ConnectionManager>>,
    events: mpsc::UnboundedSender<QueueEvent>,
}

impl RedisQueue {
    pub fn new(endpoints: RedisEndpoints, events: mpsc::UnboundedSender<QueueEvent>) -> Self {
        Self {
            endpoints,
            manager: RwLock::new(None),
            events,
        }
    }

    /// Current master address: asks the sentinels in sentinel mode, static
    /// otherwise.
    async fn discover_master(&self) -> Result<(String, u16)> {
        match &self.endpoints {
            RedisEndpoints::Direct { host, port } => Ok((host.clone(), *port)),
            RedisEndpoints::Sentinel {
                sentinels,
                master_name,
            } => {
                for (host, port) in sentinels {
                    match query_sentinel(host, *port, master_name).await {
                        Ok(addr) => {
                            tracing::debug!(
                                sentinel = %format!("{host}:{port}"),
                                master = %format!("{}:{}", addr.0, addr.1),
                                "master discovered"
                            );
                            return Ok(addr);
                        }
                        Err(err) => {
                            tracing::warn!(
                                sentinel = %format!("{host}:{port}"),
                                error = %err,
                                "sentinel query failed; trying next"
                            );
                        }
                    }
                }
                Err(eyre!(
                    "no sentinel returned a master address for '{master_name}'"
                ))
            }
        }
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| eyre!("redis transport is down (offline queueing disabled)"))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn connect(&self) -> Result<()> {
        let (host, port) = self.discover_master().await?;
        let client = redis::Client::open(format!("redis://{host}:{port}"))
            .wrap_err_with(|| format!("invalid redis address {host}:{port}"))?;

        let config = ConnectionManagerConfig::new()
            .set_factor(BACKOFF_FACTOR_MS)
            .set_max_delay(BACKOFF_CAP_MS);
        let manager = ConnectionManager::new_with_config(client, config)
            .await
            .wrap_err_with(|| format!("failed to connect to redis master {host}:{port}"))?;

        // The manager resolves before the socket is necessarily writable;
        // hold callers back until a ping round-trips.
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let mut probe = manager.clone();
            let pong: Result<String, redis::RedisError> =
                redis::cmd("PING").query_async(&mut probe).await;
            match pong {
                Ok(_) => break,
                Err(err) if tokio::time::Instant::now() < deadline => {
                    let backoff =
                        Duration::from_millis((attempt * BACKOFF_FACTOR_MS).min(BACKOFF_CAP_MS));
                    tracing::debug!(attempt, error = %err, "redis not ready yet; retrying ping");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(err).wrap_err("redis did not become ready within 30s");
                }
            }
        }

        *self.manager.write().await = Some(manager);
        tracing::info!(master = %format!("{host}:{port}"), "redis connection ready");
        self.events.send(QueueEvent::Ready).ok();
        Ok(())
    }

    async fn disconnect(&self) {
        if self.manager.write().await.take().is_some() {
            tracing::info!("redis connection dropped");
        }
    }

    async fn enqueue(&self, job_name: &str, car: &Car, opts: EnqueueOpts) -> Result<String> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(car).wrap_err("failed to serialize car payload")?;
        let job_id: String = redis::cmd("XADD")
            .arg(QUEUE_NAME)
            .arg("*")
            .arg("name")
            .arg(job_name)
            .arg("payload")
            .arg(payload)
            .arg("attempts")
            .arg(opts.attempts)
            .arg("backoffMs")
            .arg(opts.backoff_ms)
            .query_async(&mut conn)
            .await
            .wrap_err_with(|| format!("failed to enqueue {job_name} job"))?;
        Ok(job_id)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .wrap_err("redis ping failed")?;
        if pong != "PONG" {
            return Err(eyre!("unexpected ping response {pong:?}"));
        }
        Ok(())
    }

    async fn test_write(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        tokio::time::timeout(TEST_WRITE_TIMEOUT, async {
            let job_id: String = redis::cmd("XADD")
                .arg(QUEUE_NAME)
                .arg("*")
                .arg("name")
                .arg(HEALTH_CHECK_JOB)
                .arg("payload")
                .arg("{}")
                .query_async(&mut conn)
                .await
                .wrap_err("health-check write failed")?;
            // Auto-remove: the probe job must not reach a worker.
            let _removed: i64 = redis::cmd("XDEL")
                .arg(QUEUE_NAME)
                .arg(&job_id)
                .query_async(&mut conn)
                .await
                .wrap_err("health-check cleanup failed")?;
            Ok(())
        })
        .await
        .map_err(|_| eyre!("health-check write timed out"))?
    }
}

async fn query_sentinel(host: &str, port: u16, master_name: &str) -> Result<(String, u16)> {
    let client = redis::Client::open(format!("redis://{host}:{port}"))
        .wrap_err_with(|| format!("invalid sentinel address {host}:{port}"))?;
    let mut conn = tokio::time::timeout(
        SENTINEL_QUERY_TIMEOUT,
        client.get_multiplexed_async_connection(),
    )
    .await
    .map_err(|_| eyre!("sentinel {host}:{port} timed out"))?
    .wrap_err_with(|| format!("failed to connect to sentinel {host}:{port}"))?;

    let addr: Vec<String> = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master_name)
        .query_async(&mut conn)
        .await
        .wrap_err("sentinel get-master-addr-by-name failed")?;
    match addr.as_slice() {
        [host, port] => Ok((
            host.clone(),
            port.parse()
                .wrap_err_with(|| format!("sentinel returned invalid master port {port:?}"))?,
        )),
        _ => Err(eyre!("sentinel has no master named '{master_name}'")),
    }
}

/// Long-lived pattern subscription against the sentinels. `+switch-master`
/// payloads are parsed and forwarded; everything else is dropped. Rotates
/// through the sentinel list with capped backoff when a subscription dies.
pub async fn run_sentinel_listener(
    sentinels: Vec<(String, u16)>,
    events: mpsc::UnboundedSender<QueueEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u64 = 0;
    loop {
        for (host, port) in &sentinels {
            tokio::select! {
                _ = shutdown.changed() => return,
                res = subscribe_once(host, *port, &events) => {
                    if let Err(err) = res {
                        tracing::warn!(
                            sentinel = %format!("{host}:{port}"),
                            error = %err,
                            "sentinel subscription lost; rotating"
                        );
                    }
                }
            }
            attempt += 1;
            let backoff = Duration::from_millis((attempt * BACKOFF_FACTOR_MS).min(BACKOFF_CAP_MS));
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

async fn subscribe_once(
    host: &str,
    port: u16,
    events: &mpsc::UnboundedSender<QueueEvent>,
) -> Result<()> {
    let client = redis::Client::open(format!("redis://{host}:{port}"))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .wrap_err_with(|| format!("failed to open pubsub to sentinel {host}:{port}"))?;
    pubsub.psubscribe("*").await?;
    tracing::info!(sentinel = %format!("{host}:{port}"), "subscribed to sentinel events");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        if msg.get_channel_name() != "+switch-master" {
            continue;
        }
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable +switch-master payload");
                continue;
            }
        };
        match parse_switch_master(&payload) {
            Some(event) => {
                events.send(event).ok();
            }
            None => tracing::warn!(payload = %payload, "malformed +switch-master message"),
        }
    }
    Err(eyre!("sentinel pubsub stream ended"))
}

/// `<master-name> <old-host> <old-port> <new-host> <new-port>`
fn parse_switch_master(payload: &str) -> Option<QueueEvent> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    let [master, old_host, old_port, new_host, new_port] = parts.as_slice() else {
        return None;
    };
    Some(QueueEvent::SwitchMaster {
        master: master.to_string(),
        old: (old_host.to_string(), old_port.parse().ok()?),
        new: (new_host.to_string(), new_port.parse().ok()?),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{EnqueueOpts, JobQueue};
    use crate::car::Car;
    use async_trait::async_trait;
    use eyre::{eyre, Report, Result};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockMode {
        Healthy,
        TransportDown,
        ValidationError,
    }

    /// In-memory `JobQueue` used by writer and recovery tests.
    pub struct MockQueue {
        mode: Mutex<MockMode>,
        fail_next: AtomicU64,
        next_job: AtomicU64,
        pub enqueued: Mutex<Vec<(String, Car)>>,
        pub connects: AtomicU64,
        pub disconnects: AtomicU64,
    }

    impl MockQueue {
        pub fn new(mode: MockMode) -> Self {
            Self {
                mode: Mutex::new(mode),
                fail_next: AtomicU64::new(0),
                next_job: AtomicU64::new(0),
                enqueued: Mutex::new(Vec::new()),
                connects: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
            }
        }

        pub fn set_mode(&self, mode: MockMode) {
            *self.mode.lock() = mode;
        }

        /// Fails the next `n` enqueue calls with a transport error, then
        /// resumes the configured mode.
        pub fn fail_next_enqueues(&self, n: u64) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        pub fn enqueued_count(&self) -> usize {
            self.enqueued.lock().len()
        }

        fn transport_err() -> Report {
            Report::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))
        }
    }

    #[async_trait]
    impl JobQueue for MockQueue {
        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            match *self.mode.lock() {
                MockMode::TransportDown => Err(Self::transport_err()),
                _ => Ok(()),
            }
        }

        async fn disconnect(&self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn enqueue(&self, job_name: &str, car: &Car, _opts: EnqueueOpts) -> Result<String> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(Self::transport_err());
            }
            match *self.mode.lock() {
                MockMode::Healthy => {
                    let n = self.next_job.fetch_add(1, Ordering::SeqCst);
                    self.enqueued
                        .lock()
                        .push((job_name.to_string(), car.clone()));
                    Ok(format!("job-{n}"))
                }
                MockMode::TransportDown => Err(Self::transport_err()),
                MockMode::ValidationError => {
                    Err(eyre!("invalid job payload: schema validation failed"))
                }
            }
        }

        async fn ping(&self) -> Result<()> {
            match *self.mode.lock() {
                MockMode::TransportDown => Err(Self::transport_err()),
                _ => Ok(()),
            }
        }

        async fn test_write(&self) -> Result<()> {
            self.ping().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_switch_master, QueueEvent};

    #[test]
    fn parses_switch_master_payload() {
        let event = parse_switch_master("mymaster 10.0.0.1 6379 10.0.0.2 6380").unwrap();
        match event {
            QueueEvent::SwitchMaster { master, old, new } => {
                assert_eq!(master, "mymaster");
                assert_eq!(old, ("10.0.0.1".to_string(), 6379));
                assert_eq!(new, ("10.0.0.2".to_string(), 6380));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_switch_master_payloads() {
        assert!(parse_switch_master("").is_none());
        assert!(parse_switch_master("mymaster 10.0.0.1 6379").is_none());
        assert!(parse_switch_master("mymaster a b c d").is_none());
    }
}
