mod breaker;
mod car;
mod config;
mod errors;
mod health;
mod metrics;
mod queue;
mod recovery;
mod state;
mod store;
mod writer;

use crate::breaker::CircuitBreaker;
use crate::car::Car;
use crate::config::SeederConfig;
use crate::health::HealthState;
use crate::metrics::FailoverMetrics;
use crate::queue::{JobQueue, RedisEndpoints, RedisQueue};
use crate::recovery::{RecoveryManager, RecoveryOptions};
use crate::state::StateManager;
use crate::store::{SqliteStore, StoreOptions};
use crate::writer::WriteHandler;
use clap::Parser;
use eyre::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};

/// How long shutdown waits for in-flight work before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "car-seeder",
    version,
    about = "Continuous car producer with redis delivery and sqlite failover"
)]
struct Args {
    /// HTTP port for the health endpoint.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Discover the master through a sentinel quorum instead of connecting
    /// directly.
    #[arg(long, env = "REDIS_USE_SENTINEL", default_value_t = false, action = clap::ArgAction::Set)]
    redis_use_sentinel: bool,

    /// Comma-separated sentinel endpoints (host:port,host:port,...).
    #[arg(long, env = "REDIS_SENTINEL_HOSTS")]
    redis_sentinel_hosts: Option<String>,

    /// Master name registered with the sentinels.
    #[arg(long, env = "REDIS_SENTINEL_MASTER_NAME", default_value = "mymaster")]
    redis_sentinel_master_name: String,

    /// Redis host (direct mode only).
    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    redis_host: String,

    /// Redis port (direct mode only).
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Where the durable fallback store lives.
    #[arg(long, env = "SQLITE_DB_PATH", default_value = "./data/cars.db")]
    sqlite_db_path: PathBuf,

    /// Consecutive transport failures before the circuit opens.
    #[arg(long, env = "CIRCUIT_BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    circuit_breaker_failure_threshold: u32,

    /// Open -> half-open cooldown in milliseconds.
    #[arg(long, env = "CIRCUIT_BREAKER_COOLDOWN_MS", default_value_t = 2000)]
    circuit_breaker_cooldown_ms: u64,

    /// Records claimed per recovery chunk.
    #[arg(long, env = "RECOVERY_CHUNK_SIZE", default_value_t = 50)]
    recovery_chunk_size: usize,

    /// Minimum gap between recovery drains in milliseconds.
    #[arg(long, env = "RECOVERY_COOLDOWN_MS", default_value_t = 10_000)]
    recovery_cooldown_ms: u64,

    /// Health-probe period in milliseconds.
    #[arg(long, env = "RECOVERY_CHECK_INTERVAL_MS", default_value_t = 5_000)]
    recovery_check_interval_ms: u64,

    /// One car is generated every this many milliseconds.
    #[arg(long, env = "CAR_GENERATION_INTERVAL_MS", default_value_t = 30)]
    car_generation_interval_ms: u64,

    /// Directory for the daily failover metrics log.
    #[arg(long, env = "METRICS_LOG_DIR", default_value = "./logs")]
    metrics_log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let cfg = SeederConfig {
        port: args.port,
        redis: SeederConfig::redis_endpoints(
            args.redis_use_sentinel,
            args.redis_sentinel_hosts.as_deref(),
            &args.redis_sentinel_master_name,
            &args.redis_host,
            args.redis_port,
        )?,
        sqlite_db_path: args.sqlite_db_path,
        failure_threshold: args.circuit_breaker_failure_threshold,
        breaker_cooldown: Duration::from_millis(args.circuit_breaker_cooldown_ms),
        recovery_chunk_size: args.recovery_chunk_size,
        recovery_cooldown: Duration::from_millis(args.recovery_cooldown_ms),
        recovery_check_interval: Duration::from_millis(args.recovery_check_interval_ms),
        car_interval: Duration::from_millis(args.car_generation_interval_ms),
        metrics_log_dir: args.metrics_log_dir,
    };

    // Unique across concurrent producers sharing one sqlite file; also the
    // claim owner during recovery.
    let instance_id = format!("{}-{}", std::process::id(), now_ms());

    tracing::info!(
        instance = %instance_id,
        redis = ?cfg.redis,
        db = %cfg.sqlite_db_path.display(),
        interval_ms = cfg.car_interval.as_millis() as u64,
        "car seeder starting"
    );

    let metrics = Arc::new(FailoverMetrics::new(cfg.metrics_log_dir.clone())?);
    let store = SqliteStore::open(
        StoreOptions {
            path: cfg.sqlite_db_path.clone(),
            ..StoreOptions::default()
        },
        instance_id.clone(),
    )
    .await?;
    let breaker = CircuitBreaker::new(cfg.failure_threshold, cfg.breaker_cooldown);
    let state = Arc::new(StateManager::new());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let queue = Arc::new(RedisQueue::new(cfg.redis.clone(), events_tx.clone()));
    queue.connect().await?;

    let writer = WriteHandler::new(
        queue.clone(),
        store.clone(),
        breaker.clone(),
        state.clone(),
        metrics.clone(),
    );
    let recovery = RecoveryManager::new(
        queue.clone(),
        store.clone(),
        breaker.clone(),
        state.clone(),
        metrics.clone(),
        RecoveryOptions {
            chunk_size: cfg.recovery_chunk_size,
            drain_cooldown: cfg.recovery_cooldown,
            check_interval: cfg.recovery_check_interval,
            master_name: cfg.sentinel_master_name(),
            ..RecoveryOptions::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    handles.push(tokio::spawn(
        recovery.clone().run_health_probe(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        recovery.clone().run_event_loop(events_rx, shutdown_rx.clone()),
    ));
    if let RedisEndpoints::Sentinel { sentinels, .. } = &cfg.redis {
        handles.push(tokio::spawn(queue::run_sentinel_listener(
            sentinels.clone(),
            events_tx.clone(),
            shutdown_rx.clone(),
        )));
    }
    {
        let health_state = HealthState {
            state: state.clone(),
            breaker: breaker.clone(),
            store: store.clone(),
            metrics: metrics.clone(),
        };
        let health_shutdown = shutdown_rx.clone();
        let port = cfg.port;
        handles.push(tokio::spawn(async move {
            if let Err(err) = health::serve(port, health_state, health_shutdown).await {
                tracing::error!(error = %err, "health server exited");
            }
        }));
    }
    handles.push(spawn_signal_listener(shutdown_tx));

    // Generator loop: one car per tick until shutdown. Write failures are
    // logged and the loop keeps going.
    let mut rng = StdRng::from_entropy();
    let mut ticker = tokio::time::interval(cfg.car_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut shutdown = shutdown_rx.clone();
    let mut generated: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let car = Car::random(&mut rng);
        generated += 1;
        if let Err(err) = writer.write_car(car).await {
            tracing::error!(error = %err, "car write failed; record dropped");
        }
        if generated % 1000 == 0 {
            tracing::info!(generated, "cars produced");
        }
    }

    tracing::info!("shutting down");
    if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
        .await
        .is_err()
    {
        tracing::warn!("shutdown grace period elapsed with tasks still running");
    }
    if let Err(err) = store.flush_pending_writes().await {
        tracing::error!(error = %err, "final buffer flush failed");
    }
    queue.disconnect().await;
    if let Err(err) = store.close().await {
        tracing::error!(error = %err, "store close failed");
    }
    tracing::info!(generated, "car seeder stopped");
    Ok(())
}

fn spawn_signal_listener(tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("received SIGINT"),
                        _ = term.recv() => tracing::info!("received SIGTERM"),
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        let _ = tx.send(true);
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}
