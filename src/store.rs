use crate::car::Car;
use eyre::{eyre, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Recovering,
    Sent,
}

impl PendingStatus {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PendingStatus::Pending),
            "recovering" => Some(PendingStatus::Recovering),
            "sent" => Some(PendingStatus::Sent),
            _ => None,
        }
    }
}

/// A car persisted locally while the remote queue is unavailable.
#[derive(Debug, Clone)]
pub struct PendingCar {
    pub id: String,
    pub car: Car,
    pub created_at: i64,
    pub status: PendingStatus,
    pub retry_count: i64,
    pub recovery_instance: Option<String>,
    pub recovery_started_at: Option<i64>,
    pub redis_job_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub path: PathBuf,
    /// Buffered records are committed once this many have accumulated...
    pub batch_size: usize,
    /// ...or once this long has passed since the first buffered record.
    pub flush_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cars.db"),
            batch_size: 50,
            flush_interval: Duration::from_millis(1000),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_cars (
    id                  TEXT PRIMARY KEY,
    normalized_make     TEXT NOT NULL,
    normalized_model    TEXT NOT NULL,
    year                INTEGER NOT NULL,
    price               REAL NOT NULL,
    location            TEXT NOT NULL,
    created_at          INTEGER NOT NULL,
    status              TEXT NOT NULL DEFAULT 'pending',
    retry_count         INTEGER NOT NULL DEFAULT 0,
    recovery_instance   TEXT,
    recovery_started_at INTEGER,
    redis_job_id        TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_cars_status_created_at
    ON pending_cars (status, created_at);
CREATE INDEX IF NOT EXISTS idx_pending_cars_recovery_instance
    ON pending_cars (recovery_instance);
";

const INSERT_SQL: &str = "INSERT INTO pending_cars
    (id, normalized_make, normalized_model, year, price, location, created_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Claim is a single statement so a partial claim is impossible; it runs
/// inside an IMMEDIATE transaction so two claimers serialize on the writer
/// lock.
const CLAIM_SQL: &str = "UPDATE pending_cars
    SET status = 'recovering', recovery_instance = ?1, recovery_started_at = ?2
    WHERE id IN (
        SELECT id FROM pending_cars
        WHERE status = 'pending'
        ORDER BY created_at ASC
        LIMIT ?3
    )
    RETURNING id, normalized_make, normalized_model, year, price, location,
              created_at, status, retry_count, recovery_instance,
              recovery_started_at, redis_job_id";

/// Batched, crash-safe fallback store for cars that could not be enqueued.
///
/// Writers append through an in-memory buffer (size or deadline triggered);
/// the recovery manager takes records back out through the claim protocol.
/// Cloning is cheap and all clones share one connection.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: Mutex<Option<Connection>>,
    buffer: Mutex<Vec<Car>>,
    /// Serializes flushes so re-prepended batches cannot interleave.
    flush_lock: tokio::sync::Mutex<()>,
    flush_timer: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    instance_id: String,
    seq: AtomicU64,
    last_created_at: AtomicI64,
    batch_size: usize,
    flush_interval: Duration,
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `opts.path`, creating parent
    /// directories first.
    pub async fn open(opts: StoreOptions, instance_id: String) -> Result<Self> {
        let conn = tokio::task::spawn_blocking({
            let path = opts.path.clone();
            move || open_connection(&path)
        })
        .await
        .map_err(|err| eyre!("store open task failed: {err}"))??;

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(Some(conn)),
                buffer: Mutex::new(Vec::new()),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_timer: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                instance_id,
                seq: AtomicU64::new(0),
                last_created_at: AtomicI64::new(0),
                batch_size: opts.batch_size.max(1),
                flush_interval: opts.flush_interval,
            }),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    /// Buffered append. Commits once `batch_size` records have accumulated or
    /// the flush deadline elapses, whichever comes first. While shutdown is
    /// in progress, saves are silently dropped; recovery relies on the
    /// commits that happened before.
    pub async fn save_car(&self, car: Car) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            tracing::debug!("store shutting down; dropping save");
            return Ok(());
        }
        let buffered = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push(car);
            buffer.len()
        };
        if buffered >= self.inner.batch_size {
            self.flush_pending_writes().await
        } else {
            if buffered == 1 {
                self.arm_flush_timer();
            }
            Ok(())
        }
    }

    /// Forces the buffer to commit and cancels the flush timer.
    pub async fn flush_pending_writes(&self) -> Result<()> {
        self.cancel_flush_timer();
        self.flush_buffer().await
    }

    /// Atomically claims up to `limit` oldest pending records for `instance`,
    /// marking them `recovering`. Two concurrent claimers always get disjoint
    /// sets.
    pub async fn claim_pending(&self, limit: usize, instance: &str) -> Result<Vec<PendingCar>> {
        let inner = self.inner.clone();
        let instance = instance.to_string();
        tokio::task::spawn_blocking(move || inner.claim_pending_blocking(limit, &instance))
            .await
            .map_err(|err| eyre!("claim task failed: {err}"))?
    }

    /// Marks delivered records `sent` with the job id the queue returned.
    /// Idempotent on already-sent ids; a missing job id is permitted.
    pub async fn mark_sent(&self, delivered: Vec<(String, Option<String>)>) -> Result<()> {
        if delivered.is_empty() {
            return Ok(());
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.mark_sent_blocking(&delivered))
            .await
            .map_err(|err| eyre!("mark-sent task failed: {err}"))?
    }

    /// Releases claimed records whose delivery failed back to `pending`,
    /// bumping their retry count. Records already marked `sent` are left
    /// untouched.
    pub async fn mark_pending(&self, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.mark_pending_blocking(&ids))
            .await
            .map_err(|err| eyre!("mark-pending task failed: {err}"))?
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.pending_count_blocking())
            .await
            .map_err(|err| eyre!("pending-count task failed: {err}"))?
    }

    /// Reverts claims older than `max_age` back to `pending` (abandoned by a
    /// crashed or stalled instance). Returns how many were reverted.
    pub async fn cleanup_stale_claims(&self, max_age: Duration) -> Result<usize> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.cleanup_stale_claims_blocking(max_age))
            .await
            .map_err(|err| eyre!("stale-claim cleanup task failed: {err}"))?
    }

    /// Marks shutdown, flushes the buffer and closes the handle. Saves
    /// arriving after this point are dropped.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.cancel_flush_timer();
        let flushed = self.flush_buffer().await;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.conn.lock().take();
        })
        .await
        .map_err(|err| eyre!("store close task failed: {err}"))?;
        flushed
    }

    fn arm_flush_timer(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.flush_interval).await;
            // Drop our own handle first so a concurrent flush does not abort
            // us mid-commit.
            inner.flush_timer.lock().take();
            let store = SqliteStore { inner };
            if let Err(err) = store.flush_buffer().await {
                tracing::error!(error = %err, "deadline flush failed; batch kept in buffer");
            }
        });
        if let Some(old) = self.inner.flush_timer.lock().replace(handle) {
            old.abort();
        }
    }

    fn cancel_flush_timer(&self) {
        if let Some(timer) = self.inner.flush_timer.lock().take() {
            timer.abort();
        }
    }

    async fn flush_buffer(&self) -> Result<()> {
        let _flushing = self.inner.flush_lock.lock().await;
        let batch: Vec<Car> = {
            let mut buffer = self.inner.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        let retry = batch.clone();
        let inner = self.inner.clone();
        let committed = tokio::task::spawn_blocking(move || inner.commit_batch_blocking(&batch))
            .await
            .map_err(|err| eyre!("flush task failed: {err}"))
            .and_then(|res| res);

        match committed {
            Ok(()) => {
                tracing::debug!(count, "flushed buffered cars to sqlite");
                Ok(())
            }
            Err(err) => {
                // Re-prepend so a later flush retries the batch in order.
                {
                    let mut buffer = self.inner.buffer.lock();
                    let mut restored = retry;
                    restored.extend(buffer.drain(..));
                    *buffer = restored;
                }
                // `save_car` only arms the timer on the first buffered
                // record, so the restored batch needs its own deadline.
                if !self.inner.shutting_down.load(Ordering::Acquire) {
                    self.arm_flush_timer();
                }
                Err(err)
            }
        }
    }
}

impl StoreInner {
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock();
        let conn = guard
            .as_mut()
            .ok_or_else(|| eyre!("durable store is closed"))?;
        f(conn)
    }

    fn commit_batch_blocking(&self, cars: &[Car]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(INSERT_SQL)?;
                // Timestamps stay strictly increasing within (and across)
                // batches even at sub-millisecond commit rates.
                let mut ts = now_ms().max(self.last_created_at.load(Ordering::Acquire) + 1);
                for car in cars {
                    let index = self.seq.fetch_add(1, Ordering::Relaxed);
                    let id = format!(
                        "{}-{}-{}-{:04x}",
                        self.instance_id,
                        ts,
                        index,
                        rand::random::<u16>()
                    );
                    stmt.execute(params![
                        id,
                        car.normalized_make,
                        car.normalized_model,
                        car.year,
                        car.price,
                        car.location,
                        ts,
                    ])?;
                    ts += 1;
                }
                self.last_created_at.store(ts - 1, Ordering::Release);
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn claim_pending_blocking(&self, limit: usize, instance: &str) -> Result<Vec<PendingCar>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let claimed = {
                let mut stmt = tx.prepare_cached(CLAIM_SQL)?;
                let rows = stmt.query_map(
                    params![instance, now_ms(), limit as i64],
                    row_to_pending_car,
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;
            Ok(claimed)
        })
    }

    fn mark_sent_blocking(&self, delivered: &[(String, Option<String>)]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE pending_cars SET status = 'sent', redis_job_id = ?2 WHERE id = ?1",
                )?;
                for (id, job_id) in delivered {
                    stmt.execute(params![id, job_id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn mark_pending_blocking(&self, ids: &[String]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                // Guarded on status so sent records never move backwards.
                let mut stmt = tx.prepare_cached(
                    "UPDATE pending_cars
                     SET status = 'pending', retry_count = retry_count + 1,
                         recovery_instance = NULL, recovery_started_at = NULL
                     WHERE id = ?1 AND status = 'recovering'",
                )?;
                for id in ids {
                    stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn pending_count_blocking(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_cars WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    fn cleanup_stale_claims_blocking(&self, max_age: Duration) -> Result<usize> {
        self.with_conn(|conn| {
            let cutoff = now_ms() - max_age.as_millis() as i64;
            let reverted = conn.execute(
                "UPDATE pending_cars
                 SET status = 'pending', recovery_instance = NULL, recovery_started_at = NULL
                 WHERE status = 'recovering' AND recovery_started_at < ?1",
                params![cutoff],
            )?;
            Ok(reverted)
        })
    }
}

fn open_connection(path: &std::path::Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                eyre!("failed to create store directory {}: {e}", parent.display())
            })?;
        }
    }
    let conn = Connection::open(path)
        .map_err(|e| eyre!("failed to open sqlite store at {}: {e}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "cache_size", 10_000)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn row_to_pending_car(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingCar> {
    let status: String = row.get(7)?;
    let status = PendingStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown status {status:?}").into(),
        )
    })?;
    Ok(PendingCar {
        id: row.get(0)?,
        car: Car {
            normalized_make: row.get(1)?,
            normalized_model: row.get(2)?,
            year: row.get(3)?,
            price: row.get(4)?,
            location: row.get(5)?,
        },
        created_at: row.get(6)?,
        status,
        retry_count: row.get(8)?,
        recovery_instance: row.get(9)?,
        recovery_started_at: row.get(10)?,
        redis_job_id: row.get(11)?,
    })
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}

#[cfg(test)]
impl SqliteStore {
    /// Backdates every claim by `age`; lets tests manufacture stale claims.
    pub(crate) async fn backdate_claims(&self, age: Duration) -> Result<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.with_conn(|conn| {
                conn.execute(
                    "UPDATE pending_cars SET recovery_started_at = recovery_started_at - ?1
                     WHERE status = 'recovering'",
                    params![age.as_millis() as i64],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|err| eyre!("backdate task failed: {err}"))?
    }
}
