use eyre::{eyre, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One failover timeline: from the first sign of degraded operation until
/// writes return to the remote queue.
#[derive(Debug)]
struct FailoverSession {
    id: String,
    master_failure_at: Option<i64>,
    promotion_at: Option<i64>,
    to_sqlite_at: Option<i64>,
    recovery_started_at: Option<i64>,
    recovery_completed_at: Option<i64>,
    fallback_count: u64,
}

struct MetricsInner {
    session: Option<FailoverSession>,
    sessions_started: u64,
    sqlite_fallback_count: u64,
}

/// Stitches breaker/state/recovery signals into failover sessions and
/// appends each event to a daily JSON log
/// (`failover-metrics-YYYY-MM-DD.log`, one object per event, blank-line
/// separated).
///
/// Metrics are advisory: file IO failures are logged and swallowed so the
/// write path never stalls on them.
pub struct FailoverMetrics {
    log_dir: PathBuf,
    inner: Mutex<MetricsInner>,
}

impl FailoverMetrics {
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| eyre!("failed to create metrics dir {}: {e}", log_dir.display()))?;
        Ok(Self {
            log_dir,
            inner: Mutex::new(MetricsInner {
                session: None,
                sessions_started: 0,
                sqlite_fallback_count: 0,
            }),
        })
    }

    pub fn record_master_failure(&self) {
        let session_id = {
            let mut inner = self.inner.lock();
            let session = ensure_session(&mut inner, "MasterFailureDetected");
            if session.master_failure_at.is_none() {
                session.master_failure_at = Some(now_ms());
            }
            session.id.clone()
        };
        self.append_event("MasterFailureDetected", json!({ "sessionId": session_id }));
    }

    pub fn record_sentinel_promotion(&self) {
        let (session_id, promotion_duration) = {
            let mut inner = self.inner.lock();
            let session = ensure_session(&mut inner, "SentinelPromotion");
            if session.promotion_at.is_none() {
                session.promotion_at = Some(now_ms());
            }
            let duration = duration_between(session.master_failure_at, session.promotion_at);
            (session.id.clone(), duration)
        };
        self.append_event(
            "SentinelPromotion",
            json!({
                "sessionId": session_id,
                "promotionDurationMs": promotion_duration,
            }),
        );
    }

    pub fn record_state_transition_to_sqlite(&self) {
        let session_id = {
            let mut inner = self.inner.lock();
            let session = ensure_session(&mut inner, "StateTransitionToSqlite");
            if session.to_sqlite_at.is_none() {
                session.to_sqlite_at = Some(now_ms());
            }
            session.id.clone()
        };
        self.append_event(
            "StateTransitionToSqlite",
            json!({ "sessionId": session_id }),
        );
    }

    /// Closes the active session: derives the failover durations, reports
    /// and resets the fallback counter.
    pub fn record_state_transition_to_redis(&self) {
        let (session, details) = {
            let mut inner = self.inner.lock();
            ensure_session(&mut inner, "StateTransitionToRedis");
            let fallback_count = inner.sqlite_fallback_count;
            inner.sqlite_fallback_count = 0;
            // Session is over; take it so the next failure opens a fresh one.
            let Some(session) = inner.session.take() else {
                return;
            };
            let now = Some(now_ms());
            let details = json!({
                "sessionId": session.id,
                "downtimeMs": duration_between(session.master_failure_at, now),
                "sqliteModeDurationMs": duration_between(session.to_sqlite_at, now),
                "promotionDurationMs":
                    duration_between(session.master_failure_at, session.promotion_at),
                "sqliteFallbackCount": fallback_count,
            });
            (session, details)
        };
        tracing::info!(
            session = %session.id,
            fallback_records = session.fallback_count,
            "failover session closed"
        );
        self.append_event("StateTransitionToRedis", details);
    }

    pub fn record_recovery_started(&self) {
        let session_id = {
            let mut inner = self.inner.lock();
            if let Some(session) = inner.session.as_mut() {
                if session.recovery_started_at.is_none() {
                    session.recovery_started_at = Some(now_ms());
                }
                Some(session.id.clone())
            } else {
                None
            }
        };
        self.append_event("RecoveryStarted", json!({ "sessionId": session_id }));
    }

    pub fn record_recovery_completed(&self, entries_recovered: u64, entries_failed: u64) {
        let session_id = {
            let mut inner = self.inner.lock();
            if let Some(session) = inner.session.as_mut() {
                session.recovery_completed_at = Some(now_ms());
                Some(session.id.clone())
            } else {
                None
            }
        };
        let mut details = json!({
            "sessionId": session_id,
            "entriesRecovered": entries_recovered,
        });
        if entries_failed > 0 {
            details["entriesFailed"] = json!(entries_failed);
        }
        self.append_event("RecoveryCompleted", details);
    }

    /// One more record fell through to the durable store.
    pub fn increment_sqlite_fallback(&self) {
        let mut inner = self.inner.lock();
        inner.sqlite_fallback_count += 1;
        if let Some(session) = inner.session.as_mut() {
            session.fallback_count += 1;
        }
    }

    pub fn sqlite_fallback_count(&self) -> u64 {
        self.inner.lock().sqlite_fallback_count
    }

    pub fn has_active_session(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    fn append_event(&self, event: &str, details: serde_json::Value) {
        let record = json!({
            "id": format!("event-{}-{:04x}", now_ms(), rand::random::<u16>()),
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": event,
            "details": details,
        });
        if let Err(err) = self.append_line(&record) {
            tracing::error!(error = %err, event, "failed to append metrics event");
        }
    }

    fn append_line(&self, record: &serde_json::Value) -> Result<()> {
        let name = format!(
            "failover-metrics-{}.log",
            chrono::Utc::now().format("%Y-%m-%d")
        );
        let path = self.log_dir.join(name);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| eyre!("failed to open {}: {e}", path.display()))?;
        let body = serde_json::to_string_pretty(record)?;
        writeln!(file, "{body}\n").map_err(|e| eyre!("failed to write {}: {e}", path.display()))?;
        Ok(())
    }
}

/// Opens a session if none is active. A session opened by anything other
/// than a master failure started late: its earlier timestamps are unknown
/// and stay null.
fn ensure_session<'a>(inner: &'a mut MetricsInner, opener: &str) -> &'a mut FailoverSession {
    if inner.session.is_none() {
        inner.sessions_started += 1;
        let id = format!("failover-{}-{}", inner.sessions_started, now_ms());
        if opener != "MasterFailureDetected" {
            tracing::warn!(
                session = %id,
                opener,
                "failover session opened late; earlier timestamps unknown"
            );
        }
        tracing::info!(session = %id, opener, "failover session opened");
        inner.session = Some(FailoverSession {
            id,
            master_failure_at: None,
            promotion_at: None,
            to_sqlite_at: None,
            recovery_started_at: None,
            recovery_completed_at: None,
            fallback_count: 0,
        });
    }
    match inner.session.as_mut() {
        Some(session) => session,
        // Just inserted above.
        None => unreachable!("session was just ensured"),
    }
}

fn duration_between(from: Option<i64>, to: Option<i64>) -> Option<i64> {
    match (from, to) {
        (Some(from), Some(to)) => Some((to - from).max(0)),
        _ => None,
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::FailoverMetrics;

    fn read_events(dir: &tempfile::TempDir) -> Vec<serde_json::Value> {
        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1, "expected exactly one daily log file");
        let raw = std::fs::read_to_string(files.remove(0)).unwrap();
        raw.split("\n\n")
            .filter(|chunk| !chunk.trim().is_empty())
            .map(|chunk| serde_json::from_str(chunk).unwrap())
            .collect()
    }

    #[test]
    fn full_session_produces_ordered_events_and_durations() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = FailoverMetrics::new(dir.path().to_path_buf()).unwrap();

        metrics.record_master_failure();
        metrics.record_state_transition_to_sqlite();
        metrics.increment_sqlite_fallback();
        metrics.increment_sqlite_fallback();
        metrics.increment_sqlite_fallback();
        metrics.record_sentinel_promotion();
        metrics.record_recovery_started();
        metrics.record_recovery_completed(5, 0);
        assert!(metrics.has_active_session());
        metrics.record_state_transition_to_redis();

        assert!(!metrics.has_active_session());
        assert_eq!(metrics.sqlite_fallback_count(), 0);

        let events = read_events(&dir);
        let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![
                "MasterFailureDetected",
                "StateTransitionToSqlite",
                "SentinelPromotion",
                "RecoveryStarted",
                "RecoveryCompleted",
                "StateTransitionToRedis",
            ]
        );

        // One session id throughout.
        let session_id = events[0]["details"]["sessionId"].as_str().unwrap();
        assert!(session_id.starts_with("failover-1-"));
        for event in &events {
            assert_eq!(event["details"]["sessionId"].as_str().unwrap(), session_id);
            assert!(event["id"].as_str().unwrap().starts_with("event-"));
            assert!(event["timestamp"].as_str().is_some());
        }

        let close = &events[5]["details"];
        assert!(close["downtimeMs"].as_i64().unwrap() >= 0);
        assert!(close["sqliteModeDurationMs"].as_i64().unwrap() >= 0);
        assert!(close["promotionDurationMs"].as_i64().unwrap() >= 0);
        assert_eq!(close["sqliteFallbackCount"].as_u64().unwrap(), 3);

        assert_eq!(events[4]["details"]["entriesRecovered"].as_u64().unwrap(), 5);
        assert!(events[4]["details"].get("entriesFailed").is_none());
    }

    #[test]
    fn late_opened_session_has_null_durations() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = FailoverMetrics::new(dir.path().to_path_buf()).unwrap();

        metrics.record_state_transition_to_redis();
        assert!(!metrics.has_active_session());

        let events = read_events(&dir);
        assert_eq!(events.len(), 1);
        let details = &events[0]["details"];
        assert!(details["downtimeMs"].is_null());
        assert!(details["sqliteModeDurationMs"].is_null());
        assert!(details["promotionDurationMs"].is_null());
    }

    #[test]
    fn recovery_events_without_a_session_carry_null_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = FailoverMetrics::new(dir.path().to_path_buf()).unwrap();

        metrics.record_recovery_started();
        metrics.record_recovery_completed(0, 2);
        assert!(!metrics.has_active_session());

        let events = read_events(&dir);
        assert_eq!(events.len(), 2);
        assert!(events[0]["details"]["sessionId"].is_null());
        assert_eq!(events[1]["details"]["entriesFailed"].as_u64().unwrap(), 2);
    }

    #[test]
    fn sessions_are_numbered_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = FailoverMetrics::new(dir.path().to_path_buf()).unwrap();

        metrics.record_master_failure();
        metrics.record_state_transition_to_redis();
        metrics.record_master_failure();
        metrics.record_state_transition_to_redis();

        let events = read_events(&dir);
        let first = events[0]["details"]["sessionId"].as_str().unwrap();
        let third = events[2]["details"]["sessionId"].as_str().unwrap();
        assert!(first.starts_with("failover-1-"));
        assert!(third.starts_with("failover-2-"));
    }
}
