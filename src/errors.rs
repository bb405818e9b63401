use eyre::Report;

/// Buckets every write-path error falls into. Only `Transport` feeds the
/// circuit breaker; `DurableTransient` is retried against SQLite; `Other`
/// is surfaced to the caller untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    DurableTransient,
    Other,
}

/// Message fragments that mark a connection-level failure. Checked on the
/// top-level message and on every wrapped cause, mirroring the error codes
/// below for errors that only carry text.
const TRANSPORT_MARKERS: &[&str] = &[
    "econnrefused",
    "etimedout",
    "enotfound",
    "econnreset",
    "epipe",
    "connection refused",
    "connection reset",
    "connection dropped",
    "connection timed out",
    "timed out",
    "broken pipe",
    "failed to lookup address",
    "dns error",
    "stream not writable",
    "offline queue",
    "transport is down",
    "io error",
];

const DURABLE_TRANSIENT_MARKERS: &[&str] = &["database is locked", "database is busy"];

/// Classifies an error by inspecting typed causes first (redis, io, sqlite)
/// and falling back to substring checks, walking the whole `source()` chain
/// so wrapped causes classify the same as bare ones.
pub fn classify(err: &Report) -> ErrorKind {
    for cause in err.chain() {
        if let Some(redis_err) = cause.downcast_ref::<redis::RedisError>() {
            if redis_err.is_io_error()
                || redis_err.is_timeout()
                || redis_err.is_connection_refusal()
                || redis_err.is_connection_dropped()
            {
                return ErrorKind::Transport;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if is_transport_io(io_err) {
                return ErrorKind::Transport;
            }
        }
        if let Some(sqlite_err) = cause.downcast_ref::<rusqlite::Error>() {
            if is_sqlite_transient(sqlite_err) {
                return ErrorKind::DurableTransient;
            }
        }

        let message = cause.to_string().to_lowercase();
        if TRANSPORT_MARKERS.iter().any(|m| message.contains(m)) {
            return ErrorKind::Transport;
        }
        if DURABLE_TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
            return ErrorKind::DurableTransient;
        }
    }
    ErrorKind::Other
}

fn is_transport_io(err: &std::io::Error) -> bool {
    use std::io::ErrorKind as Io;
    matches!(
        err.kind(),
        Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::TimedOut
            | Io::UnexpectedEof
    )
}

fn is_sqlite_transient(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::{classify, ErrorKind};
    use eyre::{eyre, Report};

    #[test]
    fn io_connection_refused_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Report::new(io);
        assert_eq!(classify(&err), ErrorKind::Transport);
    }

    #[test]
    fn wrapped_cause_is_inspected() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Report::new(io).wrap_err("failed to enqueue car job");
        assert_eq!(classify(&err), ErrorKind::Transport);
    }

    #[test]
    fn message_markers_are_matched_case_insensitively() {
        for msg in [
            "ECONNREFUSED while connecting to 127.0.0.1:6379",
            "request timed out",
            "stream not writable",
            "offline queue is disabled",
            "getaddrinfo ENOTFOUND redis-master",
        ] {
            let err = eyre!("{msg}");
            assert_eq!(classify(&err), ErrorKind::Transport, "for {msg:?}");
        }
    }

    #[test]
    fn sqlite_busy_is_durable_transient() {
        let err = eyre!("database is locked");
        assert_eq!(classify(&err), ErrorKind::DurableTransient);
    }

    #[test]
    fn validation_errors_are_other() {
        for msg in [
            "invalid job payload: schema validation failed",
            "queue full",
            "unexpected response type",
        ] {
            let err = eyre!("{msg}");
            assert_eq!(classify(&err), ErrorKind::Other, "for {msg:?}");
        }
    }
}
