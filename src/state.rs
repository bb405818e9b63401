use parking_lot::Mutex;

/// Which path `write_car` routes records through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederMode {
    /// Remote queue is healthy; records go to Redis.
    Redis,
    /// Remote queue is down; records go to the local SQLite store.
    Sqlite,
}

impl std::fmt::Display for SeederMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeederMode::Redis => write!(f, "redis"),
            SeederMode::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Sole owner of the producer mode. Other components go through `mode()` /
/// `set_mode()` instead of carrying the enum around.
pub struct StateManager {
    mode: Mutex<SeederMode>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(SeederMode::Redis),
        }
    }

    pub fn mode(&self) -> SeederMode {
        *self.mode.lock()
    }

    /// Replaces the mode and returns the previous value. Only actual
    /// transitions are logged.
    pub fn set_mode(&self, next: SeederMode) -> SeederMode {
        let mut guard = self.mode.lock();
        let prev = *guard;
        *guard = next;
        drop(guard);
        if prev != next {
            tracing::info!(from = %prev, to = %next, "seeder mode changed");
        }
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::{SeederMode, StateManager};

    #[test]
    fn defaults_to_redis_mode() {
        let state = StateManager::new();
        assert_eq!(state.mode(), SeederMode::Redis);
    }

    #[test]
    fn set_mode_returns_previous() {
        let state = StateManager::new();
        assert_eq!(state.set_mode(SeederMode::Sqlite), SeederMode::Redis);
        assert_eq!(state.mode(), SeederMode::Sqlite);
        assert_eq!(state.set_mode(SeederMode::Sqlite), SeederMode::Sqlite);
        assert_eq!(state.set_mode(SeederMode::Redis), SeederMode::Sqlite);
        assert_eq!(state.mode(), SeederMode::Redis);
    }
}
