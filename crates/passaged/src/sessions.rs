use std::collections::HashMap;
use std::time::{Duration, Instant};

use passage_core::{LivenessConfig, LivenessSession};

struct Entry {
    session: LivenessSession,
    last_seen: Instant,
}

/// Per-stream liveness session registry.
///
/// Each camera stream owns an independent session — motion and texture
/// baselines must never mix across subjects. Abandoned sessions are pruned
/// after `max_idle` so a walked-away attempt cannot donate its history to
/// the next person at the door.
pub struct SessionRegistry {
    liveness: LivenessConfig,
    max_idle: Duration,
    entries: HashMap<String, Entry>,
}

impl SessionRegistry {
    pub fn new(liveness: LivenessConfig, max_idle: Duration) -> Self {
        Self {
            liveness,
            max_idle,
            entries: HashMap::new(),
        }
    }

    /// Borrow the session for a stream, creating it on first use. Stale
    /// sessions are pruned on every access.
    pub fn session_mut(&mut self, stream: &str) -> &mut LivenessSession {
        self.prune_stale();

        let liveness = self.liveness.clone();
        let entry = self
            .entries
            .entry(stream.to_string())
            .or_insert_with(move || Entry {
                session: LivenessSession::new(liveness),
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
        &mut entry.session
    }

    /// Reset the session for a stream. Returns whether one existed.
    pub fn reset(&mut self, stream: &str) -> bool {
        match self.entries.get_mut(stream) {
            Some(entry) => {
                entry.session.reset();
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn prune_stale(&mut self) {
        let max_idle = self.max_idle;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_seen.elapsed() < max_idle);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            tracing::debug!(pruned, "stale liveness sessions discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_idle: Duration) -> SessionRegistry {
        SessionRegistry::new(LivenessConfig::default(), max_idle)
    }

    #[test]
    fn creates_one_session_per_stream() {
        let mut reg = registry(Duration::from_secs(60));
        reg.session_mut("door-1");
        reg.session_mut("door-2");
        reg.session_mut("door-1");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn reset_reports_existence() {
        let mut reg = registry(Duration::from_secs(60));
        assert!(!reg.reset("door-1"));
        reg.session_mut("door-1");
        assert!(reg.reset("door-1"));
    }

    #[test]
    fn idle_sessions_are_pruned() {
        let mut reg = registry(Duration::from_millis(5));
        reg.session_mut("door-1");
        std::thread::sleep(Duration::from_millis(10));
        reg.session_mut("door-2");
        assert_eq!(reg.len(), 1);
    }
}
