use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum consecutive denials before lockout.
const MAX_DENIALS: u32 = 5;
/// Sliding window over which denials are counted.
const WINDOW: Duration = Duration::from_secs(60);
/// Lockout duration after exceeding MAX_DENIALS.
const LOCKOUT: Duration = Duration::from_secs(300);

struct StreamRecord {
    denials: u32,
    window_start: Instant,
    locked_until: Option<Instant>,
}

/// Per-stream limiter for verification attempts.
///
/// A camera stream (or terminal) that accumulates MAX_DENIALS denied
/// validations within WINDOW seconds is locked out for LOCKOUT seconds —
/// someone cycling photos in front of the lens gets slowed to a crawl.
/// Engine faults and storage errors are not counted; only a deliberate
/// access-denied outcome increments the counter, and a granted access
/// clears it.
pub struct AttemptLimiter {
    records: HashMap<String, StreamRecord>,
}

impl AttemptLimiter {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Return `Ok(())` if the stream may attempt validation, or
    /// `Err(message)` while it is locked out.
    pub fn check(&mut self, stream: &str) -> Result<(), String> {
        let now = Instant::now();
        let record = self
            .records
            .entry(stream.to_string())
            .or_insert(StreamRecord {
                denials: 0,
                window_start: now,
                locked_until: None,
            });

        if let Some(locked_until) = record.locked_until {
            if now < locked_until {
                let remaining = locked_until.duration_since(now).as_secs();
                return Err(format!(
                    "too many denied attempts; stream locked for {remaining}s"
                ));
            }
            // Lockout expired
            *record = StreamRecord {
                denials: 0,
                window_start: now,
                locked_until: None,
            };
        } else if now.duration_since(record.window_start) >= WINDOW {
            record.denials = 0;
            record.window_start = now;
        }

        Ok(())
    }

    /// Record a denied validation. May trigger a lockout.
    pub fn record_denial(&mut self, stream: &str) {
        let now = Instant::now();
        let record = self
            .records
            .entry(stream.to_string())
            .or_insert(StreamRecord {
                denials: 0,
                window_start: now,
                locked_until: None,
            });

        if now.duration_since(record.window_start) >= WINDOW {
            record.denials = 0;
            record.window_start = now;
        }

        record.denials += 1;
        if record.denials >= MAX_DENIALS {
            record.locked_until = Some(now + LOCKOUT);
            tracing::warn!(
                stream,
                denials = record.denials,
                lockout_secs = LOCKOUT.as_secs(),
                "attempt limit reached — locking stream"
            );
        } else {
            tracing::debug!(
                stream,
                denials = record.denials,
                max = MAX_DENIALS,
                "validation denied — counter incremented"
            );
        }
    }

    /// Record a granted access — the denial counter resets.
    pub fn record_granted(&mut self, stream: &str) {
        self.records.remove(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit() {
        let mut limiter = AttemptLimiter::new();
        for _ in 0..4 {
            assert!(limiter.check("door-1").is_ok());
            limiter.record_denial("door-1");
        }
        assert!(limiter.check("door-1").is_ok());
    }

    #[test]
    fn locks_after_max_denials() {
        let mut limiter = AttemptLimiter::new();
        for _ in 0..MAX_DENIALS {
            limiter.record_denial("door-1");
        }
        assert!(limiter.check("door-1").is_err());
    }

    #[test]
    fn grant_clears_counter() {
        let mut limiter = AttemptLimiter::new();
        for _ in 0..4 {
            limiter.record_denial("door-1");
        }
        limiter.record_granted("door-1");
        assert!(limiter.check("door-1").is_ok());
    }

    #[test]
    fn streams_are_independent() {
        let mut limiter = AttemptLimiter::new();
        for _ in 0..MAX_DENIALS {
            limiter.record_denial("door-1");
        }
        assert!(limiter.check("lobby").is_ok());
        assert!(limiter.check("door-1").is_err());
    }
}
