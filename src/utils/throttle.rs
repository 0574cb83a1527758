//! Log throttling
//!
//! A misbehaving client can trigger the same warning for every frame it
//! sends. `LogThrottler` lets one message per key through each interval and
//! counts what it swallowed in between.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Per-key log rate limiter
#[derive(Debug)]
pub struct LogThrottler {
    interval: Duration,
    entries: Mutex<HashMap<&'static str, Entry>>,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when a message for `key` may be logged,
    /// where `suppressed` is the number of messages dropped since the last
    /// one that went through. Returns `None` while throttled.
    pub fn check(&self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = std::mem::take(&mut entry.suppressed);
                entry.last_logged = now;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`; the event carries a `suppressed` field
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

/// Throttled `tracing::debug!`; the event carries a `suppressed` field
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::debug!(suppressed, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_call_passes() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("malformed"), Some(0));
    }

    #[test]
    fn test_counts_suppressed_messages() {
        let throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("frame_dropped"), Some(0));
        assert_eq!(throttler.check("frame_dropped"), None);
        assert_eq!(throttler.check("frame_dropped"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("frame_dropped"), Some(2));
        assert_eq!(throttler.check("frame_dropped"), None);
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);

        assert!(throttler.check("a").is_some());
        assert!(throttler.check("b").is_some());
        assert!(throttler.check("a").is_none());
        assert!(throttler.check("b").is_none());
    }

    #[test]
    fn test_macros_expand() {
        let throttler = LogThrottler::default();
        warn_throttled!(throttler, "warn_key", "warning {}", 1);
        debug_throttled!(throttler, "debug_key", "debug {}", 2);
        assert!(throttler.check("warn_key").is_none());
        assert!(throttler.check("debug_key").is_none());
    }
}
