//! Throttled upstream-error logging
//!
//! Stale internal sync ports reconnect in tight loops; logging every
//! failure floods the logs. One line per `target|code` key per 15 s
//! window, with a suppressed-count summary when the window rolls over.

use dashmap::DashMap;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(15);

struct WindowState {
    window_start: Instant,
    suppressed: u64,
}

#[derive(Default)]
pub struct ThrottledLog {
    windows: DashMap<String, WindowState>,
}

impl ThrottledLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log one upstream error, deduplicated per key.
    pub fn warn(&self, key: &str, message: &str) {
        if let Some(suppressed) = self.admit(key, Instant::now()) {
            if suppressed > 0 {
                tracing::warn!(key, suppressed, "{message} (suppressed {suppressed} similar)");
            } else {
                tracing::warn!(key, "{message}");
            }
        }
    }

    /// `Some(previously_suppressed)` when the caller should emit now.
    fn admit(&self, key: &str, now: Instant) -> Option<u64> {
        match self.windows.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(WindowState {
                    window_start: now,
                    suppressed: 0,
                });
                Some(0)
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if now.duration_since(state.window_start) >= WINDOW {
                    let suppressed = state.suppressed;
                    state.window_start = now;
                    state.suppressed = 0;
                    Some(suppressed)
                } else {
                    state.suppressed += 1;
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_hit_logs_then_suppresses() {
        let log = ThrottledLog::new();
        let t0 = Instant::now();

        assert_eq!(log.admit("editor:23456|1006", t0), Some(0));
        assert_eq!(log.admit("editor:23456|1006", t0 + Duration::from_secs(1)), None);
        assert_eq!(log.admit("editor:23456|1006", t0 + Duration::from_secs(2)), None);

        // Window rollover reports what was swallowed.
        assert_eq!(
            log.admit("editor:23456|1006", t0 + Duration::from_secs(16)),
            Some(2)
        );
    }

    #[test]
    fn keys_are_independent() {
        let log = ThrottledLog::new();
        let t0 = Instant::now();
        assert_eq!(log.admit("a|1006", t0), Some(0));
        assert_eq!(log.admit("b|1006", t0), Some(0));
        assert_eq!(log.admit("a|1011", t0), Some(0));
    }
}
