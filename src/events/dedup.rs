//! Per-event-UID alert dedup cache.
//!
//! A naive implementation would grow unbounded; instead a lazy sweep runs
//! once the cache crosses a fixed low-watermark, dropping entries older
//! than the dedup window. Ported from the cache-cleanup behavior of the
//! original event alert processor.

use std::collections::HashMap;

const CACHE_SWEEP_WATERMARK: usize = 100;

pub struct DedupCache {
    last_alert_at: HashMap<String, i64>,
    window_secs: i64,
}

impl DedupCache {
    pub fn new(window_secs: i64) -> Self {
        Self {
            last_alert_at: HashMap::new(),
            window_secs,
        }
    }

    /// Returns `true` if a notification should fire for this event UID at
    /// `now`, and records `now` as the last-alerted time when it does.
    pub fn should_notify(&mut self, event_uid: &str, now: i64) -> bool {
        self.lazy_cleanup(now);

        let should = match self.last_alert_at.get(event_uid) {
            Some(last) => now - last >= self.window_secs,
            None => true,
        };
        if should {
            self.last_alert_at.insert(event_uid.to_string(), now);
        }
        should
    }

    fn lazy_cleanup(&mut self, now: i64) {
        if self.last_alert_at.len() <= CACHE_SWEEP_WATERMARK {
            return;
        }
        let window = self.window_secs;
        self.last_alert_at.retain(|_, last| now - *last < window);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_alert_at.len()
    }
}
