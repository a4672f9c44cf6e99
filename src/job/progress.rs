//! Throttled progress text.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Minimum spacing between two progress messages.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(1500);

/// Receiver of human-readable progress messages.
pub type ProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

const NEVER: u64 = u64::MAX;

/// Forwards progress messages at most once per interval.
///
/// Safe to call from many workers at once; a message that loses the race
/// for a slot is dropped.
pub struct ThrottledProgress {
    sink: Option<ProgressSink>,
    interval: Duration,
    started: Instant,
    last_ms: AtomicU64,
}

impl fmt::Debug for ThrottledProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledProgress")
            .field("interval", &self.interval)
            .field("enabled", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ThrottledProgress {
    /// Wraps `sink`; `None` discards every message.
    #[must_use]
    pub fn new(sink: Option<ProgressSink>, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            started: Instant::now(),
            last_ms: AtomicU64::new(NEVER),
        }
    }

    /// Sends `message` unless one was sent less than an interval ago.
    pub fn update(&self, message: &str) {
        let Some(sink) = &self.sink else { return };
        let now = self.elapsed_ms();
        let interval = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);

        let last = self.last_ms.load(Ordering::Acquire);
        if last != NEVER && now.saturating_sub(last) < interval {
            return;
        }
        if self
            .last_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            sink(message);
        }
    }

    /// Sends `message` regardless of the interval.
    pub fn force(&self, message: &str) {
        if let Some(sink) = &self.sink {
            self.last_ms.store(self.elapsed_ms(), Ordering::Release);
            sink(message);
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX - 1)
    }
}
