//! Clock port - 時刻の抽象化
//!
//! Task and job timestamps are unix seconds. Everything that stamps a document
//! or compares ages goes through a `Clock`, so tests can pin time.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as unix seconds (the document timestamp format).
    fn timestamp(&self) -> i64 {
        self.now().timestamp()
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock pinned to a unix-seconds timestamp.
    pub fn at(timestamp: i64) -> Self {
        Self::new(DateTime::from_timestamp(timestamp, 0).unwrap_or_default())
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|guard| *guard).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_only_moves_when_told() {
        let clock = FixedClock::at(1_700_000_000);
        assert_eq!(clock.timestamp(), 1_700_000_000);

        clock.advance(Duration::seconds(90));
        assert_eq!(clock.timestamp(), 1_700_000_090);
    }

    #[test]
    fn shared_clock_reads_through() {
        let clock = Arc::new(FixedClock::at(1_700_000_000));
        let shared: Arc<dyn Clock> = clock.clone();
        clock.advance(Duration::seconds(5));
        assert_eq!(shared.timestamp(), 1_700_000_005);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.timestamp() > 1_577_836_800);
    }
}
