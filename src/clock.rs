//! Time abstraction for the sync pipeline.
//!
//! Retry delays, breaker reset periods, OAuth session expiry and health
//! windows all read time through [`Clock`], so tests can drive them with
//! [`MockClock`] instead of waiting on the wall clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Source of wall-clock time and delays.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock handle shared between services.
pub type SharedClock = Arc<dyn Clock>;

/// Real clock backed by chrono and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[async_trait]
impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

/// Deterministic clock for tests.
///
/// `sleep` returns immediately after advancing virtual time by the requested
/// duration, and every requested delay is recorded so callers can assert on
/// the backoff schedule.
#[derive(Debug, Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

#[derive(Debug)]
struct MockClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl MockClock {
    /// Create a mock clock starting at the current real time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a mock clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move virtual time forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.now += to_chrono(duration);
        }
    }

    /// Delays requested through [`Clock::sleep`], in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner
            .lock()
            .map(|state| state.sleeps.clone())
            .unwrap_or_default()
    }

    /// Sum of all recorded sleeps.
    pub fn total_slept(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner
            .lock()
            .map(|state| state.now)
            .unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.sleeps.push(duration);
            state.now += to_chrono(duration);
        }
        tokio::task::yield_now().await;
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_clock_sleep_advances_time_and_records() {
        let start = Utc::now();
        let clock = MockClock::starting_at(start);

        clock.sleep(Duration::from_millis(1500)).await;
        clock.sleep(Duration::from_secs(2)).await;

        assert_eq!(clock.now() - start, chrono::Duration::milliseconds(3500));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(1500), Duration::from_secs(2)]
        );
        assert_eq!(clock.total_slept(), Duration::from_millis(3500));
    }

    #[test]
    fn advance_does_not_record_sleep() {
        let start = Utc::now();
        let clock = MockClock::starting_at(start);
        clock.advance(Duration::from_secs(600));

        assert_eq!(clock.now() - start, chrono::Duration::minutes(10));
        assert!(clock.sleeps().is_empty());
    }
}
