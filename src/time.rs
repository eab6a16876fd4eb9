use std::num::NonZeroU32;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    /// Seconds since the unix epoch.
    fn current_timestamp(&self) -> u64;
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn current_timestamp(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default()
    }
}

pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn current_timestamp(&self) -> u64 {
        self.0
    }
}

/// Sleeps for the requested duration divided by the wrapped factor.
pub struct TokioSleeper(pub NonZeroU32);

impl TokioSleeper {
    pub const fn default() -> Self {
        Self(NonZeroU32::MIN)
    }

    /// A sleeper that runs `factor` times faster than real time. Returns
    /// `None` for a zero factor.
    pub fn accelerated(factor: u32) -> Option<Self> {
        NonZeroU32::new(factor).map(Self)
    }
}

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration / self.0.get()).await
    }
}

/// Never sleeps.
pub struct Insomniac;

#[async_trait]
impl Sleeper for Insomniac {
    async fn sleep(&self, _duration: Duration) {}
}

/// Returns immediately, remembering every requested duration.
#[derive(Default)]
pub struct RecordingSleeper {
    requested: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.requested.lock().push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_acceleration_is_rejected() {
        assert!(TokioSleeper::accelerated(0).is_none());
        assert_eq!(4, TokioSleeper::accelerated(4).unwrap().0.get());
        assert_eq!(1, TokioSleeper::default().0.get());
    }

    #[tokio::test(start_paused = true)]
    async fn accelerated_sleeper_divides_the_delay() {
        let sleeper = TokioSleeper::accelerated(10).unwrap();
        let start = tokio::time::Instant::now();
        sleeper.sleep(Duration::from_secs(5)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_secs(1));
    }
}
