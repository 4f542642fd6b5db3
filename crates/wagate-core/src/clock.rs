//! Time and jitter abstraction.
//!
//! Every delay, backoff, and probability roll in the gateway goes through
//! [`Clock`] so tests can run deterministically without wall-clock reads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Source of time, sleeps, and randomness.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, dur: Duration);

    /// Uniformly random duration in `[min, max]`.
    fn uniform(&self, min: Duration, max: Duration) -> Duration;

    /// True with probability `p` (0.0..=1.0).
    fn chance(&self, p: f64) -> bool;
}

/// Production clock: wall time, tokio sleeps, thread-local RNG.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }

    fn uniform(&self, min: Duration, max: Duration) -> Duration {
        if max <= min {
            return min;
        }
        let span = (max - min).as_millis() as u64;
        let offset = rand::thread_rng().gen_range(0..=span);
        min + Duration::from_millis(offset)
    }

    fn chance(&self, p: f64) -> bool {
        rand::thread_rng().gen::<f64>() < p
    }
}

/// Deterministic clock for tests.
///
/// `sleep` advances the virtual time instead of waiting (yielding once so
/// loops that only sleep stay cooperative on a test runtime); `uniform`
/// returns the lower bound unless a value was scripted; `chance` pops
/// scripted outcomes and defaults to `false`.
pub mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub struct FakeClock {
        now: Mutex<DateTime<Utc>>,
        uniform_script: Mutex<VecDeque<Duration>>,
        chance_script: Mutex<VecDeque<bool>>,
        /// Total virtual time slept, for assertions.
        slept: Mutex<Duration>,
    }

    impl FakeClock {
        pub fn at(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
                uniform_script: Mutex::new(VecDeque::new()),
                chance_script: Mutex::new(VecDeque::new()),
                slept: Mutex::new(Duration::ZERO),
            }
        }

        pub fn advance(&self, dur: Duration) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(dur).unwrap_or_else(|_| chrono::Duration::zero());
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }

        /// Queue the next values `uniform` will return.
        pub fn script_uniform(&self, values: impl IntoIterator<Item = Duration>) {
            self.uniform_script.lock().unwrap().extend(values);
        }

        /// Queue the next outcomes `chance` will return.
        pub fn script_chance(&self, values: impl IntoIterator<Item = bool>) {
            self.chance_script.lock().unwrap().extend(values);
        }

        pub fn total_slept(&self) -> Duration {
            *self.slept.lock().unwrap()
        }
    }

    #[async_trait]
    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        async fn sleep(&self, dur: Duration) {
            self.advance(dur);
            *self.slept.lock().unwrap() += dur;
            tokio::task::yield_now().await;
        }

        fn uniform(&self, min: Duration, _max: Duration) -> Duration {
            self.uniform_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(min)
        }

        fn chance(&self, _p: f64) -> bool {
            self.chance_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_stays_in_range() {
        let clock = SystemClock;
        let min = Duration::from_millis(800);
        let max = Duration::from_millis(1800);
        for _ in 0..100 {
            let d = clock.uniform(min, max);
            assert!(d >= min && d <= max);
        }
    }

    #[test]
    fn uniform_degenerate_range_returns_min() {
        let clock = SystemClock;
        let d = Duration::from_secs(3);
        assert_eq!(clock.uniform(d, d), d);
        assert_eq!(clock.uniform(d, Duration::from_secs(1)), d);
    }

    #[tokio::test]
    async fn fake_clock_sleep_advances_time() {
        let clock = testing::FakeClock::at(Utc::now());
        let before = clock.now();
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - before).num_seconds(), 90);
        assert_eq!(clock.total_slept(), Duration::from_secs(90));
    }
}
