//! # wagate-behavior
//!
//! Gates outbound work so per-process throughput mimics human limits:
//! hourly/daily counters, a cooldown between actions, a randomized daily
//! active-hours window, scaled read/response/typing delays, occasional
//! simulated network hiccups, and a bounded dedup set of processed
//! message ids.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc, Weekday};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use wagate_core::clock::Clock;
use wagate_core::config::BehaviorConfig;

/// Most recent message ids remembered for dedup. FIFO eviction.
pub const DEDUP_CAP: usize = 1000;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    Reject(RejectReason),
}

/// Why an admission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    HourlyLimit,
    DailyLimit,
    Cooldown,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::HourlyLimit => "hourly_limit",
            RejectReason::DailyLimit => "daily_limit",
            RejectReason::Cooldown => "cooldown",
        }
    }
}

/// Point-in-time view of the counters, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BehaviorSnapshot {
    pub hourly_count: u32,
    pub hourly_cap: u32,
    pub daily_count: u32,
    pub daily_cap: u32,
    pub active_hours_start: u32,
    pub active_hours_end: u32,
    pub currently_active: bool,
    pub dedup_size: usize,
}

struct State {
    hourly_count: u32,
    daily_count: u32,
    last_hour_reset: DateTime<Utc>,
    last_day_reset: DateTime<Utc>,
    last_action_at: Option<DateTime<Utc>>,
    dedup_order: VecDeque<String>,
    dedup_set: HashSet<String>,
    active_hours: Option<ActiveHours>,
    /// Window starts for which a limit notice has already been posted.
    hourly_notice_for: Option<DateTime<Utc>>,
    daily_notice_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveHours {
    date: NaiveDate,
    start: u32,
    end: u32,
}

/// The human-behavior manager. Cheap to clone via `Arc`.
pub struct HumanBehavior {
    cfg: BehaviorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl HumanBehavior {
    pub fn new(cfg: BehaviorConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            cfg,
            clock,
            state: Mutex::new(State {
                hourly_count: 0,
                daily_count: 0,
                last_hour_reset: now,
                last_day_reset: now,
                last_action_at: None,
                dedup_order: VecDeque::new(),
                dedup_set: HashSet::new(),
                active_hours: None,
                hourly_notice_for: None,
                daily_notice_for: None,
            }),
        }
    }

    /// Check whether another action may be processed right now.
    ///
    /// Pure accounting: rolls the hourly/daily windows forward and checks
    /// caps and cooldown, but does not count the action — callers count
    /// via [`record_processed`](Self::record_processed) once the work is done.
    pub fn try_admit(&self) -> Admission {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        Self::roll_windows(&mut st, now);

        if let Some(last) = st.last_action_at {
            let cooldown = chrono::Duration::milliseconds(self.cfg.cooldown_ms as i64);
            if now - last < cooldown {
                return Admission::Reject(RejectReason::Cooldown);
            }
        }
        if st.hourly_count >= self.cfg.hourly_cap {
            return Admission::Reject(RejectReason::HourlyLimit);
        }
        if st.daily_count >= self.cfg.daily_cap {
            return Admission::Reject(RejectReason::DailyLimit);
        }
        Admission::Admit
    }

    /// Count one processed action and remember its message id for dedup.
    pub fn record_processed(&self, wa_message_id: &str) {
        let now = self.clock.now();
        let mut st = self.state.lock().unwrap();
        Self::roll_windows(&mut st, now);

        st.hourly_count += 1;
        st.daily_count += 1;
        st.last_action_at = Some(now);

        if st.dedup_set.insert(wa_message_id.to_string()) {
            st.dedup_order.push_back(wa_message_id.to_string());
            if st.dedup_order.len() > DEDUP_CAP {
                if let Some(evicted) = st.dedup_order.pop_front() {
                    st.dedup_set.remove(&evicted);
                }
            }
        }
    }

    /// Whether this message id was already processed (within the dedup window).
    pub fn was_processed(&self, wa_message_id: &str) -> bool {
        self.state.lock().unwrap().dedup_set.contains(wa_message_id)
    }

    /// True exactly once per rate-limit window: the first caller after a
    /// rejection gets to post the informational notice, later callers in
    /// the same window do not.
    pub fn take_limit_notice(&self, reason: RejectReason) -> bool {
        let mut st = self.state.lock().unwrap();
        match reason {
            RejectReason::HourlyLimit => {
                let window = st.last_hour_reset;
                if st.hourly_notice_for == Some(window) {
                    false
                } else {
                    st.hourly_notice_for = Some(window);
                    true
                }
            }
            RejectReason::DailyLimit => {
                let window = st.last_day_reset;
                if st.daily_notice_for == Some(window) {
                    false
                } else {
                    st.daily_notice_for = Some(window);
                    true
                }
            }
            RejectReason::Cooldown => false,
        }
    }

    /// Whether the current time falls inside today's active-hours window.
    ///
    /// The window is regenerated once per calendar date with ±1h jitter
    /// around a 07:00–23:00 day, clamped to `[6, 24]`.
    pub fn active_hours_now(&self) -> bool {
        let now = self.clock.now();
        let hours = self.current_active_hours(now);
        let hour = now.hour();
        hours.start <= hour && hour < hours.end
    }

    /// Randomized read delay, scaled by time-of-day multipliers.
    pub fn read_delay(&self) -> Duration {
        self.scaled_delay(
            self.cfg.read_delay_ms.min_duration(),
            self.cfg.read_delay_ms.max_duration(),
        )
    }

    /// Randomized response delay, scaled by time-of-day multipliers.
    pub fn response_delay(&self) -> Duration {
        self.scaled_delay(
            self.cfg.response_delay_ms.min_duration(),
            self.cfg.response_delay_ms.max_duration(),
        )
    }

    /// Randomized typing duration, scaled by time-of-day multipliers.
    pub fn typing_duration(&self) -> Duration {
        self.scaled_delay(
            self.cfg.typing_ms.min_duration(),
            self.cfg.typing_ms.max_duration(),
        )
    }

    /// Minimum spacing between counted actions.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cfg.cooldown_ms)
    }

    /// With P=0.03, pause for 2–10s to mimic a flaky network.
    pub async fn maybe_network_hiccup(&self) {
        if self.clock.chance(0.03) {
            let pause = self
                .clock
                .uniform(Duration::from_secs(2), Duration::from_secs(10));
            debug!("simulating network hiccup for {pause:?}");
            self.clock.sleep(pause).await;
        }
    }

    pub fn snapshot(&self) -> BehaviorSnapshot {
        let now = self.clock.now();
        let hours = self.current_active_hours(now);
        let hour = now.hour();
        let st = self.state.lock().unwrap();
        BehaviorSnapshot {
            hourly_count: st.hourly_count,
            hourly_cap: self.cfg.hourly_cap,
            daily_count: st.daily_count,
            daily_cap: self.cfg.daily_cap,
            active_hours_start: hours.start,
            active_hours_end: hours.end,
            currently_active: hours.start <= hour && hour < hours.end,
            dedup_size: st.dedup_set.len(),
        }
    }

    /// Single seam for delay scaling. A future "away"/session-break policy
    /// wraps this method rather than touching individual delay sites.
    fn scaled_delay(&self, min: Duration, max: Duration) -> Duration {
        let now = self.clock.now();
        let base = self.clock.uniform(min, max);

        let sleep_mult = if self.active_hours_now() { 1.0 } else { 5.0 };
        let weekend_mult = match now.weekday() {
            Weekday::Sat | Weekday::Sun => 1.5,
            _ => 1.0,
        };
        let day_mult = match now.hour() {
            h if h < 10 => 1.0,
            h if h < 14 => 1.2,
            h if h < 18 => 1.0,
            _ => 1.5,
        };

        base.mul_f64(sleep_mult * weekend_mult * day_mult)
    }

    fn current_active_hours(&self, now: DateTime<Utc>) -> ActiveHours {
        let mut st = self.state.lock().unwrap();
        let today = now.date_naive();
        match st.active_hours {
            Some(hours) if hours.date == today => hours,
            _ => {
                let hours = ActiveHours {
                    date: today,
                    start: self.jittered_hour(7),
                    end: self.jittered_hour(23),
                };
                debug!("active hours for {today}: {}..{}", hours.start, hours.end);
                st.active_hours = Some(hours);
                hours
            }
        }
    }

    /// `clamp(6, 24, base + U(-1, 1))`, integer floor.
    fn jittered_hour(&self, base: i64) -> u32 {
        let jitter_ms = self
            .clock
            .uniform(Duration::ZERO, Duration::from_millis(2_000))
            .as_millis() as f64;
        let offset = jitter_ms / 1_000.0 - 1.0;
        let hour = (base as f64 + offset).floor();
        hour.clamp(6.0, 24.0) as u32
    }

    fn roll_windows(st: &mut State, now: DateTime<Utc>) {
        if now - st.last_hour_reset >= chrono::Duration::hours(1) {
            st.hourly_count = 0;
            st.last_hour_reset = now;
        }
        if now - st.last_day_reset >= chrono::Duration::hours(24) {
            st.daily_count = 0;
            st.last_day_reset = now;
        }
    }
}
