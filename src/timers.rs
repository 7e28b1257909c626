// Protocol timers and flash update debouncing

use std::time::Duration;

pub const SUPPLY_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_WAITTIME: Duration = Duration::from_secs(2);
pub const MAX_WAITTIME: Duration = Duration::from_secs(5);
pub const STALE_TIME: Duration = Duration::from_secs(90);
pub const EXPIRE_TIME: Duration = Duration::from_secs(180);
pub const GARBAGE_TIME: Duration = Duration::from_secs(240);
pub const HOLD_DOWN_TIME: Duration = Duration::from_secs(60);
pub const KERNEL_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How long an operator-deleted route is left alone before it is re-added
pub const K_KEEP_LIM: Duration = Duration::from_secs(30);

/// Interval values for the RIP state machine.
///
/// All timestamps in the daemon are durations since the daemon started, so
/// tests can drive time explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timers {
    pub supply: Duration,
    pub stale: Duration,
    pub expire: Duration,
    pub garbage: Duration,
    pub hold_down: Duration,
    pub flash_min: Duration,
    pub flash_max: Duration,
    pub kernel_poll: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Timers {
            supply: SUPPLY_INTERVAL,
            stale: STALE_TIME,
            expire: EXPIRE_TIME,
            garbage: GARBAGE_TIME,
            hold_down: HOLD_DOWN_TIME,
            flash_min: MIN_WAITTIME,
            flash_max: MAX_WAITTIME,
            kernel_poll: KERNEL_POLL_INTERVAL,
        }
    }
}

impl Timers {
    /// Routes last heard before this are stale
    pub fn now_stale(&self, now: Duration) -> Duration {
        now.saturating_sub(self.stale)
    }

    /// Routes last heard before this are advertised as unreachable
    pub fn now_expire(&self, now: Duration) -> Duration {
        now.saturating_sub(self.expire)
    }

    /// Routes last heard before this are deleted
    pub fn now_garbage(&self, now: Duration) -> Duration {
        now.saturating_sub(self.garbage)
    }
}

/// Rate limiter for triggered updates.
///
/// A change arms the timer; the update goes out no sooner than the minimum
/// wait after the change and never sooner than the jittered delay chosen when
/// the previous update was sent.
#[derive(Debug, Clone, Default)]
pub struct FlashTimer {
    need: bool,
    due: Duration,
    earliest: Duration,
}

impl FlashTimer {
    pub fn new() -> Self {
        FlashTimer::default()
    }

    /// Note that a route changed
    pub fn request(&mut self, now: Duration, min_wait: Duration) {
        if !self.need {
            self.need = true;
            self.due = (now + min_wait).max(self.earliest);
        }
    }

    #[cfg(test)]
    pub fn is_needed(&self) -> bool {
        self.need
    }

    /// When the pending update should go out, if one is pending
    pub fn deadline(&self) -> Option<Duration> {
        self.need.then_some(self.due)
    }

    pub fn is_due(&self, now: Duration) -> bool {
        self.need && now >= self.due
    }

    /// Record that an update (flash or full) went out. `delay` is the
    /// jittered gap, between the minimum and maximum wait, before the next
    /// flash may follow.
    pub fn sent(&mut self, now: Duration, delay: Duration) {
        self.need = false;
        self.earliest = now + delay;
    }

    /// Drop the pending update because a full update is imminent
    pub fn cancel(&mut self) {
        self.need = false;
    }
}
