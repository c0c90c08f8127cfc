use crate::error::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Timestamp is a hybrid-clock value, totally ordered. The unit is opaque to
/// this module's callers; `SystemClock` uses microseconds since the epoch.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(value: u64) -> Self {
        Timestamp(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HybridClock issues monotonically increasing timestamps and can be bumped
/// by timestamps observed from other nodes, so that causally-later reads see
/// causally-earlier commits.
pub trait Clock: Send + Sync {
    /// Returns a timestamp strictly greater than any previously returned or
    /// accepted one.
    fn now(&self) -> Timestamp;

    /// Moves the clock forward so future `now()` calls return a value
    /// greater than `ts`. Rejects timestamps implausibly far ahead.
    fn update(&self, ts: Timestamp) -> Result<()>;
}

/// SystemClock tracks physical time in microseconds, forced monotone across
/// `now()`/`update()` interleavings.
pub struct SystemClock {
    /// Largest value handed out or accepted so far.
    last: Mutex<u64>,
    /// Updates beyond physical-now + this margin are rejected as bogus.
    max_forward_jump_micros: u64,
}

const DEFAULT_MAX_FORWARD_JUMP_MICROS: u64 = 10_000_000;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            last: Mutex::new(0),
            max_forward_jump_micros: DEFAULT_MAX_FORWARD_JUMP_MICROS,
        }
    }

    fn physical_now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_micros() as u64
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let mut last = self.last.lock().expect("SystemClock.now() mutex guard poison");
        let physical = Self::physical_now_micros();
        *last = physical.max(*last + 1);
        Timestamp(*last)
    }

    fn update(&self, ts: Timestamp) -> Result<()> {
        let mut last = self.last.lock().expect("SystemClock.update() mutex guard poison");
        let physical = Self::physical_now_micros();
        if ts.value() > physical + self.max_forward_jump_micros {
            return Err(Error::InvalidArgument(format!(
                "Timestamp {} is too far ahead of physical time {}",
                ts, physical
            )));
        }
        if ts.value() > *last {
            *last = ts.value();
        }
        Ok(())
    }
}

/// ManualClock only moves when told to. Tests drive it.
pub struct ManualClock {
    now: Mutex<u64>,
    reject_updates: Mutex<bool>,
}

impl ManualClock {
    pub fn new(initial: Timestamp) -> Self {
        ManualClock {
            now: Mutex::new(initial.value()),
            reject_updates: Mutex::new(false),
        }
    }

    pub fn set(&self, ts: Timestamp) {
        *self.now.lock().expect("ManualClock.set() mutex guard poison") = ts.value();
    }

    /// Makes every subsequent `update()` fail, to exercise clock-rejection
    /// paths.
    pub fn reject_updates(&self) {
        *self
            .reject_updates
            .lock()
            .expect("ManualClock.reject_updates() mutex guard poison") = true;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let mut now = self.now.lock().expect("ManualClock.now() mutex guard poison");
        *now += 1;
        Timestamp(*now)
    }

    fn update(&self, ts: Timestamp) -> Result<()> {
        if *self
            .reject_updates
            .lock()
            .expect("ManualClock.update() mutex guard poison")
        {
            return Err(Error::InvalidArgument(format!(
                "Manual clock refusing update to {}",
                ts
            )));
        }
        let mut now = self.now.lock().expect("ManualClock.update() mutex guard poison");
        if ts.value() > *now {
            *now = ts.value();
        }
        Ok(())
    }
}

/// TimeManager couples the clock with the last timestamp assigned to a
/// replicated op, so ops observe monotonically increasing timestamps even
/// when the clock is bumped externally.
pub struct TimeManager {
    clock: Arc<dyn Clock>,
    last_assigned: Mutex<Timestamp>,
}

impl TimeManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        TimeManager {
            clock,
            last_assigned: Mutex::new(Timestamp::new(0)),
        }
    }

    /// Assigns a fresh timestamp to an op being replicated.
    pub fn assign_timestamp(&self) -> Timestamp {
        let ts = self.clock.now();
        let mut last = self
            .last_assigned
            .lock()
            .expect("TimeManager.assign_timestamp() mutex guard poison");
        if ts > *last {
            *last = ts;
        }
        ts
    }

    pub fn last_assigned(&self) -> Timestamp {
        *self
            .last_assigned
            .lock()
            .expect("TimeManager.last_assigned() mutex guard poison")
    }

    /// Bumps both the clock and the assigned-timestamp watermark to at least
    /// `ts`. Fails if the clock rejects the value; the watermark is then
    /// untouched.
    pub fn update_clock_and_last_assigned(&self, ts: Timestamp) -> Result<()> {
        self.clock.update(ts)?;
        let mut last = self
            .last_assigned
            .lock()
            .expect("TimeManager.update_clock_and_last_assigned() mutex guard poison");
        if ts > *last {
            *last = ts;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn system_clock_is_monotone() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn system_clock_rejects_far_future() {
        let clock = SystemClock::new();
        let far = Timestamp::new(SystemClock::physical_now_micros() + 60_000_000);
        assert!(matches!(clock.update(far), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn update_ratchets_now_forward() {
        let clock = ManualClock::new(Timestamp::new(100));
        clock.update(Timestamp::new(500)).unwrap();
        assert!(clock.now() > Timestamp::new(500));
        // An older timestamp does not move the clock backwards.
        clock.update(Timestamp::new(10)).unwrap();
        assert!(clock.now() > Timestamp::new(500));
    }

    #[test]
    fn time_manager_tracks_last_assigned() {
        let manager = TimeManager::new(Arc::new(ManualClock::new(Timestamp::new(100))));

        let assigned = manager.assign_timestamp();
        assert_eq!(manager.last_assigned(), assigned);

        manager
            .update_clock_and_last_assigned(Timestamp::new(1_000))
            .unwrap();
        assert_eq!(manager.last_assigned(), Timestamp::new(1_000));
        // The next assignment lands past the bumped value.
        assert!(manager.assign_timestamp() > Timestamp::new(1_000));
    }

    #[test]
    fn rejected_update_leaves_last_assigned() {
        let clock = Arc::new(ManualClock::new(Timestamp::new(100)));
        let manager = TimeManager::new(Arc::clone(&clock) as Arc<dyn Clock>);
        let before = manager.assign_timestamp();

        clock.reject_updates();
        let result = manager.update_clock_and_last_assigned(Timestamp::new(9_999));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(manager.last_assigned(), before);
    }
}
