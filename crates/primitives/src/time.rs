//! Second-resolution timestamps, slot arithmetic and the injectable clock.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

/// Seconds since the Unix epoch. All consensus timestamps have second
/// resolution and fit 32 bits.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub u32);

impl Timestamp {
    /// The number of whole seconds since the epoch.
    #[inline]
    pub const fn secs(&self) -> u32 {
        self.0
    }

    /// The slot index this timestamp falls into.
    #[inline]
    pub const fn slot_number(&self, interval_secs: u32) -> u32 {
        self.0 / interval_secs
    }

    /// The start of the slot this timestamp falls into.
    #[inline]
    pub const fn slot_start(&self, interval_secs: u32) -> Timestamp {
        Timestamp(self.0 - self.0 % interval_secs)
    }

    /// `true` when the timestamp is aligned to a slot boundary.
    #[inline]
    pub const fn is_slot_aligned(&self, interval_secs: u32) -> bool {
        self.0 % interval_secs == 0
    }

    /// Saturating subtraction, in seconds.
    #[inline]
    pub const fn saturating_secs_since(&self, earlier: Timestamp) -> u32 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u32> for Timestamp {
    type Output = Timestamp;

    fn add(self, secs: u32) -> Timestamp {
        Timestamp(self.0 + secs)
    }
}

impl AddAssign<u32> for Timestamp {
    fn add_assign(&mut self, secs: u32) {
        self.0 += secs;
    }
}

impl Sub<u32> for Timestamp {
    type Output = Timestamp;

    fn sub(self, secs: u32) -> Timestamp {
        Timestamp(self.0 - secs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process-wide clock treated as a testable capability.
///
/// Production engines read system time; tests construct a [`Clock::fixed`]
/// instance and drive it explicitly. The lifecycle is per-engine, not
/// per-process.
#[derive(Clone, Debug)]
pub struct Clock(Arc<ClockInner>);

#[derive(Debug)]
enum ClockInner {
    System,
    Manual(parking_lot::Mutex<Timestamp>),
}

impl Clock {
    /// A clock reading the system time, truncated to seconds.
    pub fn system() -> Self {
        Clock(Arc::new(ClockInner::System))
    }

    /// A manually driven clock starting at `start`.
    pub fn fixed(start: Timestamp) -> Self {
        Clock(Arc::new(ClockInner::Manual(parking_lot::Mutex::new(start))))
    }

    /// The current time.
    pub fn now(&self) -> Timestamp {
        match &*self.0 {
            ClockInner::System => {
                let secs = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .expect("system clock before Unix epoch")
                    .as_secs();
                Timestamp(secs as u32)
            }
            ClockInner::Manual(current) => *current.lock(),
        }
    }

    /// Advances a manual clock by `secs`. No-op on a system clock.
    pub fn advance(&self, secs: u32) {
        if let ClockInner::Manual(current) = &*self.0 {
            let mut guard = current.lock();
            *guard = *guard + secs;
        }
    }

    /// Sets a manual clock to an absolute time. No-op on a system clock.
    pub fn set(&self, now: Timestamp) {
        if let ClockInner::Manual(current) = &*self.0 {
            *current.lock() = now;
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_alignment() {
        let ts = Timestamp(1_000_007);
        assert!(!ts.is_slot_aligned(10));
        assert_eq!(ts.slot_start(10), Timestamp(1_000_000));
        assert_eq!(ts.slot_number(10), 100_000);
        assert!(ts.slot_start(10).is_slot_aligned(10));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = Clock::fixed(Timestamp(100));
        assert_eq!(clock.now(), Timestamp(100));
        clock.advance(20);
        assert_eq!(clock.now(), Timestamp(120));
        clock.set(Timestamp(50));
        assert_eq!(clock.now(), Timestamp(50));
    }
}
