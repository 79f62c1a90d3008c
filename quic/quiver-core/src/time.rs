// Copyright the quiver authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monotonic time primitives shared by the send pipeline and congestion control

use core::{fmt, ops, time::Duration};

/// A monotonic instant measured from an unspecified epoch
///
/// `Timestamp` deliberately has no relationship to wall-clock time; only
/// differences between two timestamps produced by the same `Clock` are
/// meaningful.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// Creates a `Timestamp` from a duration since the clock epoch
    #[inline]
    pub const fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    /// Creates a `Timestamp` from microseconds since the clock epoch
    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Self(Duration::from_micros(micros))
    }

    /// Returns the number of microseconds since the clock epoch
    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0.as_micros() as u64
    }

    /// Returns the elapsed time since `earlier`, or zero if `earlier` is later
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.0.checked_sub(earlier.0).unwrap_or_default()
    }

    /// Returns `true` if `self` is at or after `other`
    #[inline]
    pub fn has_elapsed(self, other: Self) -> bool {
        self >= other
    }
}

impl ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

impl ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl ops::Sub<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Duration) -> Self {
        Self(self.0 - rhs)
    }
}

impl ops::Sub<Timestamp> for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Duration {
        self.0 - rhs.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}us", self.as_micros())
    }
}

/// A source of monotonic timestamps
pub trait Clock {
    fn get_time(&self) -> Timestamp;
}

/// A clock that always returns the epoch plus one second
///
/// Tests derive the timestamps they need by adding offsets to this value.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClock;

impl Clock for NoopClock {
    #[inline]
    fn get_time(&self) -> Timestamp {
        Timestamp(Duration::from_secs(1))
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        use std::time::Instant;

        /// A `Clock` backed by `std::time::Instant`
        #[derive(Clone, Debug)]
        pub struct StdClock {
            epoch: Instant,
        }

        impl Default for StdClock {
            fn default() -> Self {
                Self { epoch: Instant::now() }
            }
        }

        impl Clock for StdClock {
            #[inline]
            fn get_time(&self) -> Timestamp {
                // offset by 1s so the epoch itself is never observed
                Timestamp(self.epoch.elapsed() + Duration::from_secs(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_duration_since() {
        let a = NoopClock.get_time();
        let b = a + Duration::from_millis(5);
        assert_eq!(b.saturating_duration_since(a), Duration::from_millis(5));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn micros_round_trip() {
        let ts = Timestamp::from_micros(1_234_567);
        assert_eq!(ts.as_micros(), 1_234_567);
    }
}
