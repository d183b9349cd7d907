//! Time primitives for the communication stack.
//!
//! The whole stack runs off a monotonic microsecond clock.  All engine
//! entry points take an explicit `now` timestamp so the caller stays in
//! control of the time source (and tests can run on simulated time).

/// A span of time with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Duration {
    micros: u64,
}

impl Duration {
    pub const ZERO: Self = Duration { micros: 0 };

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Duration { micros }
    }

    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Duration {
            micros: millis * 1000,
        }
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Duration {
            micros: secs * 1000000,
        }
    }

    #[inline]
    pub const fn total_micros(self) -> u64 {
        self.micros
    }

    #[inline]
    pub const fn total_millis(self) -> u64 {
        self.micros / 1000
    }
}

impl core::ops::Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration {
            micros: self.micros + rhs.micros,
        }
    }
}

impl core::ops::AddAssign for Duration {
    fn add_assign(&mut self, rhs: Duration) {
        self.micros += rhs.micros;
    }
}

impl core::ops::Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration {
            micros: self.micros.saturating_sub(rhs.micros),
        }
    }
}

impl core::ops::Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Duration {
        Duration {
            micros: self.micros * u64::from(rhs),
        }
    }
}

impl From<core::time::Duration> for Duration {
    fn from(value: core::time::Duration) -> Self {
        Duration {
            micros: u64::try_from(value.as_micros()).unwrap_or(u64::MAX),
        }
    }
}

impl From<Duration> for core::time::Duration {
    fn from(value: Duration) -> Self {
        core::time::Duration::from_micros(value.micros)
    }
}

/// A point in monotonic time, relative to an arbitrary epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Instant {
    micros: u64,
}

impl Instant {
    pub const ZERO: Self = Instant { micros: 0 };

    #[inline]
    pub const fn from_micros(micros: u64) -> Self {
        Instant { micros }
    }

    #[inline]
    pub const fn total_micros(self) -> u64 {
        self.micros
    }

    #[inline]
    pub const fn total_millis(self) -> u64 {
        self.micros / 1000
    }

    /// Current instant of the process-wide monotonic clock.
    pub fn now() -> Self {
        use std::sync::OnceLock;
        static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
        let epoch = EPOCH.get_or_init(std::time::Instant::now);
        Instant {
            micros: u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX),
        }
    }
}

impl core::ops::Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant {
            micros: self.micros + rhs.total_micros(),
        }
    }
}

impl core::ops::AddAssign<Duration> for Instant {
    fn add_assign(&mut self, rhs: Duration) {
        self.micros += rhs.total_micros();
    }
}

impl core::ops::Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant {
            micros: self.micros.saturating_sub(rhs.total_micros()),
        }
    }
}

impl core::ops::Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        Duration::from_micros(self.micros.saturating_sub(rhs.micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let t = Instant::ZERO + Duration::from_millis(5);
        assert_eq!(t.total_micros(), 5000);
        assert_eq!(t - Instant::ZERO, Duration::from_millis(5));
        assert_eq!(Instant::ZERO - t, Duration::ZERO);
        assert_eq!(Duration::from_millis(1) * 3, Duration::from_micros(3000));
    }
}
