//! Microsecond timestamps for registry entries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub const USEC_PER_SEC: i64 = 1_000_000;

/// Seconds + microseconds pair, as kept by the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub const fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from(since_epoch)
    }

    /// `self - earlier` with the borrow carried between the fields.
    ///
    /// Returns the difference and whether it is negative. `usec` of the result
    /// is always in `0..USEC_PER_SEC` when both inputs are normalized.
    pub fn subtract(&self, earlier: &Timeval) -> (Timeval, bool) {
        let mut y = *earlier;

        if self.usec < y.usec {
            let nsec = (y.usec - self.usec) / USEC_PER_SEC + 1;
            y.usec -= USEC_PER_SEC * nsec;
            y.sec += nsec;
        }
        if self.usec - y.usec > USEC_PER_SEC {
            let nsec = (self.usec - y.usec) / USEC_PER_SEC;
            y.usec += USEC_PER_SEC * nsec;
            y.sec -= nsec;
        }

        let result = Timeval {
            sec: self.sec - y.sec,
            usec: self.usec - y.usec,
        };
        (result, self.sec < y.sec)
    }

    pub fn as_micros(&self) -> i64 {
        self.sec * USEC_PER_SEC + self.usec
    }

    pub fn as_millis(&self) -> i64 {
        self.as_micros() / 1000
    }

    /// Wall-clock rendering (RFC 3339, UTC). Falls back to raw seconds when
    /// the value is out of chrono's range.
    pub fn to_rfc3339(&self) -> String {
        let nanos = u32::try_from(self.usec * 1000).unwrap_or(0);
        match chrono::DateTime::from_timestamp(self.sec, nanos) {
            Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            None => self.to_string(),
        }
    }
}

impl From<Duration> for Timeval {
    fn from(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            usec: i64::from(d.subsec_micros()),
        }
    }
}

impl std::fmt::Display for Timeval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:06}s", self.sec, self.usec)
    }
}

/// Time source for registry timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timeval;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timeval {
        Timeval::now()
    }
}

/// Hand-driven clock for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: std::sync::Mutex<Timeval>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn starting_at(now: Timeval) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            now: std::sync::Mutex::new(now),
        })
    }

    pub(crate) fn set(&self, now: Timeval) {
        *self.now.lock().unwrap() = now;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Timeval {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_carries_microseconds() {
        let initial = Timeval::new(10, 900_000);
        let fin = Timeval::new(11, 100_000);

        let (elapsed, negative) = fin.subtract(&initial);
        assert_eq!(elapsed, Timeval::new(0, 200_000));
        assert!(!negative);
    }

    #[test]
    fn subtract_without_carry() {
        let (elapsed, negative) = Timeval::new(15, 750_000).subtract(&Timeval::new(12, 250_000));
        assert_eq!(elapsed, Timeval::new(3, 500_000));
        assert!(!negative);
    }

    #[test]
    fn subtract_reports_negative() {
        let (_, negative) = Timeval::new(5, 0).subtract(&Timeval::new(6, 0));
        assert!(negative);
    }

    #[test]
    fn subtract_normalizes_oversized_usec() {
        // Unnormalized input: 2.5s written as 0s + 2_500_000us.
        let (elapsed, negative) = Timeval::new(0, 2_500_000).subtract(&Timeval::new(0, 0));
        assert_eq!(elapsed, Timeval::new(2, 500_000));
        assert!(!negative);
    }

    #[test]
    fn conversions() {
        let t = Timeval::from(Duration::from_micros(3_004_005));
        assert_eq!(t, Timeval::new(3, 4_005));
        assert_eq!(t.as_micros(), 3_004_005);
        assert_eq!(t.as_millis(), 3_004);
        assert_eq!(t.to_string(), "3.004005s");
    }

    #[test]
    fn rfc3339_rendering() {
        assert_eq!(
            Timeval::new(0, 500_000).to_rfc3339(),
            "1970-01-01T00:00:00.500000Z"
        );
    }

    #[test]
    fn manual_clock_is_settable() {
        let clock = ManualClock::starting_at(Timeval::new(1, 0));
        assert_eq!(clock.now(), Timeval::new(1, 0));
        clock.set(Timeval::new(2, 5));
        assert_eq!(clock.now(), Timeval::new(2, 5));
    }
}
