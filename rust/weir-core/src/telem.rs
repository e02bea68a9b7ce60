//! Time value model: nanosecond timestamps, spans, and rates.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A span of time in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeSpan(pub i64);

pub const NANOSECOND: TimeSpan = TimeSpan(1);
pub const MICROSECOND: TimeSpan = TimeSpan(1_000);
pub const MILLISECOND: TimeSpan = TimeSpan(1_000_000);
pub const SECOND: TimeSpan = TimeSpan(1_000_000_000);
pub const MINUTE: TimeSpan = TimeSpan(60 * 1_000_000_000);

impl TimeSpan {
    pub const ZERO: TimeSpan = TimeSpan(0);

    pub fn from_secs(secs: f64) -> Self {
        TimeSpan((secs * SECOND.0 as f64) as i64)
    }

    pub fn from_millis(ms: i64) -> Self {
        TimeSpan(ms * MILLISECOND.0)
    }

    pub fn from_micros(us: i64) -> Self {
        TimeSpan(us * MICROSECOND.0)
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }

    pub fn secs(&self) -> f64 {
        self.0 as f64 / SECOND.0 as f64
    }

    /// Saturating conversion into a std duration; negative spans collapse to
    /// zero.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.0.max(0) as u64)
    }

    pub fn scale(&self, factor: f64) -> Self {
        TimeSpan((self.0 as f64 * factor) as i64)
    }
}

impl Add for TimeSpan {
    type Output = TimeSpan;
    fn add(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0 + rhs.0)
    }
}

impl Sub for TimeSpan {
    type Output = TimeSpan;
    fn sub(self, rhs: TimeSpan) -> TimeSpan {
        TimeSpan(self.0 - rhs.0)
    }
}

impl Mul<i64> for TimeSpan {
    type Output = TimeSpan;
    fn mul(self, rhs: i64) -> TimeSpan {
        TimeSpan(self.0 * rhs)
    }
}

impl Div<i64> for TimeSpan {
    type Output = TimeSpan;
    fn div(self, rhs: i64) -> TimeSpan {
        TimeSpan(self.0 / rhs)
    }
}

impl Neg for TimeSpan {
    type Output = TimeSpan;
    fn neg(self) -> TimeSpan {
        TimeSpan(-self.0)
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ns = self.0;
        if ns.abs() >= SECOND.0 {
            write!(f, "{:.3}s", ns as f64 / SECOND.0 as f64)
        } else if ns.abs() >= MILLISECOND.0 {
            write!(f, "{:.3}ms", ns as f64 / MILLISECOND.0 as f64)
        } else if ns.abs() >= MICROSECOND.0 {
            write!(f, "{:.3}us", ns as f64 / MICROSECOND.0 as f64)
        } else {
            write!(f, "{ns}ns")
        }
    }
}

/// A point in time, in nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeStamp(pub i64);

impl TimeStamp {
    pub const ZERO: TimeStamp = TimeStamp(0);

    /// The current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        TimeStamp(since_epoch.as_nanos() as i64)
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }

    /// The midpoint between two timestamps.
    pub fn midpoint(a: TimeStamp, b: TimeStamp) -> TimeStamp {
        TimeStamp(a.0 + (b.0 - a.0) / 2)
    }
}

impl Add<TimeSpan> for TimeStamp {
    type Output = TimeStamp;
    fn add(self, rhs: TimeSpan) -> TimeStamp {
        TimeStamp(self.0 + rhs.0)
    }
}

impl AddAssign<TimeSpan> for TimeStamp {
    fn add_assign(&mut self, rhs: TimeSpan) {
        self.0 += rhs.0;
    }
}

impl Sub<TimeSpan> for TimeStamp {
    type Output = TimeStamp;
    fn sub(self, rhs: TimeSpan) -> TimeStamp {
        TimeStamp(self.0 - rhs.0)
    }
}

impl SubAssign<TimeSpan> for TimeStamp {
    fn sub_assign(&mut self, rhs: TimeSpan) {
        self.0 -= rhs.0;
    }
}

impl Sub for TimeStamp {
    type Output = TimeSpan;
    fn sub(self, rhs: TimeStamp) -> TimeSpan {
        TimeSpan(self.0 - rhs.0)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// A frequency in hertz.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(pub f64);

impl Rate {
    pub fn hz(v: f64) -> Self {
        Rate(v)
    }

    /// The period of one cycle at this rate.
    pub fn period(&self) -> TimeSpan {
        if self.0 <= 0.0 {
            return TimeSpan::ZERO;
        }
        TimeSpan((SECOND.0 as f64 / self.0) as i64)
    }
}

impl Div<Rate> for Rate {
    type Output = f64;
    fn div(self, rhs: Rate) -> f64 {
        self.0 / rhs.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz", self.0)
    }
}

/// Injectable time source for components that must be testable against a
/// simulated clock.
pub type NowFunc = Box<dyn Fn() -> TimeStamp + Send>;
