use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use std::time::Duration;

const HNS_PER_SECOND: i64 = 10_000_000;

/// A point or span on the global media time axis, in hundred-nanosecond ticks.
///
/// `POSITIVE_INFINITY` marks an unbounded value (for instance an open-ended
/// presentation window). Arithmetic saturates and keeps infinity sticky, so an
/// unbounded end stays unbounded after offsets are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MediaTime(i64);

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime(0);
    pub const POSITIVE_INFINITY: MediaTime = MediaTime(i64::MAX);
    pub const NEGATIVE_INFINITY: MediaTime = MediaTime(i64::MIN);

    #[inline]
    pub const fn from_hns(hns: i64) -> Self {
        Self(hns)
    }

    #[inline]
    pub const fn hns(&self) -> i64 {
        self.0
    }

    /// Converts `ticks` in units of `1 / timescale` seconds.
    ///
    /// A zero timescale yields `ZERO`.
    pub fn from_ticks(ticks: i64, timescale: u32) -> Self {
        if timescale == 0 {
            return Self::ZERO;
        }
        let hns = i128::from(ticks) * i128::from(HNS_PER_SECOND) / i128::from(timescale);
        Self(clamp_i128(hns))
    }

    /// Converts back to ticks of `1 / timescale` seconds, truncating toward zero.
    pub fn to_ticks(&self, timescale: u32) -> i64 {
        let ticks = i128::from(self.0) * i128::from(timescale) / i128::from(HNS_PER_SECOND);
        clamp_i128(ticks)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::from_ticks(millis, 1000)
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::from_ticks(micros, 1_000_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() {
            return Self::ZERO;
        }
        let hns = secs * HNS_PER_SECOND as f64;
        if hns >= i64::MAX as f64 {
            Self::POSITIVE_INFINITY
        } else if hns <= i64::MIN as f64 {
            Self::NEGATIVE_INFINITY
        } else {
            Self(hns.round() as i64)
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self(clamp_i128(d.as_nanos() as i128 / 100))
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / HNS_PER_SECOND as f64
    }

    pub fn as_millis(&self) -> i64 {
        self.0 / 10_000
    }

    /// Converts to a `Duration`, clamping negative values to zero.
    pub fn to_duration(&self) -> Duration {
        if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.0 as u64).saturating_mul(100))
        }
    }

    #[inline]
    pub fn is_infinite(&self) -> bool {
        self.0 == i64::MAX || self.0 == i64::MIN
    }

    #[inline]
    pub fn is_positive_infinity(&self) -> bool {
        self.0 == i64::MAX
    }
}

#[inline]
fn clamp_i128(v: i128) -> i64 {
    v.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: MediaTime) -> MediaTime {
        if self.is_infinite() {
            return self;
        }
        if rhs.is_infinite() {
            return rhs;
        }
        MediaTime(self.0.saturating_add(rhs.0))
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: MediaTime) -> MediaTime {
        if self.is_infinite() {
            return self;
        }
        if rhs.is_infinite() {
            return -rhs;
        }
        MediaTime(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for MediaTime {
    type Output = MediaTime;

    fn neg(self) -> MediaTime {
        match self.0 {
            i64::MAX => Self::NEGATIVE_INFINITY,
            i64::MIN => Self::POSITIVE_INFINITY,
            v => MediaTime(-v),
        }
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        *self = *self + rhs;
    }
}

impl SubAssign for MediaTime {
    fn sub_assign(&mut self, rhs: MediaTime) {
        *self = *self - rhs;
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            i64::MAX => f.write_str("+inf"),
            i64::MIN => f.write_str("-inf"),
            v => write!(f, "{:.3}s", v as f64 / HNS_PER_SECOND as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_from_ticks_90khz() {
        assert_eq!(MediaTime::from_ticks(90_000, 90_000), MediaTime::from_hns(10_000_000));
        assert_eq!(MediaTime::from_ticks(45, 90_000).hns(), 5_000);
        assert_eq!(MediaTime::from_ticks(1, 0), MediaTime::ZERO);
    }

    #[test]
    fn test_large_ticks_do_not_overflow() {
        // Close to the upper end of a 64-bit decode time with a high timescale.
        let t = MediaTime::from_ticks(i64::MAX / 2, 1_000_000_000);
        assert!(t.hns() > 0);
        assert!(!t.is_infinite());
    }

    #[test]
    fn test_infinity_is_sticky() {
        let inf = MediaTime::POSITIVE_INFINITY;
        assert_eq!(inf - MediaTime::from_millis(500), inf);
        assert_eq!(inf + MediaTime::from_millis(500), inf);
        assert_eq!(MediaTime::from_millis(1) - inf, MediaTime::NEGATIVE_INFINITY);
        assert_eq!(inf.to_string(), "+inf");
    }

    #[test]
    fn test_duration_conversion_clamps_negative() {
        assert_eq!(MediaTime::from_millis(-5).to_duration(), Duration::ZERO);
        assert_eq!(
            MediaTime::from_millis(1500).to_duration(),
            Duration::from_millis(1500)
        );
    }

    proptest! {
        #[test]
        fn prop_ticks_round_trip_at_hns_timescale(v in -1_000_000_000_000i64..1_000_000_000_000i64) {
            let t = MediaTime::from_ticks(v, 10_000_000);
            prop_assert_eq!(t.to_ticks(10_000_000), v);
        }

        #[test]
        fn prop_add_sub_inverse(a in -1_000_000_000_000i64..1_000_000_000_000i64,
                                b in -1_000_000_000_000i64..1_000_000_000_000i64) {
            let x = MediaTime::from_hns(a);
            let y = MediaTime::from_hns(b);
            prop_assert_eq!((x + y) - y, x);
        }
    }
}
