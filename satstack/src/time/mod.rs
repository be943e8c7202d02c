//! High-precision [Time] type for use with PTP / IEEE 1588

mod wall;

pub use wall::WallClock;

use core::{
    cmp::Ordering,
    fmt::Display,
    ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign},
};

use crate::io::{Readable, Writeable};

/// Commonly used scaling factors.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;
pub const NSEC_PER_MSEC: i64 = 1_000_000;
pub const NSEC_PER_USEC: i64 = 1_000;
pub const USEC_PER_SEC: i64 = 1_000_000;
pub const MSEC_PER_SEC: i64 = 1_000;
pub const SUBNS_PER_NSEC: i64 = 65_536;
pub const SUBNS_PER_USEC: i64 = SUBNS_PER_NSEC * NSEC_PER_USEC;
pub const SUBNS_PER_MSEC: i64 = SUBNS_PER_NSEC * NSEC_PER_MSEC;
pub const SUBNS_PER_SEC: i64 = SUBNS_PER_NSEC * NSEC_PER_SEC;

/// Seconds from the PTP epoch (TAI 1970-01-01) to the GPS epoch
/// (1980-01-06), including the 19-second TAI-GPS offset.
const GPS_EPOCH_TAI_SECS: i64 = 315_964_800 + 19;

/// Time represents an instant or a signed time-difference at the finest
/// resolution supported by IEEE 1588-2019.
///
/// The internal representation is a pair of seconds and "subnanoseconds",
/// where one subnanosecond is 1/65536 ns (the resolution of the PTP
/// correctionField). Absolute times are counted from the TAI epoch.
///
/// The canonical form keeps the subnanosecond field in `[0, SUBNS_PER_SEC)`;
/// a negative total time has a non-positive seconds field and the positive
/// complement in the subnanosecond field. All arithmetic re-normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Time {
    secs: i64,
    subns: i64,
}

impl Time {
    pub const ZERO: Time = Time { secs: 0, subns: 0 };

    /// Create an instance from a raw subnanosecond count.
    /// This matches the format of the PTP correctionField.
    pub const fn from_subns(subns: i64) -> Self {
        Time {
            secs: subns.div_euclid(SUBNS_PER_SEC),
            subns: subns.rem_euclid(SUBNS_PER_SEC),
        }
    }

    /// Create an instance from the PTP timestamp fields: an unsigned
    /// seconds count, nanoseconds, and an optional sub-nanosecond residual.
    pub fn from_fields(seconds: u64, nanos: u32, subnanos: u16) -> Self {
        Time {
            secs: seconds as i64,
            subns: (nanos as i64) * SUBNS_PER_NSEC + subnanos as i64,
        }
        .normalize()
    }

    /// Create an instance with the given amount of whole seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Time { secs, subns: 0 }
    }

    /// Create an instance with the given amount of milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self::from_subns_wide(millis as i128 * SUBNS_PER_MSEC as i128)
    }

    /// Create an instance with the given amount of microseconds.
    pub const fn from_micros(micros: i64) -> Self {
        Self::from_subns_wide(micros as i128 * SUBNS_PER_USEC as i128)
    }

    /// Create an instance with the given amount of nanoseconds.
    pub const fn from_nanos(nanos: i64) -> Self {
        Self::from_subns_wide(nanos as i128 * SUBNS_PER_NSEC as i128)
    }

    /// Convert GPS time (milliseconds since the GPS epoch) to TAI.
    pub fn from_gps_msec(gps_msec: i64) -> Self {
        Self::from_millis(gps_msec) + Self::from_secs(GPS_EPOCH_TAI_SECS)
    }

    /// Convert to GPS time, rounding down to whole milliseconds.
    pub fn to_gps_msec(&self) -> i64 {
        (*self - Self::from_secs(GPS_EPOCH_TAI_SECS)).delta_msec()
    }

    const fn from_subns_wide(subns: i128) -> Self {
        Time {
            secs: subns.div_euclid(SUBNS_PER_SEC as i128) as i64,
            subns: subns.rem_euclid(SUBNS_PER_SEC as i128) as i64,
        }
    }

    /// Reduce to canonical form: subns in `[0, SUBNS_PER_SEC)`.
    pub fn normalize(self) -> Self {
        let mut secs = self.secs + self.subns.div_euclid(SUBNS_PER_SEC);
        let mut subns = self.subns.rem_euclid(SUBNS_PER_SEC);
        if subns < 0 {
            // rem_euclid output is always non-negative; this branch guards
            // against a hand-constructed denormal only.
            secs -= 1;
            subns += SUBNS_PER_SEC;
        }
        Time { secs, subns }
    }

    /// Read the "seconds" field without intermediate rounding.
    pub const fn field_secs(&self) -> i64 {
        self.secs
    }

    /// Read the "nanoseconds" field, rounding down.
    /// Use together with [Time::correction] to keep full precision.
    pub const fn field_nsec(&self) -> u32 {
        (self.subns / SUBNS_PER_NSEC) as u32
    }

    /// Read the raw "subnanoseconds" field.
    /// Equal to `65536 * field_nsec() + correction()`.
    pub const fn field_subns(&self) -> u64 {
        self.subns as u64
    }

    /// The residual below one nanosecond, in subnanoseconds.
    /// This is what travels in the PTP correctionField when the 10-byte
    /// timestamp fields carry the rest.
    pub const fn correction(&self) -> u64 {
        (self.subns % SUBNS_PER_NSEC) as u64
    }

    /// The "seconds" field after rounding to the nearest nanosecond.
    /// If you use `round_nsec`, you should also use `round_secs`.
    pub fn round_secs(&self) -> i64 {
        (*self + Time::from_subns(SUBNS_PER_NSEC / 2)).field_secs()
    }

    /// The "nanoseconds" field after rounding to the nearest nanosecond.
    pub fn round_nsec(&self) -> u32 {
        (*self + Time::from_subns(SUBNS_PER_NSEC / 2)).field_nsec()
    }

    /// Total subnanoseconds of a time-difference, saturating on overflow.
    /// The representable range is roughly ±4.4 days.
    pub fn delta_subns(&self) -> i64 {
        match self
            .secs
            .checked_mul(SUBNS_PER_SEC)
            .and_then(|s| s.checked_add(self.subns))
        {
            Some(total) => total,
            None if self.secs < 0 => i64::MIN,
            None => i64::MAX,
        }
    }

    /// Total nanoseconds of a time-difference, saturating on overflow.
    pub fn delta_nsec(&self) -> i64 {
        self.delta_scaled(NSEC_PER_SEC, SUBNS_PER_NSEC)
    }

    /// Total microseconds of a time-difference, saturating on overflow.
    pub fn delta_usec(&self) -> i64 {
        self.delta_scaled(USEC_PER_SEC, SUBNS_PER_USEC)
    }

    /// Total milliseconds of a time-difference, saturating on overflow.
    pub fn delta_msec(&self) -> i64 {
        self.delta_scaled(MSEC_PER_SEC, SUBNS_PER_MSEC)
    }

    /// Total whole seconds of a time-difference.
    pub const fn delta_secs(&self) -> i64 {
        self.secs
    }

    fn delta_scaled(&self, units_per_sec: i64, subns_per_unit: i64) -> i64 {
        let total = self.secs as i128 * units_per_sec as i128
            + (self.subns / subns_per_unit) as i128;
        if total > i64::MAX as i128 {
            i64::MAX
        } else if total < i64::MIN as i128 {
            i64::MIN
        } else {
            total as i64
        }
    }

    /// Absolute value of a time-difference.
    pub fn abs(self) -> Self {
        if self.secs < 0 {
            -self
        } else {
            self
        }
    }

    /// True for exactly zero.
    pub const fn is_zero(&self) -> bool {
        self.secs == 0 && self.subns == 0
    }

    /// Total time as a floating-point second count (lossy, for servo math).
    pub fn secs_lossy(&self) -> f64 {
        self.secs as f64 + self.subns as f64 / SUBNS_PER_SEC as f64
    }

    /// Read the standard 10-byte timestamp from a PTP message
    /// (u48 seconds + u32 nanoseconds, big-endian).
    ///
    /// Add the correctionField separately to keep full precision.
    pub fn read_from(src: &mut dyn Readable) -> Option<Self> {
        let sec_hi = src.read_u16()?;
        let sec_lo = src.read_u32()?;
        let nsec = src.read_u32()?;
        let seconds = ((sec_hi as u64) << 32) | sec_lo as u64;
        Some(Self::from_fields(seconds, nsec, 0))
    }

    /// Write the standard 10-byte timestamp to a PTP message.
    ///
    /// The caller must write [Time::correction] to the correctionField to
    /// keep full end-to-end precision.
    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u16((self.secs >> 32) as u16);
        dst.write_u32(self.secs as u32);
        dst.write_u32(self.field_nsec());
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        Time {
            secs: self.secs + rhs.secs,
            subns: self.subns + rhs.subns,
        }
        .normalize()
    }
}

impl AddAssign for Time {
    fn add_assign(&mut self, rhs: Time) {
        *self = *self + rhs;
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        Time {
            secs: self.secs - rhs.secs,
            subns: self.subns - rhs.subns,
        }
        .normalize()
    }
}

impl SubAssign for Time {
    fn sub_assign(&mut self, rhs: Time) {
        *self = *self - rhs;
    }
}

impl Neg for Time {
    type Output = Time;

    fn neg(self) -> Time {
        Time {
            secs: -self.secs,
            subns: -self.subns,
        }
        .normalize()
    }
}

/// Scalar multiply and divide are used for weighted averaging.
/// Scale factors are limited to ~10^4 to rule out overflow of the
/// 128-bit intermediate in the subnanosecond path.
impl Mul<u32> for Time {
    type Output = Time;

    fn mul(self, scale: u32) -> Time {
        let subns = self.subns as i128 * scale as i128;
        Time {
            secs: self.secs * scale as i64,
            subns: 0,
        } + Time::from_subns_wide(subns)
    }
}

impl MulAssign<u32> for Time {
    fn mul_assign(&mut self, scale: u32) {
        *self = *self * scale;
    }
}

impl Div<u32> for Time {
    type Output = Time;

    fn div(self, scale: u32) -> Time {
        let total = self.secs as i128 * SUBNS_PER_SEC as i128 + self.subns as i128;
        Time::from_subns_wide(total.div_euclid(scale as i128))
    }
}

impl DivAssign<u32> for Time {
    fn div_assign(&mut self, scale: u32) {
        *self = *self / scale;
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        // Canonical form makes the lexicographic order the numeric order.
        (self.secs, self.subns).cmp(&(other.secs, other.subns))
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if *self < Time::ZERO {
            let neg = -*self;
            write!(f, "-{}.{:09}", neg.secs, neg.field_nsec())
        } else {
            write!(f, "{}.{:09}", self.secs, self.field_nsec())
        }
    }
}

/// Common time-related constants.
pub const ONE_NANOSECOND: Time = Time::from_subns(SUBNS_PER_NSEC);
pub const ONE_MICROSECOND: Time = Time::from_subns(SUBNS_PER_USEC);
pub const ONE_MILLISECOND: Time = Time::from_subns(SUBNS_PER_MSEC);
pub const ONE_SECOND: Time = Time::from_secs(1);
pub const ONE_MINUTE: Time = Time::from_secs(60);
pub const ONE_HOUR: Time = Time::from_secs(3600);
pub const ONE_DAY: Time = Time::from_secs(86400);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ArrayRead, ArrayWrite};

    #[test]
    fn values() {
        assert_eq!(Time::from_secs(10).delta_nsec(), 10_000_000_000);
        assert_eq!(Time::from_millis(10).delta_nsec(), 10_000_000);
        assert_eq!(Time::from_micros(10).delta_nsec(), 10_000);
        assert_eq!(Time::from_nanos(10).delta_nsec(), 10);
        assert_eq!(Time::from_secs(10).field_secs(), 10);
        assert_eq!(Time::from_millis(10).field_secs(), 0);
        assert_eq!(Time::from_millis(1001).field_secs(), 1);
        assert_eq!(Time::from_millis(-500).field_secs(), -1);
        assert_eq!(Time::from_millis(-500).field_subns(), SUBNS_PER_MSEC as u64 * 500);
    }

    #[test]
    fn normalize_is_canonical() {
        let cases = [
            Time::from_subns(0),
            Time::from_subns(1),
            Time::from_subns(-1),
            Time::from_subns(SUBNS_PER_SEC),
            Time::from_subns(-SUBNS_PER_SEC - 17),
            Time::from_fields(123, 999_999_999, 65_535),
        ];
        for t in cases {
            assert_eq!(t, t.normalize());
            assert!(t.subns >= 0 && t.subns < SUBNS_PER_SEC, "{t:?}");
        }
    }

    #[test]
    fn add_sub_roundtrip() {
        let a = Time::from_fields(1000, 999_999_999, 65_535);
        let b = Time::from_subns(-12_345_678_901);
        assert_eq!((a + b) - b, a);
        assert_eq!((b + a) - a, b);
        assert_eq!(a + (-a), Time::ZERO);
    }

    #[test]
    fn negative_canonical_form() {
        // -1.5 seconds: secs = -2, subns = +0.5 s
        let t = Time::from_millis(-1500);
        assert_eq!(t.field_secs(), -2);
        assert_eq!(t.field_subns(), SUBNS_PER_MSEC as u64 * 500);
        assert_eq!(t.delta_msec(), -1500);
        assert_eq!(t.abs(), Time::from_millis(1500));
    }

    #[test]
    fn delta_saturates() {
        let big = Time::from_secs(i64::MAX / MSEC_PER_SEC);
        assert_eq!(big.delta_nsec(), i64::MAX);
        assert_eq!((-big).delta_nsec(), i64::MIN);
        // Within the safe range conversions stay exact.
        assert_eq!(ONE_DAY.delta_usec(), 86_400_000_000);
        assert_eq!((-ONE_DAY).delta_usec(), -86_400_000_000);
    }

    #[test]
    fn scalar_scaling() {
        let t = Time::from_micros(1500);
        assert_eq!(t * 4, Time::from_micros(6000));
        assert_eq!(t / 3, Time::from_micros(500));
        assert_eq!((t * 10000) / 10000, t);
        let neg = Time::from_micros(-9);
        assert_eq!(neg / 2, Time::from_subns(-9 * SUBNS_PER_USEC / 2));
    }

    #[test]
    fn rounding() {
        let t = Time::from_fields(5, 999_999_999, 40_000);
        assert_eq!(t.field_secs(), 5);
        assert_eq!(t.field_nsec(), 999_999_999);
        assert_eq!(t.round_secs(), 6);
        assert_eq!(t.round_nsec(), 0);
        let u = Time::from_fields(5, 10, 100);
        assert_eq!(u.round_nsec(), 10);
    }

    #[test]
    fn ordering() {
        let a = Time::from_millis(-1);
        let b = Time::ZERO;
        let c = Time::from_subns(1);
        assert!(a < b && b < c && a < c);
        assert!(c > a);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn wire_roundtrip() {
        // Scenario: 123456 s + 789 ms + residual of 32768 subns.
        let t = Time::from_fields(123_456, 789_000_000, 32_768);
        let mut buf = [0u8; 10];
        let mut wr = ArrayWrite::new(&mut buf);
        t.write_to(&mut wr);
        assert!(wr.write_finalize());
        let correction = t.correction();

        let mut rd = ArrayRead::new(&buf);
        let parsed = Time::read_from(&mut rd).unwrap()
            + Time::from_subns(correction as i64);
        assert_eq!(parsed.field_secs(), 123_456);
        assert_eq!(parsed.field_nsec(), 789_000_000);
        assert_eq!(parsed.correction(), 32_768);
        assert_eq!(parsed, t);
    }

    #[test]
    fn wire_format_bytes() {
        let t = Time::from_fields(0x1000_0000_0002, 0x1000_0001, 0);
        let mut buf = [0u8; 10];
        let mut wr = ArrayWrite::new(&mut buf);
        t.write_to(&mut wr);
        assert!(wr.write_finalize());
        assert_eq!(
            buf,
            [0x10, 0x00, 0x00, 0x00, 0x00, 0x02, 0x10, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn gps_epoch() {
        let t = Time::from_gps_msec(0);
        assert_eq!(t.field_secs(), 315_964_819);
        assert_eq!(t.to_gps_msec(), 0);
        let u = Time::from_gps_msec(1_234_567);
        assert_eq!(u.to_gps_msec(), 1_234_567);
    }
}
