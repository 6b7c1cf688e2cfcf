//! High precision time primitives.
//!
//! [`Timespec`] is the common currency of the whole daemon: PHC samples,
//! servo errors, and sync-instance offsets are all expressed as `Timespec`
//! differences. Its normal form keeps `nsec` and `nsec_frac` non-negative and
//! folds sign into `sec`, which is what lets [`Timespec::negate`] and
//! [`Timespec::cmp`] stay simple total-order operations instead of having to
//! special-case a sign bit.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg, Sub};

/// A signed point (or duration) in time: whole seconds plus a normalised
/// nanosecond remainder plus a 32-bit sub-nanosecond fraction.
///
/// `nsec_frac` represents `0..1` ns in units of `2^-32` ns, giving enough
/// precision to carry PHC cross-timestamp sub-nanosecond readings without
/// losing them to rounding on every arithmetic step.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
    pub nsec_frac: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0, nsec_frac: 0 };

    pub const fn new(sec: i64, nsec: u32, nsec_frac: u32) -> Timespec {
        // Callers that already have a normalised triple can skip the
        // division-heavy `normalize` path.
        Timespec { sec, nsec, nsec_frac }
    }

    pub fn from_nanos(sec: i64, nsec: i64) -> Timespec {
        normalize(sec, nsec, 0)
    }

    /// Build from a libc `timespec`, assuming `tv_nsec` is already in `[0, 1e9)`.
    pub fn from_libc(ts: libc::timespec) -> Timespec {
        normalize(ts.tv_sec as i64, ts.tv_nsec as i64, 0)
    }

    pub fn to_libc(self) -> libc::timespec {
        libc::timespec { tv_sec: self.sec as _, tv_nsec: self.nsec as _ }
    }

    pub fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0 && self.nsec_frac == 0
    }

    pub fn negate(self) -> Timespec {
        normalize(-self.sec, -(self.nsec as i64), -(self.nsec_frac as i64))
    }

    pub fn add(self, other: Timespec) -> Timespec {
        normalize(
            self.sec + other.sec,
            self.nsec as i64 + other.nsec as i64,
            self.nsec_frac as i64 + other.nsec_frac as i64,
        )
    }

    pub fn subtract(self, other: Timespec) -> Timespec {
        self.add(other.negate())
    }

    /// Total duration in nanoseconds as a float, discarding the sub-nanosecond
    /// fraction below the precision of `f64`. Used wherever the spec speaks of
    /// an "offset in nanoseconds (float)".
    pub fn as_nanos_f64(self) -> f64 {
        self.sec as f64 * 1.0e9 + self.nsec as f64 + self.nsec_frac as f64 / 4_294_967_296.0
    }

    pub fn from_nanos_f64(ns: f64) -> Timespec {
        let sec = (ns / 1.0e9).floor();
        let rem_ns = ns - sec * 1.0e9;
        let whole_ns = rem_ns.floor();
        let frac = ((rem_ns - whole_ns) * 4_294_967_296.0).round();
        normalize(sec as i64, whole_ns as i64, frac as i64)
    }

    /// Absolute value, used by alarm/threshold comparisons that only care
    /// about magnitude (e.g. the servo step threshold in §4.3).
    ///
    /// A negative sub-second value always folds into `sec == -1` in our
    /// normal form, so `sec < 0` alone correctly identifies negative values.
    pub fn abs(self) -> Timespec {
        if self.sec < 0 {
            self.negate()
        } else {
            self
        }
    }
}

/// Normalises `sec` seconds, `nsec` nanoseconds (any range) and `frac` units
/// of `2^-32` ns (any range) into canonical form. Implemented with
/// `div_euclid`/`rem_euclid` rather than iterative carries so the cost is
/// constant regardless of how far out of range the inputs are.
fn normalize(sec: i64, nsec: i64, frac: i64) -> Timespec {
    const FRAC_BASE: i64 = 1 << 32;
    const NSEC_BASE: i64 = 1_000_000_000;

    let frac_carry = frac.div_euclid(FRAC_BASE);
    let frac_final = frac.rem_euclid(FRAC_BASE);

    let nsec2 = nsec + frac_carry;
    let sec_carry = nsec2.div_euclid(NSEC_BASE);
    let nsec_final = nsec2.rem_euclid(NSEC_BASE);

    Timespec {
        sec: sec + sec_carry,
        nsec: nsec_final as u32,
        nsec_frac: frac_final as u32,
    }
}

impl Add for Timespec {
    type Output = Timespec;
    fn add(self, rhs: Timespec) -> Timespec {
        Timespec::add(self, rhs)
    }
}

impl Sub for Timespec {
    type Output = Timespec;
    fn sub(self, rhs: Timespec) -> Timespec {
        Timespec::subtract(self, rhs)
    }
}

impl Neg for Timespec {
    type Output = Timespec;
    fn neg(self) -> Timespec {
        Timespec::negate(self)
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.nsec, self.nsec_frac).cmp(&(other.sec, other.nsec, other.nsec_frac))
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}{:+}frac", self.sec, self.nsec, self.nsec_frac)
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// A value in nanoseconds with `2^-16` ns of fractional precision, stored as
/// a plain `i64`. This is the wire/kernel-facing unit used by `adjtimex`'s
/// scaled-ppm fields and by the servo's frequency math; keeping it a
/// distinct type (rather than a bare `f64`) makes the saturation behaviour
/// at the conversion boundary explicit and tested.
pub type ScaledNs = i64;

const SCALE: f64 = 65536.0;

/// Convert a floating-point nanosecond value into scaled-ns, saturating to
/// `i64::{MIN,MAX}` if it doesn't fit.
pub fn float_to_scaled(x: f64) -> ScaledNs {
    if x.is_nan() {
        return 0;
    }
    let scaled = x * SCALE;
    if scaled >= i64::MAX as f64 {
        i64::MAX
    } else if scaled <= i64::MIN as f64 {
        i64::MIN
    } else {
        scaled.round() as i64
    }
}

/// Convert scaled-ns back into a floating-point nanosecond value.
pub fn scaled_to_float(s: ScaledNs) -> f64 {
    s as f64 / SCALE
}

/// Clamp a 32-bit max-adjustment value (in ppb) to what fits in the 31-bit
/// signed scaled-ppm `timex.freq` field on 32-bit hosts: `((2^31-1)*1000)/2^16`
/// ppb, per §8's boundary behaviour.
pub fn clamp_max_adj_ppb_32bit(max_adj_ppb: i64) -> i64 {
    const LIMIT: i64 = ((i32::MAX as i64) * 1000) / 65536;
    max_adj_ppb.clamp(-LIMIT, LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_into_range() {
        let t = Timespec::from_nanos(0, 2_500_000_000);
        assert_eq!(t.sec, 2);
        assert_eq!(t.nsec, 500_000_000);
        assert!(t.nsec < 1_000_000_000);
    }

    #[test]
    fn negative_nanos_borrow_from_seconds() {
        let t = Timespec::from_nanos(1, -500_000_000);
        assert_eq!(t.sec, 0);
        assert_eq!(t.nsec, 500_000_000);
    }

    #[test]
    fn add_negate_equals_subtract() {
        let a = Timespec::from_nanos(5, 200);
        let b = Timespec::from_nanos(2, 900_000_000);
        assert_eq!(a.add(b.negate()), a.subtract(b));
    }

    #[test]
    fn subtract_self_is_zero() {
        let a = Timespec::from_nanos(123, 456);
        assert_eq!(a.subtract(a), Timespec::ZERO);
    }

    #[test]
    fn cmp_is_antisymmetric() {
        let a = Timespec::from_nanos(1, 0);
        let b = Timespec::from_nanos(2, 0);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn negate_of_negative_is_positive_and_in_normal_form() {
        let a = Timespec::from_nanos(3, 250_000_000);
        let neg = a.negate();
        assert_eq!(neg.sec, -4);
        assert_eq!(neg.nsec, 750_000_000);
        assert!(neg.nsec < 1_000_000_000);
        assert_eq!(neg.negate(), a);
    }

    #[test]
    fn scaled_round_trip_within_tolerance() {
        for x in [0.0, 1.0, -1.0, 1_000_000.0, -1_000_000.0, 0.000015] {
            let scaled = float_to_scaled(x);
            let back = scaled_to_float(scaled);
            assert!((back - x).abs() <= 2f64.powi(-16) + 1e-9, "x={x} back={back}");
        }
    }

    #[test]
    fn scaled_saturates_out_of_range() {
        assert_eq!(float_to_scaled(1e30), i64::MAX);
        assert_eq!(float_to_scaled(-1e30), i64::MIN);
    }

    #[test]
    fn max_adj_clamped_to_32_bit_representable_range() {
        let clamped = clamp_max_adj_ppb_32bit(10_000_000_000);
        assert_eq!(clamped, ((i32::MAX as i64) * 1000) / 65536);
    }
}
