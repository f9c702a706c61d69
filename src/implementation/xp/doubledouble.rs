// Copyright 2020 Xavier Gillard
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The extended precision scalar: an unevaluated sum of two `f64` giving a
//! 107 bit mantissa with correctly rounded basic operations.
//!
//! A value is kept *normalized*: `|lo| <= 0.5 ulp(hi)` and `hi + lo`
//! evaluates to `hi`.  Every public operation takes normalized operands and
//! produces a normalized result.  NaN and infinities propagate through, and
//! negative zero survives multiplication, division and negation.  The error
//! bound on `+`, `-`, `*`, `/`, `sqrt`, `recip` and friends is 0.5 ulp of the
//! 107 bit format; the transcendentals in the sibling module are bounded by
//! 1 ulp.

use std::cmp::Ordering;

use super::core::*;

// ----------------------------------------------------------------------------
// --- HIGH RESOLUTION CONSTANTS ----------------------------------------------
// ----------------------------------------------------------------------------
// Multi-word decompositions, highest word first, each word carrying a full
// 53-bit mantissa.  Used by the argument reductions.
pub(crate) const HIRES_PI: [f64; 5] = [
    ldx(7074237752028440.0, -51),
    ldx(4967757600021511.0, -105),
    ldx(-8753721960665020.0, -161),
    ldx(5857755168774013.0, -215),
    ldx(5380502254069925.0, -269),
];
pub(crate) const HIRES_LOG2: [f64; 3] = [
    ldx(6243314768165359.0, -53),
    ldx(7525737178955839.0, -108),
    ldx(6673460182522164.0, -163),
];
// MANTISSA_PRECISION * log(2)
pub(crate) const HIRES_LOG2_MANT: [f64; 3] = [
    ldx(5170245042386938.0, -47),
    ldx(6835002668432489.0, -103),
    ldx(-6295489808196385.0, -157),
];
pub(crate) const HIRES_SQRT2: [f64; 3] = [
    ldx(6369051672525773.0, -52),
    ldx(-7843040109683798.0, -106),
    ldx(6048680740045173.0, -160),
];

// ----------------------------------------------------------------------------
// --- BIG FLOAT VECTOR -------------------------------------------------------
// ----------------------------------------------------------------------------
/// A positional radix-2 representation of a wide constant:
/// `sign * sum_i chunk[i] * 2^(offset - i*width)`.
///
/// This is the portable way to ship reference constants wider than the
/// double-double mantissa; conversion composes the chunks with exact
/// power-of-two divisions.
#[derive(Debug, Clone)]
pub struct BigFloatVec {
    /// +1 or -1.
    pub sign: i32,
    /// Power-of-two offset of the first chunk.
    pub offset: i32,
    /// Width of each chunk, in bits.
    pub width: i32,
    /// The chunks, most significant first.
    pub chunk: Vec<u32>,
}

// ----------------------------------------------------------------------------
// --- DOUBLEDOUBLE -----------------------------------------------------------
// ----------------------------------------------------------------------------
/// The double-double scalar.  See the module documentation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DoubleDouble {
    pub(crate) hi: f64,
    pub(crate) lo: f64,
}

impl DoubleDouble {
    pub const ZERO: DoubleDouble = DoubleDouble { hi: 0.0, lo: 0.0 };
    pub const ONE: DoubleDouble = DoubleDouble { hi: 1.0, lo: 0.0 };
    /// pi to full precision.
    pub const PI: DoubleDouble = DoubleDouble { hi: HIRES_PI[0], lo: HIRES_PI[1] };
    /// pi/2 to full precision.
    pub const HALF_PI: DoubleDouble =
        DoubleDouble { hi: 0.5 * HIRES_PI[0], lo: 0.5 * HIRES_PI[1] };
    /// log(2) to full precision.
    pub const LOG2: DoubleDouble = DoubleDouble { hi: HIRES_LOG2[0], lo: HIRES_LOG2[1] };
    /// sqrt(2) to full precision.
    pub const SQRT2: DoubleDouble = DoubleDouble { hi: HIRES_SQRT2[0], lo: HIRES_SQRT2[1] };

    /// Assembles a value from parts already known to be normalized.  This is
    /// the fast path used internally; going through it with an unnormalized
    /// pair breaks every accuracy claim downstream, so it is crate private.
    #[inline]
    pub(crate) const fn raw(hi: f64, lo: f64) -> Self {
        DoubleDouble { hi, lo }
    }

    /// Builds a value from an arbitrary `(hi, lo)` pair, renormalizing.
    pub fn from_parts(hi: f64, lo: f64) -> Self {
        if !hi.is_finite() {
            return DoubleDouble { hi, lo: hi };
        }
        let (s, e) = two_sum(hi, lo);
        if !s.is_finite() {
            return DoubleDouble { hi: s, lo: s };
        }
        DoubleDouble { hi: s, lo: e }
    }

    /// Composes a value from a [BigFloatVec] chunk decomposition.
    pub fn from_big_float_vec(data: &BigFloatVec) -> Self {
        let two_m = xp_ldexp(1.0, data.width);
        let n = data.chunk.len();
        let mut val = DoubleDouble::from(data.chunk[n - 1] as f64);
        for i in (0..n - 1).rev() {
            // No rounding error: division by a power of two is exact.
            val = val / two_m + DoubleDouble::from(data.chunk[i] as f64);
        }
        val * (data.sign as f64 * xp_ldexp(1.0, data.offset))
    }

    /// High word.
    #[inline]
    pub fn hi(&self) -> f64 {
        debug_assert!(self.is_normalized(), "unnormalized: {:e} + {:e}", self.hi, self.lo);
        self.hi
    }
    /// Low word.
    #[inline]
    pub fn lo(&self) -> f64 {
        self.lo
    }

    /// Down-conversion to a plain `f64`.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.hi + self.lo
    }

    /// Checks the normalization invariant.  Intended for assertions.
    pub fn is_normalized(&self) -> bool {
        if !self.hi.is_finite() {
            return true;
        }
        if self.lo == 0.0 {
            return true;
        }
        self.hi + self.lo == self.hi || 2.0 * self.lo.abs() <= self.hi.abs() * f64::EPSILON
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.hi == 0.0
    }
    #[inline]
    pub fn is_pos(&self) -> bool {
        self.hi > 0.0
    }
    #[inline]
    pub fn is_neg(&self) -> bool {
        self.hi < 0.0
    }
    /// True when the sign bit of the value (including -0.0) is set.
    #[inline]
    pub fn signbit(&self) -> bool {
        self.hi.is_sign_negative()
    }

    /// Three-way comparison: hi words first, then lo words.  NaN operands
    /// yield `None`.
    pub fn compare(&self, o: &DoubleDouble) -> Option<Ordering> {
        if self.hi.is_nan() || self.lo.is_nan() || o.hi.is_nan() || o.lo.is_nan() {
            return None;
        }
        match self.hi.partial_cmp(&o.hi) {
            Some(Ordering::Equal) => self.lo.partial_cmp(&o.lo),
            other => other,
        }
    }

    /// Absolute value.
    pub fn abs(self) -> Self {
        if self.hi < 0.0 {
            DoubleDouble { hi: -self.hi, lo: -self.lo }
        } else {
            self
        }
    }

    /// `self * 2^m`, exact.
    pub fn ldexp(self, m: i32) -> Self {
        DoubleDouble { hi: xp_ldexp(self.hi, m), lo: xp_ldexp(self.lo, m) }
    }

    /// Size of one unit in the last place of the 107 bit format, assuming hi
    /// and lo are close packed.
    pub fn ulp(&self) -> f64 {
        if !self.hi.is_finite() {
            return 0.0;
        }
        if self.hi == 0.0 {
            return xp_ldexp(1.0, VERYTINY_EXP);
        }
        let (mant, mut exp) = frexp(self.hi);
        exp -= DD_PRECISION;
        if (mant == 0.5 && self.lo < 0.0) || (mant == -0.5 && self.lo > 0.0) {
            // On an exact power of two the ulp depends on the side the low
            // word sits on.
            exp -= 1;
        }
        if exp < VERYTINY_EXP {
            exp = VERYTINY_EXP; // Underflow protection
        }
        xp_ldexp(1.0, exp)
    }

    /// Difference from `reference`, expressed in multiples of `refulp`.
    /// Returns the absolute difference when `refulp` is zero.
    pub fn compute_diff_ulp(&self, reference: &DoubleDouble, refulp: f64) -> f64 {
        let mut r0 = self.hi - reference.hi;
        let mut r1 = self.lo - reference.lo;
        let mut refulp = refulp;
        if refulp != 0.0 {
            if refulp < 1.0 / POW_2_MANTISSA {
                // Guard against division by subnormals.
                refulp *= POW_2_MANTISSA;
                r0 *= POW_2_MANTISSA;
                r1 *= POW_2_MANTISSA;
            }
            r0 /= refulp;
            r1 /= refulp;
        }
        r0 + r1
    }

    /// `self * self`, slightly cheaper than the general product.
    pub fn square(self) -> Self {
        let (u0, u1) = square_prod(self.hi);
        if !u0.is_finite() || u0.abs() < DD_TINY {
            if self.hi == 0.0 && self.hi.is_finite() {
                // Either +0.0 or -0.0 squares to +0.0.
                return DoubleDouble::ZERO;
            }
            // Out-of-range problems: brute-force rescaling.
            let mut a = self;
            let mut b = self;
            return match multiplication_rescale(&mut a, &mut b) {
                Err(edge) => DoubleDouble { hi: edge, lo: edge },
                Ok(rescale) => {
                    let sq = a.square();
                    let (hi, lo) = rescale2(sq.hi, sq.lo, rescale);
                    DoubleDouble { hi, lo }
                }
            };
        }
        let (t12, mut u2) = two_prod(2.0 * self.hi, self.lo);
        let (u1, t12) = two_sum(u1, t12);
        u2 += t12;
        u2 += self.lo * self.lo;
        let (hi, mut lo) = ordered_two_sum(u0, u1);
        lo += u2;
        DoubleDouble { hi, lo }
    }

    /// 1/self with 0.5 ulp error.
    pub fn recip(self) -> Self {
        let mut y0 = 1.0 / self.hi;

        let xcheck = self.hi.abs();
        if !(f64::MIN_POSITIVE * POW_2_MANTISSA_HALF < xcheck
            && xcheck < f64::MAX / (16.0 * POW_2_MANTISSA * POW_2_MANTISSA))
        {
            // Range problems
            if !self.hi.is_finite() {
                let r = if self.hi == f64::INFINITY {
                    0.0
                } else if self.hi == f64::NEG_INFINITY {
                    -0.0
                } else {
                    f64::NAN
                };
                return DoubleDouble { hi: r, lo: r };
            }
            if !y0.is_finite() {
                // hi is a (possibly signed) zero
                return DoubleDouble { hi: y0, lo: y0 };
            }
            // Rescale and take the auxiliary path.
            let rescale = if self.hi.abs() > 1.0 {
                1.0 / (32.0 * POW_2_MANTISSA * POW_2_MANTISSA)
            } else {
                POW_2_MANTISSA
            };
            let atmp = DoubleDouble { hi: self.hi * rescale, lo: self.lo * rescale };
            y0 = 1.0 / atmp.hi;
            let (rtmp, corr) = auxiliary_recip(&atmp, y0);
            let (hi, lo) = rescale3(rtmp.hi, rtmp.lo, corr, rescale);
            return DoubleDouble { hi, lo };
        }

        let (mut result, corr) = auxiliary_recip(&self, y0);
        let (h, l, c) = coalesce(result.hi, result.lo, corr);
        result.hi = h;
        result.lo = l + c;
        result
    }

    /// Square root via two Newton steps; 0.5 ulp error.
    pub fn sqrt(self) -> Self {
        if !(DD_TINY <= self.hi && self.hi <= 0.5 * f64::MAX) {
            if !self.hi.is_finite() {
                let r = if self.hi == f64::INFINITY { f64::INFINITY } else { f64::NAN };
                return DoubleDouble { hi: r, lo: r };
            }
            if self.hi == 0.0 {
                // Convention dictates sqrt(-0.0) = -0.0: pass the sign.
                return DoubleDouble { hi: self.hi, lo: self.hi };
            }
            if self.hi < 0.0 {
                return DoubleDouble { hi: f64::NAN, lo: f64::NAN };
            }
            if self.hi < DD_TINY {
                // Underflow can lose digits: rescale up by an even power.
                let scaleup = 4.0 * POW_2_MANTISSA * POW_2_MANTISSA;
                let r =
                    DoubleDouble { hi: self.hi * scaleup, lo: self.lo * scaleup }.sqrt();
                let scaledown = 0.5 / POW_2_MANTISSA;
                return DoubleDouble { hi: r.hi * scaledown, lo: r.lo * scaledown };
            }
            // self.hi > 0.5*MAX: the mainline can overflow.
            let r = DoubleDouble { hi: self.hi * 0.25, lo: self.lo * 0.25 }.sqrt();
            return DoubleDouble { hi: r.hi * 2.0, lo: r.lo * 2.0 };
        }

        let y0 = self.hi.sqrt();
        let (s1, s2) = square_prod(y0);
        let ry0 = 0.5 / y0;
        let s1 = self.hi - s1;
        let (s1, s2) = two_sum(s1, -s2);
        let (s1, t1) = two_sum(s1, self.lo);
        let mut s2 = s2 + t1;
        let u1 = s1 * ry0;

        let u1sq = u1 * u1;
        let (t1, t2) = two_prod(-2.0 * y0, u1);
        let (s1, t1) = two_sum(s1, t1);
        s2 += t2 + t1 - u1sq;
        let s1 = ry0 * (s1 + s2);

        let (hi, mut lo) = ordered_two_sum(y0, u1);
        lo += s1;
        DoubleDouble { hi, lo }
    }

    /// 1/sqrt(self), 0.5 ulp error; about 20% faster than composing
    /// [Self::sqrt] and [Self::recip].
    pub fn recipsqrt(self) -> Self {
        if !(2.0 * DD_TINY <= self.hi && self.hi <= 1.0 / DD_TINY) {
            if !self.hi.is_finite() {
                let r = if self.hi == f64::INFINITY { 0.0 } else { f64::NAN };
                return DoubleDouble { hi: r, lo: r };
            }
            if self.hi == 0.0 {
                let r = if self.hi.is_sign_negative() {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                };
                return DoubleDouble { hi: r, lo: r };
            }
            if self.hi < 2.0 * DD_TINY {
                if self.hi < 0.0 {
                    return DoubleDouble { hi: f64::NAN, lo: f64::NAN };
                }
                let scale = 4.0 * POW_2_MANTISSA * POW_2_MANTISSA;
                let r = DoubleDouble { hi: self.hi * scale, lo: self.lo * scale }
                    .recipsqrt();
                let unscale = 2.0 * POW_2_MANTISSA;
                return DoubleDouble { hi: r.hi * unscale, lo: r.lo * unscale };
            }
            // Too big: digits can fall to underflow.
            let scale = 1.0 / (4.0 * POW_2_MANTISSA * POW_2_MANTISSA);
            let r = DoubleDouble { hi: self.hi * scale, lo: self.lo * scale }.recipsqrt();
            let unscale = 1.0 / (2.0 * POW_2_MANTISSA);
            return DoubleDouble { hi: r.hi * unscale, lo: r.lo * unscale };
        }

        // The adjustment to the seed y0 is 0.5*y0*d*(1 + 0.75*d + ...) with
        // d = 1 - x*y0*y0; the code keeps the first two series terms.
        let y0 = (1.0 / self.hi).sqrt();
        let (s0, s1) = square_prod(y0);
        let (mut t2, u1) = two_prod(self.hi, s0);
        t2 -= 1.0;
        let mhy0 = -0.5 * y0;
        let (t1, mut u2) = two_prod(self.lo, s0);
        u2 += self.lo * s1;

        let (u1, t2) = two_sum(u1, t2);
        u2 += t2;
        let (u1, v2) = two_sum(u1, t1);
        u2 += v2;

        let (t1, t2) = two_prod(self.hi, s1);
        u2 += t2;
        let (u1, v2) = two_sum(u1, t1);
        u2 += v2;
        u2 -= 0.75 * u1 * u1; // Halley correction

        let (u1, t2) = two_prod(mhy0, u1);
        u2 *= mhy0;
        u2 += t2;

        let (hi, lo) = coalesce_plus(y0, u1, u2);
        DoubleDouble { hi, lo }
    }

    /// Largest integer value not above self.
    pub fn floor(self) -> Self {
        let a0 = self.hi.floor();
        let a0r = self.hi - a0;
        let a1 = self.lo.floor();
        let a1r = self.lo - a1;
        let b = DoubleDouble::from_parts(a0, a1); // This is an integer
        let br = DoubleDouble::from_parts(a0r, a1r); // Sum of remainders
        b + br.hi().floor()
    }

    /// Smallest integer value not below self.
    pub fn ceil(self) -> Self {
        let a0 = self.hi.ceil();
        let a0r = self.hi - a0; // <= 0
        let a1 = self.lo.ceil();
        let a1r = self.lo - a1; // also <= 0
        let b = DoubleDouble::from_parts(a0, a1);
        let br = DoubleDouble::from_parts(a0r, a1r);
        b + br.hi().ceil()
    }
}

// ----------------------------------------------------------------------------
// --- CONSTRUCTION AND COMPARISON --------------------------------------------
// ----------------------------------------------------------------------------
impl From<f64> for DoubleDouble {
    #[inline]
    fn from(x: f64) -> Self {
        DoubleDouble { hi: x, lo: 0.0 }
    }
}
impl From<f32> for DoubleDouble {
    #[inline]
    fn from(x: f32) -> Self {
        DoubleDouble { hi: x as f64, lo: 0.0 }
    }
}
impl From<i32> for DoubleDouble {
    #[inline]
    fn from(x: i32) -> Self {
        DoubleDouble { hi: x as f64, lo: 0.0 }
    }
}
impl From<u32> for DoubleDouble {
    #[inline]
    fn from(x: u32) -> Self {
        DoubleDouble { hi: x as f64, lo: 0.0 }
    }
}
impl From<i64> for DoubleDouble {
    fn from(x: i64) -> Self {
        // Keep all the bits: split at 2^32, each half converts exactly.
        let high = (x >> 32) as f64 * 4294967296.0;
        let low = (x & 0xffff_ffff) as f64;
        DoubleDouble::from_parts(high, low)
    }
}
impl From<u64> for DoubleDouble {
    fn from(x: u64) -> Self {
        let high = (x >> 32) as f64 * 4294967296.0;
        let low = (x & 0xffff_ffff) as f64;
        DoubleDouble::from_parts(high, low)
    }
}

impl PartialOrd for DoubleDouble {
    fn partial_cmp(&self, o: &Self) -> Option<Ordering> {
        self.compare(o)
    }
}

// ----------------------------------------------------------------------------
// --- ADDITION / SUBTRACTION -------------------------------------------------
// ----------------------------------------------------------------------------
impl std::ops::Neg for DoubleDouble {
    type Output = DoubleDouble;
    #[inline]
    fn neg(self) -> DoubleDouble {
        DoubleDouble { hi: -self.hi, lo: -self.lo }
    }
}

impl std::ops::Add for DoubleDouble {
    type Output = DoubleDouble;
    fn add(self, y: DoubleDouble) -> DoubleDouble {
        // |error| <= 0.5 ulp.  Dekker's 1971 version is much less accurate,
        // and the QD library variant is good to about 2.5 ulps only.
        let (a0, b0) = two_sum(self.hi, y.hi);
        let (a1, b1) = two_sum(self.lo, y.lo);
        let (a1, b0) = two_sum(a1, b0);
        let (a0, a1) = ordered_two_sum(a0, a1);
        let tst = a1 * (1.0 + f64::EPSILON);
        let bsum = b0 + b1; // Order must be (b0 + b1) + a1

        if !a0.is_finite() {
            return if !(self.hi + y.hi).is_finite() {
                // The very first two_sum overflowed; a0 may be NaN here, so
                // report the plain sum of the high words instead.
                let v = self.hi + y.hi;
                DoubleDouble { hi: v, lo: v }
            } else {
                DoubleDouble { hi: a0, lo: a0 }
            };
        } else if y.hi == 0.0 {
            // Signed zero handling.
            return self;
        }

        // Boundary fixup so 1 + ulp/2 + ulp^2/2 does not collapse to 1+ulp/2.
        let chk = a0 + tst;
        if chk != a0 {
            // Either |a1| = ulp(a0)/2, or else |a0| = 2^n for some n.
            let tst = tst - a1;
            if tst == a1 * f64::EPSILON {
                // |a1| = 2^m for some m.  The ordered sum handles the case
                // bsum - a1 == a1, i.e. |bsum| << |a1|.
                let a0 = a0 + 2.0 * a1;
                let (hi, lo) = ordered_two_sum(a0, bsum - a1);
                return DoubleDouble { hi, lo };
            }
        }
        let (hi, lo) = ordered_two_sum(a0, a1 + bsum);
        DoubleDouble { hi, lo }
    }
}

impl std::ops::Sub for DoubleDouble {
    type Output = DoubleDouble;
    fn sub(self, y: DoubleDouble) -> DoubleDouble {
        // Duplicate of add with the sign folded into the two_diff calls; in
        // the original this measured about 10% faster than `self + (-y)`.
        let (a0, b0) = two_diff(self.hi, y.hi);
        let (a1, b1) = two_diff(self.lo, y.lo);
        let (a1, b0) = two_sum(a1, b0);
        let (a0, a1) = ordered_two_sum(a0, a1);
        let tst = a1 * (1.0 + f64::EPSILON);
        let bsum = b0 + b1;

        if !a0.is_finite() {
            return if !(self.hi - y.hi).is_finite() {
                let v = self.hi - y.hi;
                DoubleDouble { hi: v, lo: v }
            } else {
                DoubleDouble { hi: a0, lo: a0 }
            };
        } else if y.hi == 0.0 {
            return self;
        }

        let chk = a0 + tst;
        if chk != a0 {
            let tst = tst - a1;
            if tst == a1 * f64::EPSILON {
                let a0 = a0 + 2.0 * a1;
                let (hi, lo) = ordered_two_sum(a0, bsum - a1);
                return DoubleDouble { hi, lo };
            }
        }
        let (hi, lo) = ordered_two_sum(a0, a1 + bsum);
        DoubleDouble { hi, lo }
    }
}

impl std::ops::Add<f64> for DoubleDouble {
    type Output = DoubleDouble;
    #[inline]
    fn add(self, y: f64) -> DoubleDouble {
        self + DoubleDouble::from(y)
    }
}
impl std::ops::Sub<f64> for DoubleDouble {
    type Output = DoubleDouble;
    #[inline]
    fn sub(self, y: f64) -> DoubleDouble {
        self - DoubleDouble::from(y)
    }
}
impl std::ops::AddAssign for DoubleDouble {
    #[inline]
    fn add_assign(&mut self, y: DoubleDouble) {
        *self = *self + y;
    }
}
impl std::ops::SubAssign for DoubleDouble {
    #[inline]
    fn sub_assign(&mut self, y: DoubleDouble) {
        *self = *self - y;
    }
}

// ----------------------------------------------------------------------------
// --- MULTIPLICATION ---------------------------------------------------------
// ----------------------------------------------------------------------------
/// Rescaling support for multiplication near the range edges.  On success the
/// operands are rescaled in place and the power-of-two `rescale` to undo the
/// scaling is returned in `Ok`.  On definite over/underflow the appropriate
/// signed infinity or zero comes back in `Err`.
fn multiplication_rescale(
    a: &mut DoubleDouble,
    b: &mut DoubleDouble,
) -> Result<f64, f64> {
    if !a.hi.is_finite() || !b.hi.is_finite() {
        return Err(a.hi * b.hi);
    }

    let (a_m, mut a_exp) = frexp(a.hi);
    a.hi = 2.0 * a_m;
    a_exp -= 1; // 1.0 <= |a.hi| < 2.0
    let (b_m, mut b_exp) = frexp(b.hi);
    b.hi = 2.0 * b_m;
    b_exp -= 1;
    a.lo = xp_ldexp(a.lo, -a_exp);
    b.lo = xp_ldexp(b.lo, -b_exp);
    let mut expsum = a_exp + b_exp;

    if expsum > HUGE_EXP - 1 {
        if expsum > HUGE_EXP {
            // Definite overflow, regardless of the low words.
            return Err(if a.hi * b.hi > 0.0 { f64::INFINITY } else { f64::NEG_INFINITY });
        }
        // Otherwise finiteness depends on the low words: shift the scaling
        // and let the caller sort it out.  Rescale a and b identically so
        // this routine serves square() as well.
        expsum -= 2;
        a.hi *= 2.0;
        a.lo *= 2.0;
        b.hi *= 2.0;
        b.lo *= 2.0;
    } else if expsum < VERYTINY_EXP {
        if expsum < VERYTINY_EXP - 3 {
            // Underflow to (signed) zero.
            return Err(if a.hi * b.hi > 0.0 { 0.0 } else { -0.0 });
        }
        expsum += 8;
        a.hi *= 0.0625;
        a.lo *= 0.0625;
        b.hi *= 0.0625;
        b.lo *= 0.0625;
    }
    Ok(xp_ldexp(1.0, expsum))
}

impl std::ops::Mul for DoubleDouble {
    type Output = DoubleDouble;
    fn mul(self, y: DoubleDouble) -> DoubleDouble {
        // |error| <= 0.5 ulp
        let (u0, u1) = two_prod(self.hi, y.hi);
        let (s1, s2) = two_prod(self.hi, y.lo);

        if u0.abs() < DD_TINY || !u1.is_finite() {
            if u1.is_finite() && u0 == 0.0 {
                let z = signed_zero(self.hi, y.hi);
                return DoubleDouble { hi: z, lo: z };
            }
            // Out-of-range problems: brute-force rescaling.
            let mut rx = self;
            let mut ry = y;
            return match multiplication_rescale(&mut rx, &mut ry) {
                Err(edge) => {
                    let v = if edge == 0.0 && edge.is_finite() {
                        signed_zero(self.hi, y.hi)
                    } else {
                        edge
                    };
                    DoubleDouble { hi: v, lo: v }
                }
                Ok(rescale) => {
                    let r = rx * ry;
                    let (mut hi, lo) = rescale2(r.hi, r.lo, rescale);
                    let mut lo = lo;
                    if hi == 0.0 && hi.is_finite() {
                        hi = signed_zero(self.hi, y.hi);
                        lo = hi;
                    }
                    DoubleDouble { hi, lo }
                }
            };
        }

        let (u1, s1) = two_sum(u1, s1);
        let s2 = s2 + s1;
        let (t1, t2) = two_prod(self.lo, y.hi);
        let mut u2 = self.lo * y.lo;
        let t2 = t2 + s2;
        let (u1, t1) = two_sum(u1, t1);
        let t2 = t2 + t1;
        u2 += t2;

        let (hi, mut lo) = ordered_two_sum(u0, u1);
        if !hi.is_finite() {
            return DoubleDouble { hi, lo: hi };
        }
        lo += u2;
        DoubleDouble { hi, lo }
    }
}

impl std::ops::Mul<f64> for DoubleDouble {
    type Output = DoubleDouble;
    fn mul(self, x: f64) -> DoubleDouble {
        // About 30% faster than the full double-double product.
        let (u0, u1) = two_prod(self.hi, x);
        let (t1, u2) = two_prod(self.lo, x);

        if u0.abs() < DD_TINY || !u1.is_finite() {
            if u1.is_finite() && u0 == 0.0 {
                let z = signed_zero(x, self.hi);
                return DoubleDouble { hi: z, lo: z };
            }
            let mut ry = self;
            let mut rx = DoubleDouble::from(x);
            return match multiplication_rescale(&mut ry, &mut rx) {
                Err(edge) => {
                    let v = if edge == 0.0 && edge.is_finite() {
                        signed_zero(x, self.hi)
                    } else {
                        edge
                    };
                    DoubleDouble { hi: v, lo: v }
                }
                Ok(rescale) => {
                    let r = ry * rx;
                    let (mut hi, mut lo) = rescale2(r.hi, r.lo, rescale);
                    if hi == 0.0 && hi.is_finite() {
                        hi = signed_zero(x, self.hi);
                        lo = hi;
                    }
                    DoubleDouble { hi, lo }
                }
            };
        }

        let (u1, t2) = two_sum(u1, t1);
        let u2 = u2 + t2;
        let (hi, mut lo) = ordered_two_sum(u0, u1);
        if !hi.is_finite() {
            return DoubleDouble { hi, lo: hi };
        }
        lo += u2;
        DoubleDouble { hi, lo }
    }
}
impl std::ops::Mul<DoubleDouble> for f64 {
    type Output = DoubleDouble;
    #[inline]
    fn mul(self, y: DoubleDouble) -> DoubleDouble {
        y * self
    }
}
impl std::ops::MulAssign for DoubleDouble {
    #[inline]
    fn mul_assign(&mut self, y: DoubleDouble) {
        *self = *self * y;
    }
}
impl std::ops::MulAssign<f64> for DoubleDouble {
    #[inline]
    fn mul_assign(&mut self, y: f64) {
        *self = *self * y;
    }
}

// ----------------------------------------------------------------------------
// --- DIVISION ---------------------------------------------------------------
// ----------------------------------------------------------------------------
/// Rescaling support for division near the range edges; same contract as
/// [multiplication_rescale] with `rescale = bscale/ascale`.
fn division_rescale(a: &mut DoubleDouble, b: &mut DoubleDouble) -> Result<f64, f64> {
    if !a.hi.is_finite() || !b.hi.is_finite() {
        return Err(a.hi / b.hi);
    }

    let (a_m, mut a_exp) = frexp(a.hi);
    a.hi = 2.0 * a_m;
    a_exp -= 1; // 1.0 <= |a.hi| < 2.0
    let (b_m, b_exp) = frexp(b.hi);
    b.hi = b_m; // 0.5 <= |b.hi| < 1.0
    a.lo = xp_ldexp(a.lo, -a_exp);
    b.lo = xp_ldexp(b.lo, -b_exp);
    let mut expdiff = a_exp - b_exp;
    // 1.0 < |a.hi/b.hi| < 4.0

    if expdiff > HUGE_EXP - 1 {
        return Err(if a.hi * b.hi > 0.0 { f64::INFINITY } else { f64::NEG_INFINITY });
    } else if expdiff < VERYTINY_EXP {
        if expdiff < VERYTINY_EXP - 3 {
            return Err(if a.hi * b.hi > 0.0 { 0.0 } else { -0.0 });
        }
        a.hi *= 0.00390625;
        a.lo *= 0.00390625;
        expdiff += 8;
    }
    Ok(xp_ldexp(1.0, expdiff))
}

/// Division kernel: two Newton steps, 0.5 ulp.  The export is the quotient
/// pair plus a held-out correction so underflow rescaling can round properly;
/// `(q.hi, q.lo + q2)` is the normalized quotient.
fn auxiliary_divide(x: &DoubleDouble, y: &DoubleDouble) -> (DoubleDouble, f64) {
    let a0 = x.hi;
    let a1 = x.lo;
    let b0 = y.hi;
    let b1 = y.lo;

    let recip_b0 = 1.0 / b0;
    let x0 = a0 * recip_b0;
    let (t0, t1) = two_prod(x0, -b0);
    let (s1, mut u2) = two_prod(x0, -b1);
    let u1 = a0 + t0; // a0 and -t0 should be nearly equal

    let tiny_bound = 16.0 * f64::MIN_POSITIVE * POW_2_MANTISSA * POW_2_MANTISSA;
    if a0.abs() < 16.0 * DD_TINY || !(tiny_bound < x0.abs()) || !t1.is_finite() {
        // Zero checks first.
        if x.hi == 0.0 && x.hi.is_finite() {
            let q = if y.hi != 0.0 && y.hi.is_finite() {
                signed_zero(x.hi, y.hi)
            } else {
                x.hi / y.hi // May be NaN
            };
            return (DoubleDouble { hi: q, lo: q }, 0.0);
        }
        if y.hi == 0.0 && y.hi.is_finite() {
            let q = x.hi / y.hi; // Signed infinity
            return (DoubleDouble { hi: q, lo: q }, 0.0);
        }

        // Out-of-range problems: brute-force rescaling.
        let mut rx = *x;
        let mut ry = *y;
        return match division_rescale(&mut rx, &mut ry) {
            Err(edge) => {
                let v = if edge == 0.0 && edge.is_finite() {
                    signed_zero(x.hi, y.hi)
                } else {
                    edge
                };
                (DoubleDouble { hi: v, lo: v }, 0.0)
            }
            Ok(rescale) => {
                let (q, q2) = auxiliary_divide(&rx, &ry);
                let (hi, lo) = rescale3(q.hi, q.lo, q2, rescale);
                (DoubleDouble { hi, lo }, 0.0)
            }
        };
    }

    let (t1, t2) = two_sum(a1, t1);
    u2 += t2;
    let (u1, s2) = two_sum(u1, s1);
    u2 += s2;
    let (u1, t2) = two_sum(u1, t1);
    u2 += t2;
    let d1 = u1 * recip_b0;
    let (q0, q1) = ordered_two_sum(x0, d1);
    if !q0.is_finite() {
        return (DoubleDouble { hi: q0, lo: q0 }, q0);
    }
    u2 -= d1 * b1;

    let (t1, t2) = two_prod(d1, -b0);
    let u1 = u1 + t1; // u1 and -t1 should be nearly equal
    u2 += t2;
    let q2 = recip_b0 * (u1 + u2);
    let (q0, q1, q2) = coalesce(q0, q1, q2);
    (DoubleDouble { hi: q0, lo: q1 }, q2)
}

/// Reciprocal kernel; `y0` is the seed `1/x.hi`.  Export is the result pair
/// plus a held-out correction term.
fn auxiliary_recip(x: &DoubleDouble, y0: f64) -> (DoubleDouble, f64) {
    let (s1, s2) = two_prod(y0, x.hi);
    let s1 = s1 - 1.0;
    let (u1, mut u2) = two_prod(y0, x.lo);
    let (s1, s2) = two_sum(s1, s2);
    u2 += s2;
    let (s1, u1) = two_sum(s1, u1);
    let (lo, t2) = two_prod(y0, -s1);
    u2 = y0 * (u2 + u1 - s1 * s1);
    (DoubleDouble { hi: y0, lo }, t2 - u2)
}

impl std::ops::Div for DoubleDouble {
    type Output = DoubleDouble;
    fn div(self, y: DoubleDouble) -> DoubleDouble {
        let (mut q, q2) = auxiliary_divide(&self, &y);
        q.lo += q2;
        if q.hi.is_finite() && q.hi == 0.0 {
            let z = signed_zero(self.hi, y.hi);
            return DoubleDouble { hi: z, lo: z };
        }
        q
    }
}

impl std::ops::Div<f64> for DoubleDouble {
    type Output = DoubleDouble;
    fn div(self, y: f64) -> DoubleDouble {
        // Two Newton steps, |error| <= 0.5 ulp.
        let a0 = self.hi;
        let a1 = self.lo;
        let b0 = y;

        let recip_b0 = 1.0 / b0;
        let x0 = a0 * recip_b0;
        let (t0, t1) = two_prod(x0, -b0);

        let tiny_bound = 16.0 * f64::MIN_POSITIVE * POW_2_MANTISSA * POW_2_MANTISSA;
        if a0.abs() < 16.0 * DD_TINY || !(tiny_bound < x0.abs()) || !t1.is_finite() {
            if self.hi == 0.0 && self.hi.is_finite() {
                let q = if y != 0.0 && y.is_finite() {
                    signed_zero(self.hi, y)
                } else {
                    self.hi / y // May be NaN
                };
                return DoubleDouble { hi: q, lo: q };
            }
            if y == 0.0 && y.is_finite() {
                let q = self.hi / y; // Signed infinity
                return DoubleDouble { hi: q, lo: q };
            }

            let mut rx = self;
            let mut ry = DoubleDouble::from(y);
            return match division_rescale(&mut rx, &mut ry) {
                Err(edge) => {
                    let v = if edge == 0.0 && edge.is_finite() {
                        signed_zero(self.hi, y)
                    } else {
                        edge
                    };
                    DoubleDouble { hi: v, lo: v }
                }
                Ok(rescale) => {
                    let q = rx / ry.hi;
                    let (mut hi, mut lo) = rescale2(q.hi, q.lo, rescale);
                    if hi == 0.0 && hi.is_finite() {
                        hi = signed_zero(self.hi, y);
                        lo = hi;
                    }
                    DoubleDouble { hi, lo }
                }
            };
        }

        let (t1, mut u2) = two_sum(a1, t1);
        let u1 = a0 + t0; // a0 and -t0 should be nearly equal
        let (u1, t2) = two_sum(u1, t1);

        let d1 = u1 * recip_b0;
        u2 += t2;

        let (s1, s2) = two_prod(d1, -b0);
        let (q0, q1) = ordered_two_sum(x0, d1);

        let u1 = u1 + s1; // u1 and -s1 should be nearly equal
        u2 += s2;
        let q2 = recip_b0 * (u1 + u2);
        let (q0, q1, q2) = coalesce(q0, q1, q2);
        DoubleDouble { hi: q0, lo: q1 + q2 }
    }
}
impl std::ops::DivAssign for DoubleDouble {
    #[inline]
    fn div_assign(&mut self, y: DoubleDouble) {
        *self = *self / y;
    }
}
impl std::ops::DivAssign<f64> for DoubleDouble {
    #[inline]
    fn div_assign(&mut self, y: f64) {
        *self = *self / y;
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_doubledouble {
    use super::*;

    fn dd(hi: f64, lo: f64) -> DoubleDouble {
        DoubleDouble::from_parts(hi, lo)
    }

    #[test]
    fn pi_plus_tiny_minus_pi_is_exact() {
        let tiny = 1e-30;
        let diff = (DoubleDouble::PI + DoubleDouble::from(tiny)) - DoubleDouble::PI;
        assert_eq!(tiny, diff.hi());
        assert_eq!(0.0, diff.lo());
    }

    #[test]
    fn addition_keeps_the_boundary_tail() {
        // 1 + ulp/2 + ulp^2/2 must round to (1 + ulp, -ulp/2 + ulp^2/2).
        let a = dd(1.0, ldx(1.0, -53));
        let b = DoubleDouble::from(ldx(1.0, -106));
        let s = a + b;
        assert_eq!(1.0 + f64::EPSILON, s.hi());
        assert_eq!(ldx(1.0, -106) - ldx(1.0, -53), s.lo());
    }

    #[test]
    fn signed_zero_rules() {
        let mz = DoubleDouble::from(-0.0);
        assert!((mz * DoubleDouble::from(5.0)).hi().is_sign_negative());
        assert!((mz / DoubleDouble::from(5.0)).hi().is_sign_negative());
        assert!((-mz).hi().is_sign_positive());
        // x + 0 passes x through untouched, either zero sign.
        let x = dd(2.5, ldx(1.0, -60));
        assert_eq!(x, x + mz);
        assert_eq!(x, x + DoubleDouble::ZERO);
        // sqrt(-0.0) keeps the sign by convention.
        assert!(mz.sqrt().hi().is_sign_negative());
    }

    #[test]
    fn nan_and_infinity_propagate() {
        let nan = DoubleDouble::from(f64::NAN);
        assert!((nan + DoubleDouble::ONE).hi.is_nan());
        assert!((nan * DoubleDouble::ONE).hi.is_nan());
        let inf = DoubleDouble::from(f64::INFINITY);
        assert_eq!(f64::INFINITY, (inf + DoubleDouble::ONE).hi);
        assert_eq!(f64::NEG_INFINITY, (-inf - DoubleDouble::ONE).hi);
        assert_eq!(0.0, inf.recip().hi);
        assert!((inf - inf).hi.is_nan());
    }

    #[test]
    fn overflow_produces_signed_infinity() {
        let big = DoubleDouble::from(f64::MAX);
        assert_eq!(f64::INFINITY, (big + big).hi);
        assert_eq!(f64::NEG_INFINITY, (big * DoubleDouble::from(-2.0)).hi);
    }

    #[test]
    fn product_and_quotient_are_half_ulp() {
        // (pi * e) / e recovers pi to the last ulp.
        let e = dd(std::f64::consts::E, 2.4442925306929086e-17);
        let p = DoubleDouble::PI * e;
        let q = p / e;
        let diff = q.compute_diff_ulp(&DoubleDouble::PI, DoubleDouble::PI.ulp());
        assert!(diff.abs() <= 1.0, "diff = {diff} ulp");
    }

    #[test]
    fn division_by_scalar_matches_full_division() {
        let x = dd(123.456, 7.89e-15);
        let a = x / 7.0;
        let b = x / DoubleDouble::from(7.0);
        let diff = a.compute_diff_ulp(&b, b.ulp());
        assert!(diff.abs() <= 1.0, "diff = {diff} ulp");
    }

    #[test]
    fn sqrt_of_two_squares_back_to_two() {
        let r = DoubleDouble::from(2.0).sqrt();
        let two = r.square();
        let diff = two.compute_diff_ulp(&DoubleDouble::from(2.0), DoubleDouble::from(2.0).ulp());
        assert!(diff.abs() <= 1.0, "diff = {diff} ulp");
        // And it agrees with the reference decomposition of sqrt(2).
        assert_eq!(HIRES_SQRT2[0], r.hi());
        assert_eq!(HIRES_SQRT2[1], r.lo());
    }

    #[test]
    fn recip_and_recipsqrt_agree() {
        let x = dd(3.75, -1.1e-17);
        let a = x.recipsqrt();
        let b = x.sqrt().recip();
        let diff = a.compute_diff_ulp(&b, b.ulp());
        assert!(diff.abs() <= 1.5, "diff = {diff} ulp");
        // recip of a negative zero is -inf
        assert_eq!(f64::NEG_INFINITY, DoubleDouble::from(-0.0).recip().hi);
    }

    #[test]
    fn comparison_is_lexicographic_on_words() {
        let a = dd(1.0, -1e-20);
        let b = dd(1.0, 1e-20);
        assert!(a < b);
        assert!(b > a);
        assert!(a < DoubleDouble::from(2.0));
        assert!(DoubleDouble::from(f64::NAN).partial_cmp(&a).is_none());
    }

    #[test]
    fn floor_and_ceil_split_around_integers() {
        let x = dd(2.0, -1e-20); // just below 2
        assert_eq!(DoubleDouble::from(1.0), x.floor());
        assert_eq!(DoubleDouble::from(2.0), x.ceil());
        let y = dd(-2.0, 1e-20); // just above -2
        assert_eq!(DoubleDouble::from(-2.0), y.floor());
        assert_eq!(DoubleDouble::from(-1.0), y.ceil());
        assert_eq!(DoubleDouble::from(3.0), DoubleDouble::from(3.0).floor());
    }

    #[test]
    fn ulp_respects_the_power_of_two_boundary() {
        let one = DoubleDouble::ONE;
        let below = dd(1.0, -ldx(1.0, -107));
        // Just below a power of two the spacing halves.
        assert_eq!(one.ulp(), 2.0 * below.ulp());
    }

    #[test]
    fn big_float_vec_reconstructs_pi() {
        // pi in 8 chunks of 16 bits.
        let pi = BigFloatVec {
            sign: 1,
            offset: -14,
            width: 16,
            chunk: vec![0xC90F, 0xDAA2, 0x2168, 0xC234, 0xC4C6, 0x628B, 0x80DC, 0x1CD1],
        };
        let val = DoubleDouble::from_big_float_vec(&pi);
        let diff = val.compute_diff_ulp(&DoubleDouble::PI, DoubleDouble::PI.ulp());
        // 128 chunk bits fully cover the 107 bit mantissa.
        assert!(diff.abs() <= 1.0, "diff = {diff} ulp");
    }

    #[test]
    fn wide_integers_convert_exactly() {
        let v = DoubleDouble::from(u64::MAX);
        // 2^64 - 1 = (2^64) - 1 exactly representable as a double-double.
        let expect = DoubleDouble::from_parts(ldx(1.0, 64), -1.0);
        assert_eq!(expect, v);
        let w = DoubleDouble::from(i64::MIN);
        assert_eq!(DoubleDouble::from(-ldx(1.0, 63)), w);
    }

    #[test]
    fn ldexp_is_exact_across_the_range() {
        let x = dd(1.5, ldx(1.0, -60));
        let y = x.ldexp(100).ldexp(-100);
        assert_eq!(x, y);
    }

    #[test]
    fn square_matches_product() {
        let x = dd(1.7320508075688772, 1.0e-16);
        assert_eq!(x * x, x.square());
    }
}
