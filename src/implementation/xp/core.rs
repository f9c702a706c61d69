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

//! Bread-and-butter error-free transformations for double-double arithmetic.
//!
//! Everything here follows TJ Dekker, "A floating-point technique for
//! extending the available precision," Numer. Math. 18, 224-242 (1971), and
//! Shewchuk, "Adaptive precision floating-point arithmetic and fast robust
//! geometric predicates," Discrete Comput. Geom. 18, 305-363 (1997).
//!
//! The exactness of these kernels relies on IEEE-754 semantics with no
//! re-association and no hidden extra precision.  Rust guarantees both for
//! `f64`, so no volatile or store-flattening contortions are needed to keep
//! the compiler honest.

/// Mantissa width of the base type, in bits.
pub const MANTISSA_PRECISION: i32 = 53;
/// Mantissa width of the composite double-double type, in bits.
pub const DD_PRECISION: i32 = 2 * MANTISSA_PRECISION + 1;
/// Power-of-two exponent limit: 2^HUGE_EXP overflows the base type.
pub const HUGE_EXP: i32 = 1024;
/// Exponent of the smallest subnormal: 2^VERYTINY_EXP.
pub const VERYTINY_EXP: i32 = -1074;
/// 2^53
pub const POW_2_MANTISSA: f64 = 9007199254740992.0;
/// 2^27
pub const POW_2_MANTISSA_HALF: f64 = 134217728.0;
/// Magnitude floor below which products and quotients divert to the
/// brute-force rescaling paths: MIN_POSITIVE * 2^106.
pub const DD_TINY: f64 = pow2(-916);
/// Cube root of the smallest subnormal, roughly.  Arguments below this make
/// squared terms underflow.
pub const CUBEROOT_VERYTINY: f64 = pow2(-358);

/// 2^n, exact, for -1074 <= n <= 1023.  Usable in const context, which is
/// where all the table constants in this package are assembled.
pub const fn pow2(n: i32) -> f64 {
    if n >= -1022 {
        f64::from_bits(((n + 1023) as u64) << 52)
    } else {
        f64::from_bits(1u64 << (n + 1074))
    }
}

/// `m * 2^e`, exact whenever the result is representable.  Const variant of
/// [xp_ldexp] for assembling table constants from integer mantissas.
pub const fn ldx(m: f64, e: i32) -> f64 {
    m * pow2(e)
}

/// Splits `x` into mantissa in `[0.5, 1)` and exponent with `x = m * 2^e`.
pub fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    if raw_exp == 0 {
        // Subnormal: renormalize first.
        let (m, e) = frexp(x * POW_2_MANTISSA);
        return (m, e - MANTISSA_PRECISION);
    }
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, raw_exp - 1022)
}

/// `x * 2^m` by exponentiation-by-squaring.
///
/// System `ldexp` implementations are unreliable near the denormal range, and
/// a plain multiply by `2^m` overflows for large `|m|` even when the result
/// is representable.  The squaring ladder sidesteps both problems.
pub fn xp_ldexp(x: f64, m: i32) -> f64 {
    if m == 0 {
        return x;
    }
    let mut x = x;
    let mut n: u32;
    let mut base: f64;
    if m > 0 {
        n = m as u32;
        if n & 1 != 0 {
            x *= 2.0;
        }
        base = 2.0;
    } else {
        n = m.unsigned_abs();
        if n & 1 != 0 {
            x *= 0.5;
        }
        base = 0.5;
    }

    // nstop is set so that base*base cannot overflow.
    let nstop = n >> 10; // log2(HUGE_EXP)
    loop {
        n >>= 1;
        if n <= nstop {
            break;
        }
        base *= base;
        if n & 1 != 0 {
            x *= base;
        }
    }
    if n > 0 {
        // Leftover bits in the range where base*base would overflow.
        x *= base;
        while n > 0 {
            x *= base;
            n -= 1;
        }
    }
    x
}

/// Error-free sum for ordered inputs: requires `|x| >= |y|` (or x == 0).
/// Returns `(s, e)` with `s = fl(x + y)` and `s + e == x + y` exactly.  If
/// the sum overflows, `s` is infinite and `s + e` is NaN.
#[inline]
pub fn ordered_two_sum(x: f64, y: f64) -> (f64, f64) {
    // The sum stays exact as long as the exponent of x is not below the
    // exponent of y, so the check leaves one binade of slack for the
    // cancellation paths in addition and subtraction.
    debug_assert!(
        !(2.0 * x.abs() < y.abs() && x != 0.0 && x.is_finite() && y.is_finite()),
        "ordered_two_sum operand order violated: x={x:e} y={y:e}"
    );
    let u = x + y;
    let t1 = u - x;
    (u, y - t1)
}

/// Error-free sum, no ordering requirement.  Returns `(s, e)` with
/// `s + e == x + y` exactly for finite inputs.
#[inline]
pub fn two_sum(x: f64, y: f64) -> (f64, f64) {
    let u = x + y;
    let t1 = u - x;
    let t2 = u - t1;
    let t3 = y - t1;
    let t4 = x - t2;
    (u, t4 + t3)
}

/// Error-free difference: `(d, e)` with `d + e == x - y` exactly.
#[inline]
pub fn two_diff(x: f64, y: f64) -> (f64, f64) {
    let u = x - y;
    let t1 = u - x;
    let t2 = u - t1;
    let t3 = y + t1;
    let t4 = x - t2;
    (u, t4 - t3)
}

/// Dekker split of `x` into two non-overlapping halves of at most 27
/// significant bits each.
///
/// If `|x|` is within a factor `2^27` of the overflow threshold the product
/// by the split constant overflows and both returns are NaN; callers that can
/// meet such inputs must rescale first.
#[inline]
pub fn split(x: f64) -> (f64, f64) {
    // splitmagic = 1 + 2^ceil(p/2)
    const SPLITMAGIC: f64 = 134217729.0;
    let t = SPLITMAGIC * x;
    let u = t - x;
    let u = t - u;
    (u, x - u)
}

/// Error-free product: `(p, e)` with `p + e == x * y` exactly.
///
/// `f64::mul_add` rounds once, so the residual comes out exact without the
/// four-way Dekker multiply; it also stays well defined near the range edges
/// where the split constant would overflow.
#[inline]
pub fn two_prod(x: f64, y: f64) -> (f64, f64) {
    let p = x * y;
    (p, x.mul_add(y, -p))
}

/// Error-free square: `(p, e)` with `p + e == x * x` exactly.
#[inline]
pub fn square_prod(x: f64) -> (f64, f64) {
    let p = x * x;
    (p, x.mul_add(x, -p))
}

/// The zero whose sign is the product of the signs of the two factors.
#[inline]
pub fn signed_zero(afactor: f64, bfactor: f64) -> f64 {
    if afactor.is_sign_negative() == bfactor.is_sign_negative() {
        0.0
    } else {
        -0.0
    }
}

/// Undoes a power-of-two rescaling of a normalized pair `(x, y)`, recovering
/// the rounding loss when `y * rescale` lands in the subnormal range.
pub fn rescale2(x: f64, y: f64, rescale: f64) -> (f64, f64) {
    let test = x * rescale;
    if !test.is_finite() {
        (test, test)
    } else if test.abs() < f64::MIN_POSITIVE {
        // Possible underflow rounding error.
        let tmp = test / rescale; // Note: 1.0/rescale may overflow
        let mut err = x - tmp;
        err += y;
        err *= rescale;
        (test + err, 0.0)
    } else {
        // Even if (x,y) was normalized, (x*rescale,y*rescale) might not be
        // when y*rescale rounds due to underflow.
        ordered_two_sum(test, y * rescale)
    }
}

/// Triple-component variant of [rescale2].
pub fn rescale3(xi: f64, yi: f64, zi: f64, rescale: f64) -> (f64, f64) {
    let (x, y) = ordered_two_sum(xi, yi);
    let (y, z) = ordered_two_sum(y, zi);

    let testx = x * rescale;
    let testy = y * rescale;
    if !testx.is_finite() {
        (testx, testx)
    } else if testy.abs() < f64::MIN_POSITIVE {
        let tmpx = testx / rescale;
        let errx = x - tmpx;
        let tmpy = testy / rescale;
        let erry = y - tmpy;
        let err_total = (errx + erry + z) * rescale;
        ordered_two_sum(testx, testy + err_total)
    } else {
        ordered_two_sum(testx, testy)
    }
}

/// Prepares three overlapping components (with `|a0| >= |a1| >= |a2|`) for
/// reduction to two.  The caller finishes with `a1 + a2`.
#[inline]
pub fn coalesce(a0: f64, a1: f64, a2: f64) -> (f64, f64, f64) {
    let u = a1 + a2;
    let v = a1 - u;
    let s = a0;
    let b0 = a0 + u;
    let b2 = a2 + v;
    let s = s - b0;
    (b0, s + u, b2)
}

/// Reduces three components to a normalized pair, handling the
/// `a0 + ulp/2 + ulp^2/2` and `2^n*(1 - ulp/2 - ulp^2/2)` boundary cases
/// whose naive coalescing would drop the last half-ulp.
pub fn coalesce_plus(a0: f64, a1: f64, a2: f64) -> (f64, f64) {
    let x = a1 + a2;
    let mut b0 = a0 + x;
    let mut b1 = a0 - b0;
    b1 += x;
    let mut y = a1 - x;
    let tst = b1 * (1.0 + f64::EPSILON);
    y += a2;

    let chk = b0 + tst;
    if chk != b0 {
        // Either |b1| = ulp(b0)/2, or else |b0| = 2^n for some n.
        let tst = tst - b1;
        if tst == b1 * f64::EPSILON {
            // |b1| = 2^m for some m.  The ordered sum is needed when
            // |y| << |b1| so b1 - y rounds back to b1.
            b0 += 2.0 * b1;
            return ordered_two_sum(b0, y - b1);
        }
    }
    (b0, b1 + y)
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_core {
    use super::*;

    #[test]
    fn two_sum_residual_is_exact() {
        let cases = [
            (1.0, 1e-20),
            (1e300, -1.0),
            (3.5, -3.5),
            (1.0 + f64::EPSILON, -1.0),
            (0.1, 0.2),
        ];
        for (x, y) in cases {
            let (s, e) = two_sum(x, y);
            // s is the rounded sum, and e recovers it exactly.
            assert_eq!(s, x + y);
            // Verify with an ordered reference evaluation.
            let (hi, lo) = if x.abs() >= y.abs() { (x, y) } else { (y, x) };
            let (rs, re) = ordered_two_sum(hi, lo);
            assert_eq!(rs, s);
            assert_eq!(re, e);
        }
    }

    #[test]
    fn two_prod_residual_is_exact() {
        let (p, e) = two_prod(0.1, 10.0);
        // 0.1*10 is not exactly 1; the fma residual recovers the defect.
        assert_eq!(p, 0.1f64 * 10.0);
        assert_ne!(e, 0.0);
        let (p2, e2) = two_prod(3.0, 5.0);
        assert_eq!((15.0, 0.0), (p2, e2));
    }

    #[test]
    fn split_halves_do_not_overlap() {
        let (hi, lo) = split(std::f64::consts::PI);
        assert_eq!(std::f64::consts::PI, hi + lo);
        // Each half fits in 27 bits: squaring must be exact.
        assert_eq!(0.0, hi.mul_add(hi, -(hi * hi)));
        assert_eq!(0.0, lo.mul_add(lo, -(lo * lo)));
    }

    #[test]
    fn frexp_matches_libm_contract() {
        let (m, e) = frexp(8.0);
        assert_eq!((0.5, 4), (m, e));
        let (m, e) = frexp(-0.75);
        assert_eq!((-0.75, 0), (m, e));
        // Subnormal inputs are renormalized.
        let (m, e) = frexp(pow2(-1074));
        assert_eq!(0.5, m);
        assert_eq!(-1073, e);
    }

    #[test]
    fn xp_ldexp_handles_wide_shifts() {
        assert_eq!(pow2(100), xp_ldexp(1.0, 100));
        assert_eq!(0.0, xp_ldexp(1.0, -2000));
        assert_eq!(f64::INFINITY, xp_ldexp(1.0, 2000));
        // Shifting out of then back into range must not flush to zero.
        let x = pow2(-1000);
        assert_eq!(pow2(-1050), xp_ldexp(x, -50));
    }

    #[test]
    fn ordered_two_sum_overflow_reports_infinity() {
        let (s, _e) = ordered_two_sum(f64::MAX, f64::MAX);
        assert!(s.is_infinite());
    }

    #[test]
    fn signed_zero_follows_factor_signs() {
        assert!(signed_zero(1.0, 1.0).is_sign_positive());
        assert!(signed_zero(-1.0, 1.0).is_sign_negative());
        assert!(signed_zero(-1.0, -1.0).is_sign_positive());
    }

    #[test]
    fn coalesce_plus_keeps_the_half_ulp_tail() {
        // 1 + 2^-53 + 2^-106 lies just above the rounding midpoint, so the
        // correctly rounded pair is (1 + 2^-52, -2^-53 + 2^-106).  A naive
        // coalesce collapses it to (1, 2^-53) and silently loses the tail.
        let (b0, b1) = coalesce_plus(1.0, ldx(1.0, -53), ldx(1.0, -106));
        assert_eq!(1.0 + f64::EPSILON, b0);
        assert_eq!(ldx(1.0, -106) - ldx(1.0, -53), b1);
    }
}
