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

//! Triple-double helpers, for internal use where the double-double routines
//! need a little extra headroom.
//!
//! The routines marked "sloppy" may be off by many ulps with respect to
//! triple-double accuracy.  That is fine: they only ever feed computations
//! whose published accuracy is double-double, where the slop disappears below
//! the last ulp.  A triple here is three `f64` components in decreasing
//! magnitude order, not necessarily non-overlapping unless stated.

use super::core::*;
use super::doubledouble::DoubleDouble;

/// Renormalizes three components into decreasing non-overlapping order.
#[inline]
pub fn normalize3(a0: f64, a1: f64, a2: f64) -> (f64, f64, f64) {
    let (b1, b2) = two_sum(a1, a2);
    let (b0, b1) = two_sum(a0, b1);
    let (b1, b2) = two_sum(b1, b2);
    (b0, b1, b2)
}

/// Adds two triples.  Error <= 0.5 ulp of the triple.
pub fn three_sum(
    a0: f64, a1: f64, a2: f64,
    b0: f64, b1: f64, b2: f64,
) -> (f64, f64, f64) {
    let (a0, b0) = two_sum(a0, b0);
    let (a1, b1) = two_sum(a1, b1);
    let (a2, b2) = two_sum(a2, b2);

    let save_sum = a0;

    let (a1, b0) = two_sum(a1, b0);
    let (a2, b1) = two_sum(a2, b1);
    let b2 = b2 + b1;

    let (a0, a1) = two_sum(a0, a1);

    let (a2, b0) = two_sum(a2, b0);
    let b2 = b2 + b0;
    let (a1, a2) = two_sum(a1, a2);
    let a2 = a2 + b2;

    let (c0, a1) = ordered_two_sum(a0, a1);
    if !c0.is_finite() {
        let inf = if save_sum > 0.0 { f64::INFINITY } else { f64::NEG_INFINITY };
        return (inf, inf, inf);
    }
    let (c1, c2) = ordered_two_sum(a1, a2);
    (c0, c1, c2)
}

/// `a += b0` on a triple.  Error <= 0.5 ulp.
pub fn three_increment(a0: f64, a1: f64, a2: f64, b0: f64) -> (f64, f64, f64) {
    let (a0, b0) = two_sum(a0, b0);
    let (a1, b0) = two_sum(a1, b0);
    let (a0, a1) = two_sum(a0, a1);
    let (a2, b0) = two_sum(a2, b0);
    let (a1, a2) = two_sum(a1, a2);
    (a0, a1, a2 + b0)
}

/// Triple product.  Assumes the inputs are close to normalized.  Error is
/// below about 20 ulps of the triple.
pub fn sloppy_prod(
    a0: f64, a1: f64, a2: f64,
    b0: f64, b1: f64, b2: f64,
) -> (f64, f64, f64) {
    let (t0, t1) = two_prod(a0, b0);
    let (u1, u2) = two_prod(a0, b1);
    let (v1, v2) = two_prod(a1, b0);

    if !t0.is_finite() {
        return (t0, t0, t0);
    }

    let u2 = u2 + v2;
    let (u1, w2) = two_sum(u1, v1);
    let u2 = u2 + w2;
    let (t1, t2) = two_sum(t1, u1);
    let t2 = t2 + u2;

    let (c0, t1) = ordered_two_sum(t0, t1);

    let t2 = t2 + (a0 * b2 + a1 * b1 + a2 * b0);

    // This last reduction needs a full two_sum: with an ordered sum the
    // boundary inputs around pi lose a couple of ulps.
    let (c1, c2) = two_sum(t1, t2);
    (c0, c1, c2)
}

/// Triple square.  Error is below about 12 ulps of the triple.
pub fn sloppy_square(a0: f64, a1: f64, a2: f64) -> (f64, f64, f64) {
    let (t0, t1) = square_prod(a0);
    if !t0.is_finite() {
        return (t0, t0, t0);
    }
    let (u1, u2) = two_prod(2.0 * a0, a1);
    let (t1, t2) = two_sum(t1, u1);
    let t2 = t2 + (u2 + a1 * a1 + 2.0 * a0 * a2);
    let (c0, t1) = ordered_two_sum(t0, t1);
    let (c1, c2) = ordered_two_sum(t1, t2);
    (c0, c1, c2)
}

/// Triple square root via two Newton steps.  Error is below about 15 ulps.
/// Assumes a0 is comfortably inside the range limits; this is a private
/// helper and its callers prescale.
pub fn sloppy_sqrt(a0: f64, a1: f64, a2: f64) -> (f64, f64, f64) {
    if a0 == 0.0 {
        return (a0, a0, a0);
    }
    let x0 = a0.sqrt();
    let rhx0 = 0.5 / x0;
    let (xsq0, xsq1) = square_prod(x0);
    let d0 = a0 - xsq0;
    let (d1, mut d2) = two_sum(a1, -xsq1);
    let (d0, d1) = ordered_two_sum(d0, d1);
    let e1 = rhx0 * d0; // One Newton step gives x0 + e1
    d2 += a2;
    // Second Newton step
    let (t0, t1) = two_prod(-2.0 * x0, e1);
    let t0 = t0 + d0;
    d2 -= e1 * e1;
    let t0 = t0 + t1 + d1 + d2;
    let (c0, e1) = ordered_two_sum(x0, e1);
    let t0 = t0 * rhx0;
    let (c1, c2) = two_sum(e1, t0);
    (c0, c1, c2)
}

/// Triple reciprocal `1/(a0+a1+a2)` via two Newton steps.
pub fn sloppy_recip(a0: f64, a1: f64, a2: f64) -> (f64, f64, f64) {
    if !a0.is_finite() {
        let r = if a0 == f64::INFINITY {
            0.0
        } else if a0 == f64::NEG_INFINITY {
            -0.0
        } else {
            f64::NAN
        };
        return (r, r, r);
    }
    if a0 == 0.0 {
        let r = if a0.is_sign_negative() { f64::NEG_INFINITY } else { f64::INFINITY };
        return (r, r, r);
    }

    let b0 = 1.0 / a0; // First estimate

    // First Newton step, at double-double accuracy.
    let tmp = DoubleDouble::raw(a0, a1) * b0;
    let tmp = DoubleDouble::from(1.0) - tmp;
    let tmp = tmp * b0 + DoubleDouble::from(b0);
    let (b0, b1, b2) = (tmp.hi(), tmp.lo(), 0.0);

    // Second Newton step, at triple-double accuracy.
    let (t0, t1, t2) = sloppy_prod(a0, a1, a2, b0, b1, b2);
    let (t0, t1, t2) = three_increment(t0, t1, t2, -1.0);
    let (t0, t1, t2) = sloppy_prod(t0, t1, t2, b0, b1, b2);
    let (b0, b1, b2) = three_sum(b0, b1, b2, -t0, -t1, -t2);
    normalize3(b0, b1, b2)
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_triple {
    use super::*;

    fn as_dd(t: (f64, f64, f64)) -> f64 {
        t.0 + t.1 + t.2
    }

    #[test]
    fn three_sum_is_exact_on_disjoint_components() {
        let a = (1.0, ldx(1.0, -60), ldx(1.0, -120));
        let b = (2.0, ldx(1.0, -55), ldx(1.0, -115));
        let (c0, c1, c2) = three_sum(a.0, a.1, a.2, b.0, b.1, b.2);
        assert_eq!(3.0, c0);
        // Components must be ordered and non-overlapping.
        assert!(c1.abs() <= c0.abs() * f64::EPSILON);
        assert!(c2.abs() <= c1.abs() * f64::EPSILON || c2 == 0.0);
        assert!((as_dd((c0, c1, c2)) - 3.0 - a.1 - a.2 - b.1 - b.2).abs() < 1e-30);
    }

    #[test]
    fn three_increment_folds_a_scalar() {
        let (a0, a1, a2) = three_increment(1.0, ldx(1.0, -70), 0.0, 0.25);
        assert_eq!(1.25, a0);
        assert_eq!(ldx(1.0, -70), a1 + a2);
    }

    #[test]
    fn sloppy_square_of_sqrt2_is_two() {
        let s = std::f64::consts::SQRT_2;
        let (lo, _) = two_prod(s, s); // residual of the rounded square
        let _ = lo;
        let (c0, c1, c2) = sloppy_square(s, 0.0, 0.0);
        // s^2 is exactly representable as a double-double
        assert_eq!(s * s, c0);
        assert_eq!(s.mul_add(s, -(s * s)), c1 + c2);
    }

    #[test]
    fn sloppy_sqrt_squares_back() {
        let (c0, c1, c2) = sloppy_sqrt(2.0, 0.0, 0.0);
        let (s0, s1, s2) = sloppy_square(c0, c1, c2);
        let err = (s0 - 2.0) + s1 + s2;
        assert!(err.abs() < 1e-45, "err = {err:e}");
    }

    #[test]
    fn sloppy_recip_of_three() {
        let (c0, c1, c2) = sloppy_recip(3.0, 0.0, 0.0);
        let (p0, p1, p2) = sloppy_prod(c0, c1, c2, 3.0, 0.0, 0.0);
        let err = (p0 - 1.0) + p1 + p2;
        assert!(err.abs() < 1e-45, "err = {err:e}");
    }

    #[test]
    fn sloppy_recip_extremes() {
        assert_eq!(0.0, sloppy_recip(f64::INFINITY, 0.0, 0.0).0);
        assert_eq!(f64::INFINITY, sloppy_recip(0.0, 0.0, 0.0).0);
        assert_eq!(f64::NEG_INFINITY, sloppy_recip(-0.0, 0.0, 0.0).0);
        assert!(sloppy_recip(f64::NAN, 0.0, 0.0).0.is_nan());
    }
}
