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

//! Compensated (Kahan-style) summation.
//!
//! An [Accumulator] tracks a running sum as a base value plus a correction
//! term holding the exact rounding error of every addition, which drops the
//! error of an n-term sum from O(n·eps) to O(eps).  The correction is kept
//! aside in the Neumaier arrangement rather than folded into the next addend,
//! so a tiny contribution survives even when the very next addend cancels the
//! base value outright.
//!
//! Because every per-step error is recovered exactly, reducing the same data
//! in any order (in particular, across any per-thread partition) yields
//! results within a few ulps of each other; this is what makes the parallel
//! reductions in this library schedule independent.

use super::core::two_sum;

/// A compensated scalar accumulator.
///
/// ```
/// # use spinmin::Accumulator;
/// let mut sum = Accumulator::default();
/// for _ in 0..1000 {
///     sum += 0.1;
/// }
/// assert!((sum.value() - 100.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    x: f64,
    corr: f64,
}

impl Accumulator {
    /// Starts the accumulator at `x` with no correction.
    #[inline]
    pub fn new(x: f64) -> Self {
        Accumulator { x, corr: 0.0 }
    }

    /// Resets to `x`, dropping any accumulated correction.
    #[inline]
    pub fn set(&mut self, x: f64) {
        self.x = x;
        self.corr = 0.0;
    }

    /// Adds `y`, retaining the rounding error of the addition exactly.
    #[inline]
    pub fn accum(&mut self, y: f64) {
        let (sum, err) = two_sum(self.x, y);
        self.x = sum;
        self.corr += err;
    }

    /// Folds another accumulator in, corrections first so they cannot be
    /// shadowed by the big parts.
    #[inline]
    pub fn accum_extended(&mut self, o: &Accumulator) {
        self.accum(o.corr);
        self.accum(o.x);
    }

    /// The best available estimate of the accumulated sum.
    #[inline]
    pub fn value(&self) -> f64 {
        self.x + self.corr
    }

    /// Both components, big part first.
    #[inline]
    pub fn parts(&self) -> (f64, f64) {
        (self.x, self.corr)
    }
}

impl From<f64> for Accumulator {
    #[inline]
    fn from(x: f64) -> Self {
        Accumulator::new(x)
    }
}

impl std::ops::AddAssign<f64> for Accumulator {
    #[inline]
    fn add_assign(&mut self, y: f64) {
        self.accum(y);
    }
}
impl std::ops::SubAssign<f64> for Accumulator {
    #[inline]
    fn sub_assign(&mut self, y: f64) {
        self.accum(-y);
    }
}
impl std::ops::AddAssign<&Accumulator> for Accumulator {
    #[inline]
    fn add_assign(&mut self, o: &Accumulator) {
        self.accum_extended(o);
    }
}
impl std::ops::AddAssign<Accumulator> for Accumulator {
    #[inline]
    fn add_assign(&mut self, o: Accumulator) {
        self.accum_extended(&o);
    }
}
impl std::ops::MulAssign<f64> for Accumulator {
    /// Scales both components.  Exact for powers of two; otherwise the
    /// correction keeps carrying its share of the error.
    #[inline]
    fn mul_assign(&mut self, y: f64) {
        self.x *= y;
        self.corr *= y;
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_accum {
    use super::*;

    #[test]
    fn tiny_contributions_survive_total_cancellation() {
        // The sequence 1, 1e-20, -1 repeated one million times: the naive
        // sum is 0.0, the compensated sum recovers 1e-14 exactly.
        let mut sum = Accumulator::default();
        for _ in 0..1_000_000 {
            sum += 1.0;
            sum += 1e-20;
            sum -= 1.0;
        }
        let expect = 1e-14;
        let err = (sum.value() - expect).abs();
        assert!(err <= 2.0 * f64::EPSILON * expect, "err = {err:e}");
    }

    #[test]
    fn partitioned_reduction_matches_serial_reduction() {
        // Sum the same awkward data serially and as two halves merged with
        // accum_extended; the results agree to the last few ulps.
        let data: Vec<f64> =
            (0..10_000).map(|i| (-1.0f64).powi(i) * (1.0 + i as f64).recip()).collect();
        let mut serial = Accumulator::default();
        for &v in &data {
            serial += v;
        }
        let mut lo = Accumulator::default();
        let mut hi = Accumulator::default();
        for &v in &data[..5_000] {
            lo += v;
        }
        for &v in &data[5_000..] {
            hi += v;
        }
        lo += &hi;
        let diff = (serial.value() - lo.value()).abs();
        assert!(diff <= 4.0 * f64::EPSILON * serial.value().abs(), "diff = {diff:e}");
    }

    #[test]
    fn scaling_scales_both_components() {
        let mut sum = Accumulator::new(1.0);
        sum += 1e-20;
        sum *= 4.0;
        assert_eq!(4.0, sum.parts().0);
        assert_eq!(4e-20, sum.parts().1);
    }
}
