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

//! Transcendental functions on [DoubleDouble]: sin/cos with full-range angle
//! reduction, exp/expm1, log/log1p and atan/atan2.
//!
//! The published error bound is 1 ulp of the 107 bit format.  Intermediate
//! work runs in triple-double, with argument reductions carried against
//! multi-chunk decompositions of 1/(2 pi), pi/2 and log 2 so the bound holds
//! across the whole representable range, not just near the origin.

use super::core::*;
use super::doubledouble::{DoubleDouble, HIRES_LOG2, HIRES_LOG2_MANT, HIRES_PI};
use super::triple::*;

// ----------------------------------------------------------------------------
// --- ANGLE REDUCTION --------------------------------------------------------
// ----------------------------------------------------------------------------

const BLOCK_START: i32 = -29; // Offset of first block
const BLOCK_SIZE: i32 = 27; // Bits per block in the 1/(2 pi) decomposition
const BLOCK_COUNT: usize = 64;
const BLOCK_SCALE: f64 = 1.0 / POW_2_MANTISSA_HALF; // 2^-block_size
const START_SCALE: f64 = BLOCK_SCALE / 4.0; // 2^block_start

/// Split of 1/(2 pi) into 64 parts of 27 bits each; relative error of the
/// full expansion is about 1e-520.  Term j is scaled by 2^(-29 - j*27).
#[rustfmt::skip]
static INVTWOPI: [f64; BLOCK_COUNT] = [
     85445659.0,   60002565.0,   39057486.0,   92086099.0,
     40820845.0,   92952164.0,  126382600.0,   33444195.0,
     90109406.0,   22572489.0,   14447748.0,   81604096.0,
     52729717.0,    2573896.0,   60801981.0,   52212009.0,
     87684932.0,    9272651.0,   91654409.0,  110741250.0,
     56242111.0,   17098311.0,   46608490.0,   54129820.0,
     69401693.0,  125717006.0,  104853807.0,  134078553.0,
     67630999.0,   71708008.0,   21865453.0,   87457487.0,
     20863053.0,   97767823.0,  114113727.0,  111335250.0,
     64840693.0,  127387116.0,  127985470.0,  126505618.0,
    122904538.0,  132925411.0,   45748396.0,    3343471.0,
    104707541.0,  130236144.0,   68378246.0,  102607331.0,
     76221175.0,   25608729.0,   53676734.0,   21628548.0,
      4653036.0,   33633740.0,   82190528.0,  102061770.0,
     60638795.0,    3710704.0,   18405007.0,   71408694.0,
     65465972.0,    2402829.0,   54038225.0,   60169382.0,
];

/// Split of pi/2 into 32 parts of 27 bits each, used by the small-angle
/// subtraction reduction.
#[rustfmt::skip]
static HALFPI_CHUNKS: [f64; 32] = [
    ldx(105414357.0,  -26), ldx(  8935984.0,  -53),
    ldx( 74025356.0,  -80), ldx(103331853.0, -107),
    ldx(101607572.0, -134), ldx( 67713058.0, -161),
    ldx( 21821838.0, -188), ldx( 67242942.0, -215),
    ldx( 87152796.0, -242), ldx(113808466.0, -269),
    ldx( 68219676.0, -296), ldx( 54545886.0, -323),
    ldx(130714841.0, -350), ldx(120908044.0, -377),
    ldx( 57017697.0, -404), ldx( 40759903.0, -431),
    ldx( 10599039.0, -458), ldx(  5069659.0, -485),
    ldx( 44270731.0, -512), ldx(105405271.0, -539),
    ldx( 53555007.0, -566), ldx( 52154673.0, -593),
    ldx(  6108358.0, -620), ldx(132999947.0, -647),
    ldx(133883319.0, -674), ldx( 83996155.0, -701),
    ldx( 64778455.0, -728), ldx(129345689.0, -755),
    ldx(131258191.0, -782), ldx( 76563953.0, -809),
    ldx( 23329993.0, -836), ldx( 19424849.0, -863),
];

/// Reduces `angle` modulo pi/2 with a *centered* quadrant: the returned
/// triple satisfies `|r0| <= pi/4` and
/// `angle = r + quadrant*(pi/2) + m*(2 pi)` for some integer m.
///
/// No handling for non-finite inputs; this is internal machinery and its
/// wrappers screen first.
fn circle_reduce(angle: &DoubleDouble) -> (f64, f64, f64, i32) {
    let a0 = angle.hi;
    let a1 = angle.lo;

    if a0.abs() < HIRES_PI[0] / 4.0
        || (a0 == -HIRES_PI[0] / 4.0 && a1 > -HIRES_PI[1] / 4.0)
        || (a0 == HIRES_PI[0] / 4.0
            && (a1 < HIRES_PI[1] / 4.0 || (a1 == HIRES_PI[1] / 4.0 && 0.0 <= HIRES_PI[2])))
    {
        // Already centered in quadrant 0.
        return (a0, a1, 0.0, 0);
    }

    if a0.abs() <= 1e8 {
        // Reduce by subtraction, quicker and a touch more accurate for small
        // angles since no triple-double product is needed at the end.
        let mut p0 = a0;
        let mut p1 = a1;
        let mut p2 = 0.0;
        let mut m = (0.5 + 2.0 * p0 / HIRES_PI[0]).floor();

        // Extract the quadrant before negating the multiplier.
        let mut quadrant = (m - 4.0 * (0.25 * m).trunc()) as i32;
        if quadrant < 0 {
            quadrant += 4;
        }

        // Subtract m*(pi/2) chunk by chunk.
        m = -m;

        // m and the chunks are half-width, so each product is exact; the
        // first sum is exact too because the lead term nearly cancels p0.
        let t0 = m * HALFPI_CHUNKS[0];
        p0 += t0;
        let (q0, q1) = ordered_two_sum(p0, p1);
        p0 = q0;
        p1 = q1;

        let t0 = m * HALFPI_CHUNKS[1];
        let (r0, t0) = two_sum(p0, t0);
        let (r1, r2) = two_sum(p1, t0);
        let (r0, r1) = ordered_two_sum(r0, r1);
        let (r1, r2) = ordered_two_sum(r1, r2);
        p0 = r0;
        p1 = r1;
        p2 = p2 + r2;

        let block = 2.0 * POW_2_MANTISSA * BLOCK_SCALE;
        let mut checkval = block * block * block * m.abs();
        for chunk in &HALFPI_CHUNKS[2..] {
            let t0 = m * chunk;
            let (q0, t0) = two_sum(p0, t0);
            let (q1, t0) = two_sum(p1, t0);
            p0 = q0;
            p1 = q1;
            p2 += t0;
            let (q0, q1) = ordered_two_sum(p0, p1);
            let (q1, q2) = ordered_two_sum(q1, p2);
            p0 = q0;
            p1 = q1;
            p2 = q2;
            if p0.abs() > checkval {
                break;
            }
            checkval *= BLOCK_SCALE;
        }

        // The multiplier was picked off the high word only, so the remainder
        // can hang one half-quadrant over; pull it back.
        if p0 > HIRES_PI[0] / 4.0
            || (p0 == HIRES_PI[0] / 4.0 && p1 > HIRES_PI[1] / 4.0)
            || (p0 == HIRES_PI[0] / 4.0 && p1 == HIRES_PI[1] / 4.0 && p2 > HIRES_PI[2] / 4.0)
        {
            p0 -= HIRES_PI[0] / 2.0; // Exact
            let (q1, ptmp) = two_sum(p1, -HIRES_PI[1] / 2.0);
            p1 = q1;
            p2 += ptmp - HIRES_PI[2] / 2.0;
            quadrant += 1;
            if quadrant > 3 {
                quadrant -= 4;
            }
        } else if p0 < -HIRES_PI[0] / 4.0
            || (p0 == -HIRES_PI[0] / 4.0 && p1 < -HIRES_PI[1] / 4.0)
            || (p0 == -HIRES_PI[0] / 4.0 && p1 == -HIRES_PI[1] / 4.0 && p2 <= -HIRES_PI[2] / 4.0)
        {
            p0 += HIRES_PI[0] / 2.0; // Exact
            let (q1, ptmp) = two_sum(p1, HIRES_PI[1] / 2.0);
            p1 = q1;
            p2 += ptmp + HIRES_PI[2] / 2.0;
            quadrant -= 1;
            if quadrant < 0 {
                quadrant += 4;
            }
        }

        return (p0, p1, p2, quadrant);
    }

    // Large angles: multiply by 1/(2 pi), computing only the fractional part
    // of the product, extended chunk by chunk until triple-double precision
    // is reached.  Split both words into half-width integer pieces so every
    // chunk product is exact.
    let (a0_mant, a0_exp) = frexp(a0);
    let (a1_mant, a1_exp) = frexp(a1);
    let (x0, x1) = split(a0_mant);
    let (x2, x3) = split(a1_mant);

    let x1_exp = a0_exp - MANTISSA_PRECISION;
    let x0_exp = a0_exp - (MANTISSA_PRECISION + 1) / 2;
    let offblk1 = (x1_exp + BLOCK_START + BLOCK_SIZE) / BLOCK_SIZE;
    let offblk0 = (x0_exp + BLOCK_START + BLOCK_SIZE) / BLOCK_SIZE;
    debug_assert!(offblk1 >= -2 && offblk0 >= -1);
    debug_assert!((offblk0 + 8) as usize <= BLOCK_COUNT);

    let x3_exp = a1_exp - MANTISSA_PRECISION;
    let x2_exp = a1_exp - (MANTISSA_PRECISION + 1) / 2;
    let offblk3 = (x3_exp + BLOCK_START + BLOCK_SIZE) / BLOCK_SIZE;
    let offblk2 = (x2_exp + BLOCK_START + BLOCK_SIZE) / BLOCK_SIZE;

    let x0 = xp_ldexp(x0, x0_exp - offblk0 * BLOCK_SIZE + (MANTISSA_PRECISION + 1) / 2);
    let x1 = xp_ldexp(x1, x1_exp - offblk1 * BLOCK_SIZE + MANTISSA_PRECISION);
    let x2 = xp_ldexp(x2, x2_exp - offblk2 * BLOCK_SIZE + (MANTISSA_PRECISION + 1) / 2);
    let x3 = xp_ldexp(x3, x3_exp - offblk3 * BLOCK_SIZE + MANTISSA_PRECISION);

    // Discard the integer part of each product as it appears: only the
    // fraction matters, and the discard keeps every partial sum exact.
    let drop_int = |v: f64, positive: bool| {
        if positive {
            v - v.floor()
        } else {
            v - v.ceil()
        }
    };

    let mut p0 = 0.0;
    let mut p1 = 0.0;
    let mut p2 = 0.0;

    let chunk = |off: i32, i: i32| INVTWOPI[(off + i) as usize];

    if offblk0 >= 0 {
        p0 = x0 * START_SCALE * chunk(offblk0, 0);
    }
    if offblk0 + 1 >= 0 {
        p1 = x0 * START_SCALE * BLOCK_SCALE * chunk(offblk0, 1);
        p0 = drop_int(p0, x0 >= 0.0);
        p1 = drop_int(p1, x0 >= 0.0);
        let (q0, q1) = two_sum(p0, p1);
        p0 = q0;
        p1 = q1;
    }

    let fold = |p0: &mut f64, p1: &mut f64, p2: &mut f64, t: f64| {
        let (q0, t) = two_sum(*p0, t);
        let (q1, t) = two_sum(*p1, t);
        *p0 = q0;
        *p1 = q1;
        *p2 += t;
    };

    if offblk1 + 1 >= 0 {
        let mut t0 = if offblk1 >= 0 { x1 * START_SCALE * chunk(offblk1, 0) } else { 0.0 };
        let mut t1 = x1 * START_SCALE * BLOCK_SCALE * chunk(offblk1, 1);
        t0 = drop_int(t0, x1 >= 0.0);
        t1 = drop_int(t1, x1 >= 0.0);
        fold(&mut p0, &mut p1, &mut p2, t0);
        fold(&mut p0, &mut p1, &mut p2, t1);
    }
    if offblk2 + 1 >= 0 {
        let mut t0 = if offblk2 >= 0 { x2 * START_SCALE * chunk(offblk2, 0) } else { 0.0 };
        let mut t1 = x2 * START_SCALE * BLOCK_SCALE * chunk(offblk2, 1);
        t0 = drop_int(t0, x2 >= 0.0);
        t1 = drop_int(t1, x2 >= 0.0);
        fold(&mut p0, &mut p1, &mut p2, t0);
        fold(&mut p0, &mut p1, &mut p2, t1);
    }
    if offblk3 + 1 >= 0 {
        let mut t0 = if offblk3 >= 0 { x3 * START_SCALE * chunk(offblk3, 0) } else { 0.0 };
        let mut t1 = x3 * START_SCALE * BLOCK_SCALE * chunk(offblk3, 1);
        t0 = drop_int(t0, x3 >= 0.0);
        t1 = drop_int(t1, x3 >= 0.0);
        fold(&mut p0, &mut p1, &mut p2, t0);
        fold(&mut p0, &mut p1, &mut p2, t1);
    }

    if p0.abs() > 0.5 {
        p0 -= p0.floor();
        if p0 > 0.5 {
            p0 -= 1.0;
        }
    }

    // The multiplication so far is by 1/(2 pi).  Shift to 1/(pi/2) and pull
    // the quadrant out now so it cannot pollute the low order bits.
    p0 *= 4.0;
    p1 *= 4.0;
    p2 *= 4.0;
    let mut quadrant: i32 = 0;
    if p0.abs() > 0.5 {
        let fq = p0.floor();
        quadrant = fq as i32;
        p0 -= fq;
        if p0 > 0.5 {
            p0 -= 1.0;
            quadrant += 1;
        }
    }
    let (q0, q1) = ordered_two_sum(p0, p1);
    let (q1, q2) = ordered_two_sum(q1, p2);
    p0 = q0;
    p1 = q1;
    p2 = q2;

    let half_block = POW_2_MANTISSA_HALF;
    let checkval = half_block * half_block * half_block * half_block
        * half_block * half_block * half_block * half_block
        / (4.0 * START_SCALE);

    let mut scale = 4.0 * BLOCK_SCALE * BLOCK_SCALE * START_SCALE;
    let mut i: i32 = 2;
    while p0.abs() < checkval * scale && ((offblk0 + i) as usize) < BLOCK_COUNT {
        // offblk0 and offblk1 are >= -2, so offblk{0,1}+i are in range.
        let ta = x0 * chunk(offblk0, i) * scale;
        fold(&mut p0, &mut p1, &mut p2, ta);
        let tb = x1 * chunk(offblk1, i) * scale;
        fold(&mut p0, &mut p1, &mut p2, tb);
        if offblk2 + i >= 0 {
            let tc = x2 * chunk(offblk2, i) * scale;
            fold(&mut p0, &mut p1, &mut p2, tc);
        }
        if offblk3 + i >= 0 {
            let td = x3 * chunk(offblk3, i) * scale;
            fold(&mut p0, &mut p1, &mut p2, td);
        }

        if p0.abs() > 0.5 {
            let fq = p0.floor();
            quadrant += fq as i32;
            p0 -= fq; // Exact
            if p0 > 0.5 {
                p0 -= 1.0; // Exact
                quadrant += 1;
            }
        }

        let (q0, q1) = ordered_two_sum(p0, p1);
        let (q1, q2) = ordered_two_sum(q1, p2);
        p0 = q0;
        p1 = q1;
        p2 = q2;

        scale *= BLOCK_SCALE;
        i += 1;
    }

    // Boundary cases on the half-quadrant edge.
    if p0 == 0.5 && p1 > 0.0 {
        p0 -= 1.0;
        quadrant += 1;
    } else if p0 == -0.5 && p1 <= 0.0 {
        p0 += 1.0;
        quadrant -= 1;
    }

    quadrant %= 4;
    if quadrant < 0 {
        quadrant += 4;
    }

    // (p0,p1,p2) is now the fractional part of angle/(pi/2); the final
    // product by pi/2 dominates the total error of the reduction.
    let (r0, r1, r2) = sloppy_prod(
        p0, p1, p2,
        0.5 * HIRES_PI[0], 0.5 * HIRES_PI[1], 0.5 * HIRES_PI[2],
    );
    debug_assert!(r0.abs() <= HIRES_PI[0] / 4.0);
    (r0, r1, r2, quadrant)
}

// ----------------------------------------------------------------------------
// --- SIN / COS --------------------------------------------------------------
// ----------------------------------------------------------------------------

/// Triple-double sin and cos, for internal use.  Exports carry a third word
/// each so downstream Newton corrections can exceed double-double accuracy.
fn sin_cos_wide(angle: &DoubleDouble) -> ((f64, f64, f64), (f64, f64, f64)) {
    if !angle.hi.is_finite() {
        let n = f64::NAN;
        return ((n, n, n), (n, n, n));
    }

    let (r0, r1, r2, quadrant) = if angle.hi.abs() < HIRES_PI[0] / 4.0 {
        // Built into circle_reduce, but testing here skips the call in the
        // common case.
        (angle.hi, angle.lo, 0.0, 0)
    } else {
        circle_reduce(angle)
    };

    let sinb;
    let cosb;
    if r0.abs() < CUBEROOT_VERYTINY {
        // r^2 underflows, so the mainline series is rubbish; only the lead
        // terms of the direct series survive in floating point.
        sinb = (r0, r1, r2);
        let (c1, c2, _) = sloppy_square(r0, r1, r2);
        cosb = (1.0, -0.5 * c1, -0.5 * c2);
    } else {
        // Scale down until |r|^14/14! drops below the double-double noise
        // floor of the r^2 lead term.
        const CHECKVAL: f64 = 8e-3;
        let mut r0 = r0;
        let mut r1 = r1;
        let mut r2 = r2;
        let mut kreduction = 0;
        while r0.abs() > 8.0 * CHECKVAL {
            r0 *= 0.0625;
            r1 *= 0.0625;
            r2 *= 0.0625;
            kreduction += 4;
        }
        while r0.abs() > CHECKVAL {
            r0 *= 0.5;
            r1 *= 0.5;
            r2 *= 0.5;
            kreduction += 1;
        }

        // 1 - cos(r) by the standard series through r^12.  The early terms
        // only need single-double precision.
        let (rsq0, rsq1, rsq2) = sloppy_square(r0, r1, r2);
        let rsq = DoubleDouble::raw(rsq0, rsq1);
        let mut ssum = rsq0;
        ssum /= -12.0 * 11.0;
        ssum += 1.0;
        ssum *= rsq0;
        ssum /= 10.0 * 9.0;
        let mut sum = DoubleDouble::from(ssum);
        sum = sum - 1.0;
        sum = sum * rsq;
        sum = sum / (8.0 * 7.0);
        sum = sum + 1.0;
        sum = sum * rsq;
        sum = sum / (6.0 * 5.0);
        sum = sum - 1.0;
        sum = sum * rsq;
        sum = sum / (4.0 * 3.0);
        // Last two steps in triple-double to wring out the final bits.
        let (s0, s1, s2) = sloppy_prod(sum.hi, sum.lo, 0.0, rsq0, rsq1, rsq2);
        let (s0, s1, s2) = three_sum(s0, s1, s2, rsq0, rsq1, rsq2);
        let mut s0 = s0 * 0.5;
        let mut s1 = s1 * 0.5;
        let mut s2 = s2 * 0.5;

        // Unscale with cos(2x) - 1 = 2*(cos(x)-1)^2 + 4*(cos(x)-1).
        for _ in 0..kreduction {
            let (t0, t1, t2) = sloppy_square(s0, s1, s2);
            let (u0, u1, u2) = three_sum(
                4.0 * s0, 4.0 * s1, 4.0 * s2,
                -2.0 * t0, -2.0 * t1, -2.0 * t2,
            );
            s0 = u0;
            s1 = u1;
            s2 = u2;
        }

        cosb = three_sum(1.0, 0.0, 0.0, -s0, -s1, -s2);
        // sin = sqrt(2s - s^2) where s = 1 - cos(r).
        let (q0, q1, q2) = sloppy_square(s0, s1, s2);
        let (b0, b1, b2) =
            three_sum(2.0 * s0, 2.0 * s1, 2.0 * s2, -q0, -q1, -q2);
        if b0 <= 0.0 {
            sinb = (0.0, 0.0, 0.0);
        } else {
            let (c0, c1, c2) = sloppy_sqrt(b0, b1, b2);
            if r0 < 0.0 {
                sinb = (-c0, -c1, -c2);
            } else {
                sinb = (c0, c1, c2);
            }
        }
    }

    // Quadrant fixup from the angle-sum formulae with a = m*(pi/2).
    match quadrant {
        0 => (sinb, cosb),
        1 => (cosb, (-sinb.0, -sinb.1, -sinb.2)),
        2 => ((-sinb.0, -sinb.1, -sinb.2), (-cosb.0, -cosb.1, -cosb.2)),
        _ => ((-cosb.0, -cosb.1, -cosb.2), sinb),
    }
}

// ----------------------------------------------------------------------------
// --- EXP BASE ---------------------------------------------------------------
// ----------------------------------------------------------------------------

/// Base computation for exp and expm1: reduces the input to
/// `x = m*log 2 + r` with `|r| <= 0.5 log 2` and returns
/// `(exp(r) - 1, m)` as a triple plus scaling.  The 2^m unscaling is left to
/// the callers because they need to fold it differently.
fn exp_base(inval: &DoubleDouble) -> ((f64, f64, f64), i32) {
    const MAX_INVAL: f64 = 709.78271289338409;
    const MIN_INVAL: f64 = -745.13321910194134;

    if inval.hi >= MAX_INVAL {
        // Values just under MAX_INVAL may still overflow once scaled; the
        // caller handles that border.
        let inf = f64::INFINITY;
        return ((inf, inf, inf), 0);
    }
    if inval.hi <= MIN_INVAL {
        return ((-1.0, 0.0, 0.0), 0);
    }
    if inval.hi == 0.0 {
        return ((0.0, 0.0, 0.0), 0);
    }

    // Break x = m*log2 + r against the three-term log 2 expansion.
    let m = (0.5 + inval.hi / HIRES_LOG2[0]).floor();
    let (tr0a, tr0b) = two_prod(m, HIRES_LOG2[0]);
    let (tr1a, tr1b) = two_prod(m, HIRES_LOG2[1]);
    let mut tr2 = m * HIRES_LOG2[2];
    let r0 = inval.hi - tr0a; // 1/2 <= |r0/tr0a| <= 2, so exact
    let (tr0b, tr1a) = two_sum(tr0b, tr1a);
    tr2 += tr1a + tr1b;
    let (r1, mut r_a2) = two_sum(inval.lo, -tr0b);
    let (mut r0, mut r1) = two_sum(r0, r1);
    r_a2 -= tr2;
    // The ordered sums shift zeros out of r, which matters when the input is
    // close to an integral multiple of log 2.
    let (q1, mut r2) = ordered_two_sum(r1, r_a2);
    let (q0, q1) = ordered_two_sum(r0, q1);
    r0 = q0;
    r1 = q1;
    debug_assert!(r0.abs() < 0.347);

    // Halve into fast series convergence range.
    const CHECKVAL: f64 = 0.0034;
    let mut kreduction = 0;
    while r0.abs() > 16.0 * CHECKVAL {
        r0 /= 16.0;
        r1 /= 16.0;
        r2 /= 16.0;
        kreduction += 4;
    }
    while r0.abs() > CHECKVAL {
        r0 /= 2.0;
        r1 /= 2.0;
        r2 /= 2.0;
        kreduction += 1;
    }

    let mut sum;
    if r0.abs() < f64::EPSILON * f64::EPSILON * f64::EPSILON / 8.0 {
        // Only the first series term has any floating-point impact.
        sum = (r0, r1, r2);
    } else {
        // sinh series through r^11; the early terms need only single-double.
        let (rsq0, rsq1, rsq2) = sloppy_square(r0, r1, r2);
        let rsq = DoubleDouble::raw(rsq0, rsq1);
        let mut s0 = rsq0 / (10.0 * 11.0);
        s0 += 1.0;
        s0 *= rsq0;
        s0 /= 8.0 * 9.0;
        let mut s = DoubleDouble::from(s0);
        s = s + 1.0;
        s = s * rsq;
        s = s / (6.0 * 7.0);
        s = s + 1.0;
        s = s * rsq;
        s = s / (4.0 * 5.0);
        s = s + 1.0;
        s = s * rsq;
        s = s / (3.0 * 2.0);
        let (s0, s1, s2) = sloppy_prod(s.hi, s.lo, 0.0, r0, r1, r2);
        let (s0, s1, s2) = three_sum(s0, s1, s2, r0, r1, r2);
        // s is now sinh(r); convert:
        // exp(r) - 1 = sinh(r) + sinh^2(r)/(1 + sqrt(1 + sinh^2(r)))
        let (t10, t11, t12) = sloppy_square(s0, s1, s2);
        let t1 = DoubleDouble::raw(t10, t11);
        let mut t2 = t1 + 1.0;
        t2 = t2.sqrt();
        t2 = t2 + 1.0;
        let q = t1 / t2; // First quotient approximation
        let q_a2 = t12 / t2.hi;
        // One Newton step to polish the quotient: solve Q^2 + 2Q = sinh^2.
        let (big_t0, big_t1, big_t2) = sloppy_square(q.hi, q.lo, q_a2);
        let (big_t0, big_t1, big_t2) =
            three_sum(big_t0, big_t1, big_t2, 2.0 * q.hi, 2.0 * q.lo, 2.0 * q_a2);
        debug_assert!(t10 == big_t0 || (t10 - big_t0).abs() <= t10.abs() * f64::EPSILON);
        let d1 = t11 - big_t1;
        let d2 = t12 - big_t2;
        let q_a2 = q_a2 + (d1 + d2) / (2.0 * (1.0 + q.hi));
        sum = three_sum(s0, s1, s2, q.hi, q.lo, q_a2);
    }

    // Unscale: expm1(2r) = 2*expm1(r) + expm1(r)^2.
    for _ in 0..kreduction {
        let (z0, z1, z2) = sloppy_square(sum.0, sum.1, sum.2);
        sum = three_sum(2.0 * sum.0, 2.0 * sum.1, 2.0 * sum.2, z0, z1, z2);
    }

    (sum, m as i32)
}

// ----------------------------------------------------------------------------
// --- PUBLIC SURFACE ---------------------------------------------------------
// ----------------------------------------------------------------------------

/// Exponent floor used by exp's underflow-protected scaling branch.
const TINY_EXP: i32 = -1021;

impl DoubleDouble {
    /// Reduces self into `[-pi, pi]`, exactly enough that a follow-up
    /// [Self::sin_cos] stays within its 1 ulp bound for any finite input.
    pub fn reduce_mod_two_pi(self) -> Self {
        if !self.hi.is_finite() {
            return DoubleDouble::raw(f64::NAN, f64::NAN);
        }
        if self.hi.abs() < HIRES_PI[0] {
            return self;
        }
        // circle_reduce works modulo pi/2; prescaling by 1/4 and postscaling
        // by 4 turns it into a mod 2 pi reduction.  The range check above
        // protects the prescale from underflow.
        let tmp = DoubleDouble::raw(self.hi * 0.25, self.lo * 0.25);
        let (r0, r1, _r2, _quad) = circle_reduce(&tmp);
        DoubleDouble::raw(4.0 * r0, 4.0 * r1)
    }

    /// Simultaneous sine and cosine.  |error| <= 1 ulp each.
    pub fn sin_cos(&self) -> (DoubleDouble, DoubleDouble) {
        let (s, c) = sin_cos_wide(self);
        (
            DoubleDouble::from_parts(s.0, s.1 + s.2),
            DoubleDouble::from_parts(c.0, c.1 + c.2),
        )
    }

    /// Sine.  |error| <= 1 ulp.
    pub fn sin(&self) -> DoubleDouble {
        self.sin_cos().0
    }

    /// Cosine.  |error| <= 1 ulp.
    pub fn cos(&self) -> DoubleDouble {
        self.sin_cos().1
    }

    /// Exponential.  |error| <= 1 ulp.
    pub fn exp(&self) -> DoubleDouble {
        if !self.hi.is_finite() {
            return if self.hi == f64::NEG_INFINITY {
                DoubleDouble::ZERO
            } else {
                DoubleDouble::raw(self.hi, self.hi)
            };
        }

        let ((y0, y1, y2), m) = exp_base(self);
        // If the result is finite then -0.293 < y < 0.42.

        if m == VERYTINY_EXP - 1 && y0 > 0.0 {
            // Below the smallest subnormal but rounds up to it.
            return DoubleDouble::raw(xp_ldexp(1.0, VERYTINY_EXP), 0.0);
        }
        if !y0.is_finite() {
            return DoubleDouble::raw(y0, y0);
        }
        let (y0, y1, y2) = three_increment(y0, y1, y2, 1.0);
        if m < HUGE_EXP {
            if m >= TINY_EXP + 2 + MANTISSA_PRECISION + 14 {
                // The 14 allows for non-adjacent words; below this threshold
                // underflow could round between the components.
                let scale = xp_ldexp(1.0, m);
                DoubleDouble::raw(y0 * scale, y1 * scale)
            } else {
                // Extract any underflow rounding error and put it back as a
                // single word.  Prescaling by 2^p keeps 2^(m+p) from
                // flushing to zero.
                let scale = xp_ldexp(1.0, m + MANTISSA_PRECISION);
                let inv = 1.0 / POW_2_MANTISSA;
                let (hi, lo) = rescale3(y0 * inv, y1 * inv, y2 * inv, scale);
                DoubleDouble::raw(hi, lo)
            }
        } else {
            let hi = xp_ldexp(y0, m);
            let lo = if hi.is_finite() { xp_ldexp(y1, m) } else { hi };
            DoubleDouble::raw(hi, lo)
        }
    }

    /// `exp(self) - 1`.  |error| <= 1 ulp.
    pub fn exp_m1(&self) -> DoubleDouble {
        if !self.hi.is_finite() {
            return if self.hi == f64::NEG_INFINITY {
                DoubleDouble::raw(-1.0, 0.0)
            } else {
                DoubleDouble::raw(self.hi, self.hi)
            };
        }

        let ((y0, y1, y2), m) = exp_base(self);
        if m == 0 {
            return DoubleDouble::from_parts(y0, y1 + y2);
        }

        if m > 2 * MANTISSA_PRECISION + 20 {
            // (y+1)*2^m dominates: the trailing -1 only nudges the low word.
            // m > 1, so shaving one power off the scale protects against
            // overflow at m = HUGE_EXP without risking underflow.
            let (y0, y1, _y2) = three_increment(y0, y1, y2, 1.0);
            let shavedscale = xp_ldexp(1.0, m - 1);
            let mut hi = y0 * 2.0;
            let mut lo = y1 * shavedscale;
            hi *= shavedscale;
            lo = 2.0 * lo - 1.0;
            if !hi.is_finite() {
                lo = hi;
            }
            return DoubleDouble::raw(hi, lo);
        }

        let scale = xp_ldexp(1.0, m);

        if m < -MANTISSA_PRECISION - 1 {
            // The -1 dominates; only the high word of y+1 matters.
            let y = DoubleDouble::raw(y0, y1) + DoubleDouble::ONE;
            return DoubleDouble::raw(-1.0, y.hi * scale);
        }

        // Moderate |m|: compute ((1 - 2^-m) + y) * 2^m in one triple sum.
        let adj = DoubleDouble::from_parts(1.0, -1.0 / scale); // Overflow not possible
        let (y0, y1, _y2) = three_sum(y0, y1, y2, adj.hi, adj.lo, 0.0);
        DoubleDouble::raw(y0 * scale, y1 * scale)
    }

    /// Natural logarithm.  |error| <= 1 ulp.
    pub fn ln(&self) -> DoubleDouble {
        if !(f64::MIN_POSITIVE <= self.hi && self.hi <= f64::MAX) {
            if self.hi < 0.0 {
                return DoubleDouble::raw(f64::NAN, f64::NAN);
            } else if !self.hi.is_finite() {
                return *self; // +Inf or NaN
            } else if self.hi == 0.0 {
                return DoubleDouble::raw(f64::NEG_INFINITY, f64::NEG_INFINITY);
            }

            // Subnormal: scale up by 2^p and subtract p*log 2 at the end.
            // The low word of a subnormal is necessarily zero.
            let ia0 = self.hi * POW_2_MANTISSA;
            let x0 = ia0.ln();
            let ((h0, h1, h2), m) = exp_base(&DoubleDouble::from(-x0));
            let ia0 = xp_ldexp(ia0, m);

            let (h0, h1, h2) = three_increment(h0, h1, h2, 1.0);
            let (h0, h1, h2) = sloppy_prod(h0, h1, h2, ia0, 0.0, 0.0);
            let (h0, h1, h2) = three_increment(h0, h1, h2, -1.0);

            let hsq = h0 * h0;
            let (h0, h1, h2) = three_sum(
                h0, h1, h2,
                -HIRES_LOG2_MANT[0], -HIRES_LOG2_MANT[1], -HIRES_LOG2_MANT[2],
            );
            let (h0, h1, h2) = three_increment(h0, h1, h2, -0.5 * hsq);
            let (h0, h1, _h2) = three_increment(h0, h1, h2, x0);
            return DoubleDouble::from_parts(h0, h1);
        }

        // Seed from the native log, then one Newton step through exp and a
        // Halley correction -0.5*delta^2.
        let x0 = self.hi.ln();
        let ((h0, h1, h2), m) = exp_base(&DoubleDouble::from(-x0));
        // -HUGE_EXP <= m <= -TINY_EXP here, so 2^m is representable.
        let scale = xp_ldexp(1.0, m);
        let ia0 = self.hi * scale;
        let ia1 = self.lo * scale;

        let (h0, h1, h2) = three_increment(h0, h1, h2, 1.0);
        let (h0, h1, h2) = sloppy_prod(h0, h1, h2, ia0, ia1, 0.0);

        let (h0, scratch) = two_sum(h0, -1.0);
        let h1 = h1 + scratch;
        let (h0, h1) = ordered_two_sum(h0, h1);
        let h1 = h1 + h2;

        let hsq = h0 * h0;
        let (h0, c) = two_sum(h0, -0.5 * hsq);
        let h1 = h1 + c;

        let (h0, c) = two_sum(h0, x0);
        DoubleDouble::from_parts(h0, h1 + c)
    }

    /// `ln(1 + self)`.  |error| <= 1 ulp.
    pub fn ln_1p(&self) -> DoubleDouble {
        // Past this headroom log1p is indistinguishable from log.
        const HEADROOM: f64 = 256.0 * POW_2_MANTISSA * POW_2_MANTISSA;

        if !(-1.0 + f64::EPSILON <= self.hi && self.hi <= HEADROOM) {
            if self.hi > HEADROOM {
                return self.ln();
            }
            if self.hi < -1.0 || (self.hi == -1.0 && self.lo < 0.0) {
                return DoubleDouble::raw(f64::NAN, f64::NAN);
            }
            if !self.hi.is_finite() {
                return *self; // +Inf or NaN
            }
            if self.hi == -1.0 && self.lo == 0.0 {
                return DoubleDouble::raw(f64::NEG_INFINITY, f64::NEG_INFINITY);
            }
            if self.hi == -1.0 {
                // The seed below would produce -Inf although the true value
                // is finite (self.lo > 0 here); hand over to ln.
                return DoubleDouble::from(self.lo).ln();
            }
        }

        // Seed with the standard accurate-log1p trick on the high word.
        let t = 1.0 + self.hi;
        let y0 = t - 1.0;
        let x0 = if y0 != 0.0 { t.ln() / y0 * self.hi } else { self.hi };

        // Newton correction through exp.
        let ((t0, t1, t2), m) = exp_base(&DoubleDouble::from(-x0));

        let (h0, h1, _h2) = if m == 0 {
            let (h0, h1, h2) = sloppy_prod(self.hi, self.lo, 0.0, t0, t1, t2);
            let (h0, h1, h2) = three_sum(h0, h1, h2, t0, t1, t2);
            three_sum(h0, h1, h2, self.hi, self.lo, 0.0)
        } else {
            // The range screen guarantees |m| < HUGE_EXP.
            let scale = xp_ldexp(1.0, m);
            let (t0, t1, t2) = three_increment(t0, t1, t2, 1.0);
            let (h0, h1, h2) =
                three_increment(self.hi * scale, self.lo * scale, 0.0, scale);
            let (h0, h1, h2) = sloppy_prod(h0, h1, h2, t0, t1, t2);
            three_increment(h0, h1, h2, -1.0)
        };

        // Halley correction.
        let hsq = h0 * h0;
        let (h0, c) = two_sum(h0, -0.5 * hsq);
        let h1 = h1 + c;

        // Fold the corrections into the seed.
        let (h0, c) = two_sum(h0, x0);
        DoubleDouble::from_parts(h0, h1 + c)
    }

    /// Arc tangent.  |error| <= 1 ulp.
    pub fn atan(&self) -> DoubleDouble {
        if self.hi.is_nan() {
            return DoubleDouble::raw(f64::NAN, f64::NAN);
        }
        if !(-1e40 <= self.hi && self.hi <= 1e40) {
            // Includes the infinities: the result saturates to +-pi/2 well
            // before the range limit.
            let mut r = DoubleDouble::raw(0.5 * HIRES_PI[0], 0.5 * HIRES_PI[1]);
            if self.hi < 0.0 {
                r = -r;
            }
            return r;
        }

        // pow(0.5, (dd_precision + 15)/6)
        const SMALL_CHECK: f64 = 9.53674316e-7;
        if self.hi.abs() < SMALL_CHECK {
            // Truncated series x - x^3/3 + x^5/5: faster and more accurate
            // than the seeded Newton path this close to zero.
            let xsq = self.square();
            let mut sum = 3.0 * xsq - DoubleDouble::from(5.0);
            sum = sum * xsq;
            sum = sum / 15.0;
            let (s0, s1, s2) = three_increment(sum.hi, sum.lo, 0.0, 1.0);
            let (s0, s1, _s2) = sloppy_prod(s0, s1, s2, self.hi, self.lo, 0.0);
            return DoubleDouble::from_parts(s0, s1);
        }

        // Modified Halley on the native seed.  For |x| > 1 the complementary
        // angle is computed instead: atan(x) = +-pi/2 - atan(1/x), realized
        // by swapping the roles of sin and cos below.
        let mut flip = false;
        let mut offset = (0.0, 0.0, 0.0);
        let mut x0;
        let sinx0;
        let cosx0;
        if self.hi.abs() <= 1.0 {
            x0 = self.hi.atan();
            let (s, c) = sin_cos_wide(&DoubleDouble::from(x0));
            sinx0 = s;
            cosx0 = c;
        } else {
            flip = true;
            x0 = (1.0 / self.hi).atan();
            offset = if self.hi > 0.0 {
                (0.5 * HIRES_PI[0], 0.5 * HIRES_PI[1], 0.5 * HIRES_PI[2])
            } else {
                (-0.5 * HIRES_PI[0], -0.5 * HIRES_PI[1], -0.5 * HIRES_PI[2])
            };
            let (s, c) = sin_cos_wide(&DoubleDouble::from(x0));
            // Swapped on purpose: the complementary identity turns the
            // correction for atan(1/x) into one for atan(x) directly.
            sinx0 = c;
            cosx0 = s;
            x0 = -x0;
        }

        // Newton step: delta = x*cos(x0) - sin(x0) needs a bit more than
        // double-double accuracy, the correction itself does not.
        let (d0, d1, d2) = sloppy_prod(self.hi, self.lo, 0.0, cosx0.0, cosx0.1, cosx0.2);
        let (d0, d1, _d2) = three_sum(d0, d1, d2, -sinx0.0, -sinx0.1, -sinx0.2);
        // Significant cancellation happens in that sum; the third component
        // ends up below what the double-double correction can use.

        let mut adj_a = DoubleDouble::raw(d0, d1) * DoubleDouble::raw(cosx0.0, cosx0.1);

        // Halley adjustment, single-double is plenty.
        let adj_b = -adj_a.hi * d0 * sinx0.0;
        adj_a = adj_a + adj_b;

        if !flip {
            let (r0, mut r1) = ordered_two_sum(x0, adj_a.hi);
            r1 += adj_a.lo;
            DoubleDouble::raw(r0, r1)
        } else {
            // Extra care carrying full accuracy through the +-pi/2 shift.
            let (r0, r1) = ordered_two_sum(x0, adj_a.hi);
            let (r1, r2) = ordered_two_sum(r1, adj_a.lo);
            let (r0, r1, _r2) =
                three_sum(offset.0, offset.1, offset.2, r0, r1, r2);
            DoubleDouble::from_parts(r0, r1)
        }
    }

    /// Four-quadrant arc tangent of `self / x`.  Slightly below the one
    /// argument accuracy: the division feeds rounded data into atan.
    pub fn atan2(&self, x: &DoubleDouble) -> DoubleDouble {
        let y = self;
        if y.hi.is_nan() || x.hi.is_nan() {
            return DoubleDouble::raw(f64::NAN, f64::NAN);
        }

        // Corner cases first.
        if y.hi == 0.0 && x.hi == 0.0 {
            return DoubleDouble::ZERO;
        }
        if y.hi == 0.0 {
            if x.hi > 0.0 {
                return *y; // Signed zero passes through
            }
            return DoubleDouble::PI;
        }
        if x.hi == 0.0 {
            return if y.hi > 0.0 { DoubleDouble::HALF_PI } else { -DoubleDouble::HALF_PI };
        }

        if y.hi.abs() <= x.hi.abs() {
            // Division won't be cranky.
            let result = (*y / *x).atan();
            if x.hi > 0.0 {
                return result; // atan answers in the right quadrant
            }
            if y.hi > 0.0 {
                return result + DoubleDouble::PI;
            }
            return result - DoubleDouble::PI;
        }

        // Otherwise invert the division and fold from +-pi/2.
        let base = if y.hi < 0.0 { -DoubleDouble::HALF_PI } else { DoubleDouble::HALF_PI };
        base - (*x / *y).atan()
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_transcendental {
    use super::*;

    fn ulps(a: &DoubleDouble, b: &DoubleDouble) -> f64 {
        a.compute_diff_ulp(b, b.ulp()).abs()
    }

    #[test]
    fn sincos_pythagoras_across_a_grid() {
        for i in -40..=40 {
            let x = DoubleDouble::from(0.37 * i as f64);
            let (s, c) = x.sin_cos();
            let err = s.square() + c.square() - DoubleDouble::ONE;
            assert!(
                err.hi().abs() < 8.0 * ldx(1.0, -107),
                "x = {}: sin^2+cos^2-1 = {:e}",
                0.37 * i as f64,
                err.hi()
            );
        }
    }

    #[test]
    fn sincos_known_values() {
        let (s, c) = DoubleDouble::HALF_PI.sin_cos();
        assert!(ulps(&s, &DoubleDouble::ONE) <= 1.0);
        // cos(pi/2 as a double-double) is the tiny tail of the pi expansion.
        assert!(c.hi().abs() < 1e-32);

        let (s, _) = (DoubleDouble::PI / 6.0).sin_cos();
        assert!(ulps(&s, &DoubleDouble::from(0.5)) <= 1.0, "sin(pi/6) = {s}");
    }

    #[test]
    fn sincos_large_argument_reduction() {
        // 63 * 2^50 forces the chunked 1/(2 pi) path; reference values from
        // an independent wide evaluation.
        let x = DoubleDouble::from(63.0 * ldx(1.0, 50));
        let sin_expect = DoubleDouble::raw(ldx(8700223823437620.0, -53), ldx(-7046851665223794.0, -110));
        let cos_expect = DoubleDouble::raw(ldx(4662936343848225.0, -54), ldx(4889264888245350.0, -109));
        let (s, c) = x.sin_cos();
        assert!(ulps(&s, &sin_expect) <= 1.0, "sin: {s}");
        assert!(ulps(&c, &cos_expect) <= 1.0, "cos: {c}");
    }

    #[test]
    fn reduce_mod_two_pi_brings_large_angles_home() {
        let big = DoubleDouble::from(1e12);
        let r = big.reduce_mod_two_pi();
        assert!(r.hi().abs() <= HIRES_PI[0] * 1.0000001);
        // The reduced angle has the same sine.
        let (s1, _) = big.sin_cos();
        let (s2, _) = r.sin_cos();
        assert!(ulps(&s1, &s2) <= 2.0);
        assert!(DoubleDouble::from(f64::INFINITY).reduce_mod_two_pi().hi().is_nan());
    }

    #[test]
    fn exp_of_log_round_trips() {
        for &v in &[0.125, 0.9, 1.0 + 1e-14, 3.5, 1e10, 1e-12, 700.0] {
            let x = DoubleDouble::from(v);
            let r = x.ln().exp();
            assert!(ulps(&r, &x) <= 4.0, "exp(ln({v})) off by {} ulp", ulps(&r, &x));
        }
    }

    #[test]
    fn log_of_exp_round_trips() {
        for &v in &[-100.0f64, -1.5, -1e-8, 0.25, 2.0, 100.0, 700.0] {
            let x = DoubleDouble::from(v);
            let r = x.exp().ln();
            let diff = (r - x).abs();
            let tol = DoubleDouble::from(4.0 * ldx(1.0, -107) * v.abs().max(1.0));
            assert!(diff <= tol, "ln(exp({v})) drifted by {:e}", diff.to_f64());
        }
    }

    #[test]
    fn log_two_matches_the_reference_words() {
        let l = DoubleDouble::from(2.0).ln();
        assert_eq!(HIRES_LOG2[0], l.hi());
        assert!(ulps(&l, &DoubleDouble::LOG2) <= 1.0);
        let lh = DoubleDouble::from(-0.5).ln_1p();
        assert!(ulps(&lh, &-DoubleDouble::LOG2) <= 1.0);
    }

    #[test]
    fn exp_extremes() {
        assert_eq!(DoubleDouble::ONE, DoubleDouble::ZERO.exp());
        assert_eq!(0.0, DoubleDouble::from(f64::NEG_INFINITY).exp().hi());
        assert_eq!(f64::INFINITY, DoubleDouble::from(f64::INFINITY).exp().hi());
        assert_eq!(f64::INFINITY, DoubleDouble::from(1000.0).exp().hi());
        assert_eq!(0.0, DoubleDouble::from(-1000.0).exp().hi());
        assert!(DoubleDouble::from(f64::NAN).exp().hi().is_nan());
    }

    #[test]
    fn expm1_stays_accurate_near_zero() {
        let x = DoubleDouble::from(1e-20);
        let r = x.exp_m1();
        // exp(x)-1 = x + x^2/2 + ...; at 1e-20 the x^2 term sits at 5e-41,
        // within the double-double word span.
        let expect = x + x.square() * 0.5;
        assert!(ulps(&r, &expect) <= 2.0);
        assert_eq!(-1.0, DoubleDouble::from(f64::NEG_INFINITY).exp_m1().hi());
        let big = DoubleDouble::from(200.0);
        assert!(ulps(&big.exp_m1(), &big.exp()) <= 2.0); // -1 invisible here
    }

    #[test]
    fn log_extremes() {
        assert!(DoubleDouble::from(-1.0).ln().hi().is_nan());
        assert_eq!(f64::NEG_INFINITY, DoubleDouble::ZERO.ln().hi());
        assert_eq!(f64::INFINITY, DoubleDouble::from(f64::INFINITY).ln().hi());
        // Subnormal arguments take the scaled branch.
        let sub = DoubleDouble::from(ldx(3.0, -1070));
        let l = sub.ln();
        let expect = DoubleDouble::from(3.0).ln() + DoubleDouble::LOG2 * -1070.0;
        assert!(ulps(&l, &expect) <= 4.0, "subnormal ln off by {}", ulps(&l, &expect));
    }

    #[test]
    fn four_atan_one_is_pi() {
        let pi = 4.0 * DoubleDouble::ONE.atan();
        assert_eq!(HIRES_PI[0], pi.hi());
        assert!(ulps(&pi, &DoubleDouble::PI) <= 1.0);
    }

    #[test]
    fn atan_small_and_large_branches() {
        let small = DoubleDouble::from(1e-8);
        let r = small.atan();
        let expect = small - small.square() * small / 3.0;
        assert!(ulps(&r, &expect) <= 2.0);

        let large = DoubleDouble::from(1e50);
        assert!(ulps(&large.atan(), &DoubleDouble::HALF_PI) <= 1.0);
        assert!(ulps(&DoubleDouble::from(f64::NEG_INFINITY).atan(), &-DoubleDouble::HALF_PI) <= 1.0);

        // atan(3) + atan(1/3) = pi/2
        let sum = DoubleDouble::from(3.0).atan() + DoubleDouble::from(3.0).recip().atan();
        assert!(ulps(&sum, &DoubleDouble::HALF_PI) <= 2.0);
    }

    #[test]
    fn atan2_quadrants() {
        let one = DoubleDouble::ONE;
        let q1 = one.atan2(&one);
        assert!(ulps(&q1, &(DoubleDouble::PI / 4.0)) <= 2.0);
        let q2 = one.atan2(&-one);
        assert!(ulps(&q2, &(3.0 * DoubleDouble::PI / 4.0)) <= 2.0);
        let q3 = (-one).atan2(&-one);
        assert!(ulps(&q3, &(-3.0 * DoubleDouble::PI / 4.0)) <= 2.0);
        let q4 = (-one).atan2(&one);
        assert!(ulps(&q4, &(-DoubleDouble::PI / 4.0)) <= 2.0);
        // Axis conventions
        assert_eq!(DoubleDouble::ZERO, DoubleDouble::ZERO.atan2(&DoubleDouble::ZERO));
        assert_eq!(DoubleDouble::PI, DoubleDouble::ZERO.atan2(&-one));
        assert!(ulps(&one.atan2(&DoubleDouble::ZERO), &DoubleDouble::HALF_PI) <= 1.0);
    }
}
