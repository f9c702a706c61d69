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

//! Data model of the line-search state machine: the base point anchoring the
//! current search direction, the two bracket endpoints enclosing the line
//! minimum, and the marker for the best point observed so far.
//!
//! The invariants maintained across a line search are: `left.ep <= 0`;
//! either `right.ep >= 0` or `right.e > left.e` (up to the energy slack);
//! the best point is exactly one of the two endpoints; and every bracket `e`
//! is expressed relative to the best point, so at least one of `left.e`,
//! `right.e` is zero.

use crate::{MeshValue, StateKey, Vector3};

/// Which endpoint currently carries the best observed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BestSide {
    Left,
    Right,
}

/// One endpoint of the line-search bracket: a state snapshot evaluated at an
/// offset along the search direction, with everything the search needs to
/// reason about it.
#[derive(Debug, Default)]
pub(crate) struct Bracket {
    /// The evaluated snapshot; `None` until the endpoint is filled.
    pub state: Option<StateKey>,
    /// Offset along the search direction; -1 marks "not set".
    pub offset: f64,
    /// Total energy relative to the best point.
    pub e: f64,
    /// Directional derivative of the energy at this offset.
    pub ep: f64,
    /// Per-cell energy density of the snapshot.
    pub energy: MeshValue<f64>,
    /// Per-cell torque m x H x m of the snapshot.
    pub mxhxm: MeshValue<Vector3>,
    /// l2 norm of Ms*V*mxHxm with the offset scale adjustment applied.
    pub grad_norm: f64,
    /// Estimated rounding error of `e`.
    pub e_error_estimate: f64,
}

impl Bracket {
    pub fn new() -> Self {
        Bracket {
            state: None,
            offset: -1.0,
            e: 0.0,
            ep: 0.0,
            energy: MeshValue::new(),
            mxhxm: MeshValue::new(),
            grad_norm: 0.0,
            e_error_estimate: 0.0,
        }
    }

    /// Forgets the evaluation but keeps the buffers for reuse.
    pub fn clear(&mut self) {
        self.state = None;
        self.offset = -1.0;
        self.e = 0.0;
        self.ep = 0.0;
        self.grad_norm = 0.0;
        self.e_error_estimate = 0.0;
    }

    /// True once this endpoint holds an evaluation.
    pub fn is_set(&self) -> bool {
        self.offset >= 0.0
    }
}

/// The pair of endpoints plus the auxiliary endpoint used for line-search
/// test points, and every scalar pacing the search.
#[derive(Debug)]
pub(crate) struct BracketSet {
    pub left: Bracket,
    pub right: Bracket,
    /// Scratch endpoint holding the newest test point before
    /// `update_brackets` decides which endpoint it replaces.
    pub extra: Bracket,

    /// True once (left, right) is known to enclose a minimum.
    pub min_bracketed: bool,
    /// True once the line search has settled.
    pub min_found: bool,
    /// Set when the energy values have sunk below rounding noise and only
    /// derivative data can be trusted.
    pub bad_edata: bool,
    /// Consecutive weak brackets (right.ep < 0 with right.e > left.e) seen
    /// during line minimization.
    pub weak_bracket_count: u32,

    /// Smallest allowed bracketing step, as tan of the configured angle.
    pub minstep: f64,
    /// Largest allowed bracketing step, as tan of the configured angle.
    pub maxstep: f64,
    /// Line minimum angle tolerance, stored as its sine.
    pub angle_precision: f64,
    /// Relative span stop criterion for line minimization.
    pub relative_minspan: f64,

    /// `minstep` scaled by the current direction magnitude.
    pub scaled_minstep: f64,
    /// `maxstep` scaled by the current direction magnitude.
    pub scaled_maxstep: f64,
    /// First offset to probe on a fresh direction.
    pub start_step: f64,
    /// Span below which the line search stops.
    pub stop_span: f64,

    /// Span reduction achieved by the last line-minimization step.
    pub last_min_reduction_ratio: f64,
    /// And by the one before it; together they bound the next reduction.
    pub next_to_last_min_reduction_ratio: f64,
}

impl BracketSet {
    pub fn new() -> Self {
        BracketSet {
            left: Bracket::new(),
            right: Bracket::new(),
            extra: Bracket::new(),
            min_bracketed: false,
            min_found: false,
            bad_edata: false,
            weak_bracket_count: 0,
            minstep: 0.0,
            maxstep: 0.0,
            angle_precision: 0.0,
            relative_minspan: 1.0,
            scaled_minstep: 0.0,
            scaled_maxstep: 0.0,
            start_step: 0.0,
            stop_span: 0.0,
            last_min_reduction_ratio: 0.0,
            next_to_last_min_reduction_ratio: 0.0,
        }
    }
}

/// Marker for the best point observed along the current line.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BestPoint {
    pub side: BestSide,
    /// Whether the best point was accepted as a genuine line minimum (good
    /// gradient information for the next conjugation).
    pub is_line_minimum: bool,
}

/// The anchor of the current search direction.
#[derive(Debug)]
pub(crate) struct BasePoint {
    /// False forces a restart from the plain (preconditioned) gradient.
    pub valid: bool,
    /// Id of the simulation state this base point was built from.
    pub id: u64,
    /// Stage the base point belongs to; a stage change invalidates it.
    pub stage: u32,
    /// The search direction, tangent to the unit sphere at every cell.
    pub direction: MeshValue<Vector3>,
    /// Torque of the previous base point; only the Polak-Ribiere
    /// conjugation needs it.
    pub mxhxm: MeshValue<Vector3>,
    /// Squared preconditioned gradient norm g^T P g of this base point.
    pub g_sum_sq: f64,
    /// Componentwise max magnitude of the direction, used for step scaling.
    pub direction_max_mag: f64,
    /// Euclidean norm of the direction.
    pub direction_norm: f64,
    /// Directional derivative of the energy at offset zero.
    pub ep: f64,
    /// Total energy at the base point.
    pub total_energy: f64,
}

impl BasePoint {
    pub fn new() -> Self {
        BasePoint {
            valid: false,
            id: 0,
            stage: 0,
            direction: MeshValue::new(),
            mxhxm: MeshValue::new(),
            g_sum_sq: 0.0,
            direction_max_mag: 0.0,
            direction_norm: 0.0,
            ep: 0.0,
            total_energy: 0.0,
        }
    }
}
