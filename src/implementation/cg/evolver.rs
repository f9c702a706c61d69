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

//! The nonlinear conjugate gradient evolver: a base-point / line-minimum
//! state machine over unit-vector fields.
//!
//! Each [CgEvolver::try_step] makes one unit of progress: it anchors a new
//! base point and search direction when needed (conjugating the
//! preconditioned torque with the previous direction, or restarting from the
//! plain gradient), then either widens the bracket around the line minimum
//! or shrinks it with a cubic/quadratic blended test point.  The best state
//! observed so far is returned every time, so the caller always holds a
//! monotone (up to rounding slack) sequence of states.
//!
//! All reductions run compensated and in parallel over the stripe layout,
//! which makes the walk deterministic for a fixed worker count.

use std::sync::Arc;

use derive_builder::Builder;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

use crate::abstraction::{compute_energies_static, Driver, EnergyTerm, Mesh};
use crate::implementation::storage::mesh_value::ParallelWriter;
use crate::implementation::threads::pool::run_threaded;
use crate::implementation::xp::Accumulator;
use crate::warn::{RevisionInfo, WarningMessage};
use crate::{
    core_err, derived, CoreResult, MeshValue, SimState, StateKey, Vector3, MU0,
};

use super::brackets::{BasePoint, BestPoint, BestSide, Bracket, BracketSet};

static REVISION_INFO: RevisionInfo =
    RevisionInfo::new(file!(), "2.0", "2020-06-30", "xgillard");
static NUDGE_WARNING: WarningMessage = WarningMessage::new(3);

// ----------------------------------------------------------------------------
// --- CONFIGURATION ----------------------------------------------------------
// ----------------------------------------------------------------------------

/// The conjugation rule mixing the current gradient with the previous search
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConjugateMethod {
    /// gamma = (g_n^T P g_n) / (g_(n-1)^T P g_(n-1))
    #[default]
    FletcherReeves,
    /// gamma = (g_n^T P (g_n - g_(n-1))) / (g_(n-1)^T P g_(n-1))
    PolakRibiere,
}

/// Which diagonal preconditioner to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreconditionerType {
    /// No preconditioning: C^-2 = (Ms V)^2.
    #[default]
    None,
    /// C^-1 = Ms V per cell.
    MsV,
    /// Energy terms contribute their own diagonal through
    /// `increment_preconditioner`.
    Diagonal,
}

/// Recognized options of the evolver.  Angles are in degrees; they are
/// converted to the trigonometric form the inner loops want at construction.
#[derive(Debug, Clone, Builder)]
#[builder(default)]
pub struct CgParams {
    /// Conjugation rule.
    pub method: ConjugateMethod,
    /// Preconditioner kind.
    pub preconditioner: PreconditionerType,
    /// Convex blend weight of the diagonal preconditioner, in [0, 1].
    pub preconditioner_weight: f64,
    /// Angle (degrees) between consecutive directions above which reset
    /// evidence accumulates.
    pub gradient_reset_angle: f64,
    /// Sub-cycle count forcing a conjugation restart.
    pub gradient_reset_count: u32,
    /// Fallback downhill angle (degrees) for the direction kludge.
    pub kludge_adjust_angle: f64,
    /// Smallest bracketing step, in degrees of spin rotation.
    pub minimum_bracket_step: f64,
    /// Largest bracketing step, in degrees of spin rotation.
    pub maximum_bracket_step: f64,
    /// Line minimum angle tolerance, degrees.
    pub line_minimum_angle_precision: f64,
    /// Relative span stop criterion for the line search.
    pub line_minimum_relwidth: f64,
    /// ULP scale for the energy slack estimate; 1e-14 is neutral.
    pub energy_precision: f64,
}

impl Default for CgParams {
    fn default() -> Self {
        CgParams {
            method: ConjugateMethod::FletcherReeves,
            preconditioner: PreconditionerType::None,
            preconditioner_weight: 0.5,
            gradient_reset_angle: 87.5,
            gradient_reset_count: 5000,
            kludge_adjust_angle: 89.2,
            minimum_bracket_step: 0.05,
            maximum_bracket_step: 10.0,
            line_minimum_angle_precision: 1.0,
            line_minimum_relwidth: 1.0,
            energy_precision: 1e-14,
        }
    }
}

/// Scalar outputs surfaced by [CgEvolver::update_derived_outputs].
#[derive(Debug, Clone, Copy, Default)]
pub struct DerivedOutputs {
    pub max_mxhxm: f64,
    pub total_energy: f64,
    pub delta_e: f64,
    pub bracket_count: f64,
    pub line_min_count: f64,
    pub cycle_count: f64,
    pub cycle_sub_count: f64,
    pub conjugate_cycle_count: f64,
    pub energy_calc_count: f64,
}

/// Cache slot for one of the field outputs (total H, mxHxm, energy
/// density).  Filling only happens while a request is registered.
#[derive(Debug, Default)]
pub struct FieldOutputCache<T: crate::StripedElement> {
    request_count: u32,
    state_id: u64,
    /// The cached field; valid for the state reported by `state_id`.
    pub value: MeshValue<T>,
}

impl<T: crate::StripedElement> FieldOutputCache<T> {
    /// Registers interest in this output; it will be filled at the next
    /// [CgEvolver::update_derived_field_outputs].
    pub fn request(&mut self) {
        self.request_count += 1;
    }
    pub fn release(&mut self) {
        self.request_count = self.request_count.saturating_sub(1);
    }
    pub fn requested(&self) -> bool {
        self.request_count > 0
    }
    /// Id of the state the cache currently matches (0 when stale).
    pub fn state_id(&self) -> u64 {
        self.state_id
    }
}

// ----------------------------------------------------------------------------
// --- THE EVOLVER ------------------------------------------------------------
// ----------------------------------------------------------------------------

/// Slot for one worker's share of a compensated reduction.
#[derive(Default, Clone, Copy)]
struct ReduceSlot {
    maxval: f64,
    a: Accumulator,
    b: Accumulator,
    c: Accumulator,
}

fn reduce_slots(n: usize) -> Vec<parking_lot::Mutex<ReduceSlot>> {
    (0..n).map(|_| parking_lot::Mutex::new(ReduceSlot::default())).collect()
}

/// The conjugate gradient minimizer.  See the module documentation.
pub struct CgEvolver {
    // Configuration, pre-converted.
    method: ConjugateMethod,
    pub(super) preconditioner_type: PreconditionerType,
    pub(super) preconditioner_weight: f64,
    gradient_reset_angle_cot: f64,
    gradient_reset_count: u32,
    kludge_adjust_angle_cos: f64,
    energy_error_adj: f64,

    pub(super) energy_terms: Vec<Arc<dyn EnergyTerm>>,

    // Counters.
    step_attempt_count: u64,
    energy_calc_count: u64,
    cycle_count: u64,
    cycle_sub_count: u64,
    bracket_count: u64,
    line_minimum_count: u64,
    conjugate_cycle_count: u64,

    // Rolling evidence that conjugation stopped making progress.
    gradient_reset_score: f64,
    gradient_reset_wgt: f64,
    gradient_reset_trigger: f64,

    // Mesh-derived caches.
    pub(super) preconditioner_mesh_id: u64,
    pub(super) preconditioner_ms_v: MeshValue<Vector3>,
    pub(super) preconditioner_ms2_v2: MeshValue<Vector3>,
    pub(super) ms_v: MeshValue<f64>,
    pub(super) sum_error_estimate: f64,

    // The line-search state machine.
    basept: BasePoint,
    bracket: BracketSet,
    bestpt: BestPoint,

    // Scratch shared by every energy evaluation.
    scratch_field: MeshValue<Vector3>,

    // Field output caches.
    pub total_h_field_output: FieldOutputCache<Vector3>,
    pub mxhxm_output: FieldOutputCache<Vector3>,
    pub total_energy_density_output: FieldOutputCache<f64>,
}

impl CgEvolver {
    /// Builds an evolver for the given energy functional.
    pub fn new(params: CgParams, energy_terms: Vec<Arc<dyn EnergyTerm>>) -> CoreResult<Self> {
        let deg = std::f64::consts::PI / 180.0;

        let minstep = (params.minimum_bracket_step * deg).tan();
        let maxstep = (params.maximum_bracket_step * deg).tan();
        if minstep < 0.0 || minstep > maxstep {
            return Err(core_err!(
                BadUserInput,
                "invalid minimum_bracket_step and/or maximum_bracket_step"
            ));
        }
        if !(0.0..=1.0).contains(&params.preconditioner_weight) {
            return Err(core_err!(
                BadUserInput,
                "invalid preconditioner_weight {}; should be in range [0,1]",
                params.preconditioner_weight
            ));
        }

        let mut bracket = BracketSet::new();
        bracket.minstep = minstep;
        bracket.maxstep = maxstep;
        // sin rather than cos: the test measures the departure from 90
        // degrees (angle-sum formula on sin(90 - acos(dot))).
        bracket.angle_precision = (params.line_minimum_angle_precision * deg).sin();
        bracket.relative_minspan = params.line_minimum_relwidth;

        Ok(CgEvolver {
            method: params.method,
            preconditioner_type: params.preconditioner,
            preconditioner_weight: params.preconditioner_weight,
            gradient_reset_angle_cot: ((90.0 - params.gradient_reset_angle).abs() * deg).tan(),
            gradient_reset_count: params.gradient_reset_count,
            kludge_adjust_angle_cos: (params.kludge_adjust_angle * deg).cos(),
            energy_error_adj: params.energy_precision / 1e-14,
            energy_terms,
            step_attempt_count: 0,
            energy_calc_count: 0,
            cycle_count: 0,
            cycle_sub_count: 0,
            bracket_count: 0,
            line_minimum_count: 0,
            conjugate_cycle_count: 0,
            gradient_reset_score: 0.0,
            gradient_reset_wgt: 31.0 / 32.0,
            gradient_reset_trigger: 0.5,
            preconditioner_mesh_id: 0,
            preconditioner_ms_v: MeshValue::new(),
            preconditioner_ms2_v2: MeshValue::new(),
            ms_v: MeshValue::new(),
            sum_error_estimate: 0.0,
            basept: BasePoint::new(),
            bracket,
            bestpt: BestPoint { side: BestSide::Left, is_line_minimum: false },
            scratch_field: MeshValue::new(),
            total_h_field_output: FieldOutputCache::default(),
            mxhxm_output: FieldOutputCache::default(),
            total_energy_density_output: FieldOutputCache::default(),
        })
    }

    fn best(&self) -> &Bracket {
        match self.bestpt.side {
            BestSide::Left => &self.bracket.left,
            BestSide::Right => &self.bracket.right,
        }
    }

    /// Number of line searches completed so far.
    pub fn line_minimum_count(&self) -> u64 {
        self.line_minimum_count
    }
    /// Number of conjugation cycles started so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }
    /// Number of energy evaluations performed so far.
    pub fn energy_calc_count(&self) -> u64 {
        self.energy_calc_count
    }

    // ------------------------------------------------------------------------
    // --- ENERGY EVALUATION --------------------------------------------------
    // ------------------------------------------------------------------------

    /// Evaluates the energy functional on `state`, filling the given
    /// buffers, memoizing the scalar summaries into the state, and keeping
    /// the evaluation counters current.
    fn get_energy_and_mxhxm(
        &mut self,
        state: &SimState,
        energy: &mut MeshValue<f64>,
        mxhxm: &mut MeshValue<Vector3>,
        h_out: Option<&mut MeshValue<Vector3>>,
    ) -> CoreResult<()> {
        self.energy_calc_count += 1;

        compute_energies_static(
            state,
            &self.energy_terms,
            energy,
            mxhxm,
            h_out,
            &mut self.scratch_field,
        )?;

        // Total energy, reduced compensated over the stripes.
        let mesh = state.mesh.as_ref();
        let uniform = mesh.has_uniform_cell_volumes();
        let slots = reduce_slots(crate::thread_count());
        {
            let density = energy.as_slice();
            run_threaded(energy.array(), 1, |worker, start, stop| {
                let mut etemp = Accumulator::default();
                match uniform {
                    Some(_) => {
                        for cell in &density[start..stop] {
                            etemp += *cell;
                        }
                    }
                    None => {
                        for i in start..stop {
                            etemp += density[i] * mesh.volume(i);
                        }
                    }
                }
                slots[worker].lock().a += &etemp;
            })?;
        }
        let mut total = Accumulator::default();
        for slot in &slots {
            total += &slot.lock().a;
        }
        let total_energy = match uniform {
            Some(vol) => total.value() * vol,
            None => total.value(),
        };

        state.add_derived_data(derived::TOTAL_ENERGY, total_energy);
        state.add_derived_data(derived::BRACKET_COUNT, self.bracket_count as f64);
        state.add_derived_data(derived::LINE_MIN_COUNT, self.line_minimum_count as f64);
        state.add_derived_data(derived::ENERGY_CALC_COUNT, self.energy_calc_count as f64);
        Ok(())
    }

    /// Evaluates `statekey` at `offset` along the current direction and
    /// fills the extra bracket endpoint: energy relative to the best point,
    /// directional derivative, and gradient norm.
    fn get_relative_energy_and_derivative(
        &mut self,
        statekey: &StateKey,
        offset: f64,
    ) -> CoreResult<()> {
        // mxHxm rather than H in the derivative: the energy is evaluated on
        // normalized spins, so the component of H along m has no effect, and
        // convergence is empirically faster this way.
        let mut energy = std::mem::take(&mut self.bracket.extra.energy);
        let mut mxhxm = std::mem::take(&mut self.bracket.extra.mxhxm);
        self.get_energy_and_mxhxm(statekey, &mut energy, &mut mxhxm, None)?;

        let state: &SimState = statekey;
        let mesh = state.mesh.as_ref();
        let edee = state
            .get_derived_data(derived::ENERGY_DENSITY_ERROR_ESTIMATE)
            .ok_or_else(|| {
                core_err!(ProgramLogicError, "missing energy density error estimate")
            })?;
        let (best_edee, best_state_id) = {
            let best = self.best();
            let best_state = best.state.as_ref().ok_or_else(|| {
                core_err!(ProgramLogicError, "relative energy requested before a best point")
            })?;
            let best_edee = best_state
                .get_derived_data(derived::ENERGY_DENSITY_ERROR_ESTIMATE)
                .ok_or_else(|| {
                    core_err!(
                        ProgramLogicError,
                        "missing best point energy density error estimate"
                    )
                })?;
            (best_edee, best_state.id())
        };
        let energy_density_error_estimate = edee + best_edee;

        let uniform = mesh.has_uniform_cell_volumes();
        let slots = reduce_slots(crate::thread_count());
        {
            let best = self.best();
            let new_e = energy.as_slice();
            let best_e = best.energy.as_slice();
            let new_mxhxm = mxhxm.as_slice();
            let direction = self.basept.direction.as_slice();
            let ms_v = self.ms_v.as_slice();
            let offset_sq = offset * offset;
            run_threaded(self.ms_v.array(), 1, |worker, start, stop| {
                let mut etemp = Accumulator::default();
                let mut dtemp = Accumulator::default();
                let mut stemp = Accumulator::default();
                for i in start..stop {
                    match uniform {
                        Some(_) => etemp += new_e[i] - best_e[i],
                        None => etemp += (new_e[i] - best_e[i]) * mesh.volume(i),
                    }
                    let dvec = direction[i];
                    let scale_adj = ms_v[i] / (1.0 + offset_sq * dvec.mag_sq()).sqrt();
                    dtemp += new_mxhxm[i].dot(&dvec) * scale_adj;
                    stemp += new_mxhxm[i].mag_sq() * scale_adj * scale_adj;
                }
                let mut slot = slots[worker].lock();
                slot.a += &etemp;
                slot.b += &dtemp;
                slot.c += &stemp;
            })?;
        }
        let mut etemp = Accumulator::default();
        let mut dtemp = Accumulator::default();
        let mut stemp = Accumulator::default();
        for slot in &slots {
            let s = slot.lock();
            etemp += &s.a;
            dtemp += &s.b;
            stemp += &s.c;
        }
        let relenergy = match uniform {
            Some(vol) => etemp.value() * vol,
            None => etemp.value(),
        };
        let derivative = -MU0 * dtemp.value();
        let grad_norm = stemp.value().sqrt();

        state.add_derived_data(derived::RELATIVE_ENERGY, relenergy);
        state.add_derived_data(derived::ENERGY_BEST_STATE_ID, best_state_id as f64);

        let endpt = &mut self.bracket.extra;
        endpt.energy = energy;
        endpt.mxhxm = mxhxm;
        endpt.state = Some(Arc::clone(statekey));
        endpt.offset = offset;
        endpt.e = relenergy;
        endpt.ep = derivative;
        endpt.grad_norm = grad_norm;
        endpt.e_error_estimate = relenergy.abs() * f64::EPSILON * 8.0; // 8 is fudge
        if mesh.size() > 0 {
            endpt.e_error_estimate += energy_density_error_estimate * mesh.total_volume()
                / (2.0 * mesh.size() as f64).sqrt();
            // The error grows like sqrt(2 n): the difference against the
            // best point doubles the variance, hence the 2.
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // --- BRACKET MANAGEMENT -------------------------------------------------
    // ------------------------------------------------------------------------

    /// Rounding-noise floor below which two energies compare equal.
    fn estimate_energy_slack(&self) -> f64 {
        // Besides the per-endpoint error estimates, include a span term
        // predicted from the derivative data; it helps when the energy
        // differences cancel to almost nothing at the test states.
        let mut edelta_guess = 0.0;
        if self.bracket.right.offset > 0.0 {
            edelta_guess = (self.basept.ep.abs()
                + self.bracket.left.ep.abs()
                + self.bracket.right.ep.abs())
                * 0.5
                * self.bracket.right.offset; // 0.5 is 0.33 plus fudge
        }
        let slack = self.bracket.left.e_error_estimate
            + self.bracket.right.e_error_estimate
            + edelta_guess * f64::EPSILON;
        slack * self.energy_error_adj
    }

    /// Detects total loss of numeric precision across a (sub)interval.
    fn bad_precision_test(
        &self,
        left_offset: f64,
        left_ep: f64,
        right_offset: f64,
        right_ep: f64,
        energy_slack: f64,
    ) -> bool {
        let span = right_offset - left_offset;
        let l_ep = left_ep * span;
        let r_ep = right_ep * span;
        span <= 256.0 * self.bracket.stop_span
            && (r_ep - l_ep).abs() < l_ep.abs() / 16.0
            && l_ep.abs() < energy_slack
    }

    /// Builds the trial state at `offset` along the current direction and
    /// evaluates it into the extra bracket.
    fn fill_bracket(
        &mut self,
        driver: &dyn Driver,
        offset: f64,
        oldstate: &StateKey,
    ) -> CoreResult<()> {
        let mut work = oldstate.spawn_like();
        driver.fill_state_member_data(oldstate, &mut work);
        driver.fill_state_supplemental_data(&mut work);

        {
            let best = self.best();
            let best_state = best.state.as_ref().ok_or_else(|| {
                core_err!(ProgramLogicError, "fill_bracket before the base point was set")
            })?;
            let best_spin = best_state.spin.as_slice();
            let direction = self.basept.direction.as_slice();
            let t1sq = best.offset * best.offset;
            let dvec_scale = offset - best.offset;
            let spin_out = ParallelWriter::new(work.spin.as_mut_slice());
            run_threaded(self.basept.direction.array(), 1, |_worker, start, stop| {
                for i in start..stop {
                    // Great-circle projection: unit length is preserved to
                    // second order before the final normalization.
                    let dvec = direction[i];
                    let dsq = dvec.mag_sq();
                    let mut spin = best_spin[i] * (1.0 + t1sq * dsq).sqrt();
                    spin.accum(dvec_scale, &dvec);
                    spin.make_unit();
                    unsafe { spin_out.write(i, spin) };
                }
            })?;
        }

        work.iteration_count = oldstate.iteration_count + 1;
        work.stage_iteration_count = oldstate.stage_iteration_count + 1;

        let key: StateKey = Arc::new(work);
        driver.fill_state_derived_data(oldstate, &key);
        self.get_relative_energy_and_derivative(&key, offset)
    }

    /// Folds the tentative endpoint (the extra bracket) into the (left,
    /// right) pair so the pair keeps bracketing a minimum, and re-picks the
    /// best point.  On exit the extra bracket holds the data of whichever
    /// endpoint was replaced.
    fn update_brackets(&mut self, force_bestpt: bool) {
        let energy_slack = self.estimate_energy_slack();

        if !self.bracket.right.is_set() {
            // Right endpoint not yet seeded; the tentative becomes it.
            std::mem::swap(&mut self.bracket.right, &mut self.bracket.extra);
        } else if self.bracket.extra.offset > self.bracket.right.offset {
            // Bracketing phase: shift the window rightward.
            if self.bracket.right.e <= self.bracket.left.e + energy_slack
                && self.bracket.right.ep < 0.0
            {
                // Promote right to left only when right really is no worse;
                // shifting the left bracket can hop over a close minimum.
                if self.bracket.right.e <= self.bracket.left.e - energy_slack
                    || (self.bracket.right.e <= self.bracket.left.e + energy_slack
                        && self.bracket.right.ep.abs() <= self.bracket.left.ep.abs())
                {
                    std::mem::swap(&mut self.bracket.left, &mut self.bracket.right);
                }
            }
            std::mem::swap(&mut self.bracket.right, &mut self.bracket.extra);
        } else {
            // Line-minimum phase: the tentative lies inside (left, right).
            // Decide which endpoint pair survives; derivative signs first,
            // energy magnitudes only when every derivative is negative.
            let keep_left;
            if self.bracket.extra.ep >= 0.0 {
                keep_left = true;
            } else if self.bracket.right.ep >= 0.0 {
                keep_left = false;
            } else if self.bracket.left.e >= self.bracket.extra.e {
                keep_left = false;
            } else if self.bracket.extra.e >= self.bracket.right.e {
                keep_left = true;
            } else {
                // Both subintervals look bracketed: either two minima, or
                // the E data is noise.  Check the numerics; when both sides
                // look equally bad keep the wider energy drop and flag it.
                let lbad = self.bad_precision_test(
                    self.bracket.left.offset,
                    self.bracket.left.ep,
                    self.bracket.extra.offset,
                    self.bracket.extra.ep,
                    energy_slack,
                );
                let rbad = self.bad_precision_test(
                    self.bracket.extra.offset,
                    self.bracket.extra.ep,
                    self.bracket.right.offset,
                    self.bracket.right.ep,
                    energy_slack,
                );
                if lbad && !rbad {
                    keep_left = false;
                } else if !lbad && rbad {
                    keep_left = true;
                } else if self.bracket.extra.e - self.bracket.left.e
                    > self.bracket.right.e - self.bracket.extra.e
                {
                    if lbad {
                        self.bracket.bad_edata = true;
                    }
                    keep_left = true;
                } else {
                    if rbad {
                        self.bracket.bad_edata = true;
                    }
                    keep_left = false;
                }
            }
            if keep_left {
                std::mem::swap(&mut self.bracket.right, &mut self.bracket.extra);
                if force_bestpt {
                    self.bestpt.side = BestSide::Right;
                }
            } else {
                std::mem::swap(&mut self.bracket.left, &mut self.bracket.extra);
                if force_bestpt {
                    self.bestpt.side = BestSide::Left;
                }
            }
        }

        // Re-pick the best point: smaller E wins, near-ties broken by
        // smaller |Ep|.
        if !force_bestpt {
            let right_better = self.bracket.right.e < self.bracket.left.e - energy_slack
                || (self.bracket.right.e < self.bracket.left.e + energy_slack
                    && self.bracket.right.ep.abs() < self.bracket.left.ep.abs());
            self.bestpt.side = if right_better { BestSide::Right } else { BestSide::Left };
        }

        // Rebase every relative energy so the best point reads zero.
        let bestpt_energy = self.best().e;
        self.bracket.left.e -= bestpt_energy;
        self.bracket.right.e -= bestpt_energy;
        if self.bracket.extra.is_set() {
            self.bracket.extra.e -= bestpt_energy;
        }
        debug_assert!(self.bracket.left.e == 0.0 || self.bracket.right.e == 0.0);
    }

    /// One bracketing move: pushes the right endpoint further out along the
    /// line until a minimum is enclosed (or the step limit is reached).
    fn find_bracket_step(&mut self, driver: &dyn Driver, oldstate: &StateKey) -> CoreResult<()> {
        let right_offset = self.bracket.right.offset.max(0.0);
        debug_assert!(right_offset >= self.bracket.left.offset && self.bracket.left.ep <= 0.0);

        if self.bracket.left.ep == 0.0 {
            // Already at a stationary point along this line.
            self.bracket.min_bracketed = true;
            return Ok(());
        }

        self.bracket_count += 1;

        let h = right_offset - self.bracket.left.offset;
        let maxoff = self.bracket.left.offset.max(self.bracket.scaled_maxstep);
        let minoff = self
            .bracket
            .start_step
            .max(2.0 * right_offset)
            .min(maxoff);

        let mut offset;
        if h <= 0.0 {
            offset = minoff;
        } else {
            let wgt = if self.bracket.bad_edata { 0.0 } else { 0.5 };
            offset = self.bracket.left.offset
                + 1.75
                    * estimate_quadratic_minimum(
                        wgt,
                        h,
                        self.bracket.left.e,
                        self.bracket.right.e,
                        self.bracket.left.ep,
                        self.bracket.right.ep,
                    );
            offset = offset.clamp(minoff, maxoff);
        }

        // Zero-span protection.
        if offset <= right_offset {
            if right_offset > 0.0 {
                offset = right_offset * (1.0 + 16.0 * f64::EPSILON);
            } else if self.bracket.scaled_maxstep > 0.0 {
                offset = self.bracket.scaled_maxstep;
            } else {
                offset = f64::EPSILON; // Punt
            }
        }
        let dmax = self.basept.direction_max_mag;
        if (offset - self.best().offset).abs() * dmax < 16.0 * f64::EPSILON {
            // The proposed offset probably does not move any discretized
            // spin; bumping it a bit cannot hurt a bracketing probe.
            if dmax >= 0.5 || f64::MAX * dmax > 16.0 * f64::EPSILON {
                offset += 16.0 * f64::EPSILON / dmax;
            }
        }

        self.fill_bracket(driver, offset, oldstate)?;
        self.update_brackets(false);

        // Classify: with left.Ep < 0 guaranteed, either the minimum is now
        // enclosed (right.E above left.E or right.Ep >= 0) or the window
        // must keep moving.
        let energy_slack = self.estimate_energy_slack();
        if (self.bracket.bad_edata
            || self.bracket.right.e <= self.bracket.left.e + energy_slack)
            && self.bracket.right.ep < 0.0
        {
            self.bracket.min_bracketed = false;
            self.bracket.stop_span = 0.0;
            if self.bracket.right.offset >= self.bracket.scaled_maxstep {
                // Cannot bracket inside the allowed range: accept the best
                // observed point and close the line search.
                self.bracket.min_bracketed = true;
                self.bracket.min_found = true;
            }
        } else {
            self.bracket.min_bracketed = true;
            self.bracket.stop_span = self.bracket.relative_minspan * self.bracket.right.offset;
            if dmax > 0.0 && self.bracket.stop_span * dmax < 4.0 * f64::EPSILON {
                // Smallest offset variation with a discretizational effect.
                self.bracket.stop_span = 4.0 * f64::EPSILON / dmax;
            }
        }
        Ok(())
    }

    /// One line-minimization move: compresses the bracket span around the
    /// minimum, or declares it found.
    fn find_line_minimum_step(
        &mut self,
        driver: &dyn Driver,
        oldstate: &StateKey,
    ) -> CoreResult<()> {
        debug_assert!(
            self.bracket.left.ep <= 0.0
                && (self.bracket.right.e > self.bracket.left.e || self.bracket.right.ep >= 0.0)
        );
        let span = self.bracket.right.offset - self.bracket.left.offset;
        let energy_slack = self.estimate_energy_slack();
        let dmax = self.basept.direction_max_mag;

        // Upper bound on the smallest offset variation that changes any
        // discretized spin.
        let mut nudge = f64::MAX / 2.0;
        if dmax >= 1.0 || f64::EPSILON < nudge * dmax {
            nudge = f64::EPSILON / dmax;
            if nudge >= 0.125 * span
                && self.bracket.right.ep > self.bracket.left.ep * (1.0 - f64::EPSILON)
            {
                // Ep still resolves differences across the span, so the
                // bound is loose; allow further reduction.
                nudge = 0.125 * span;
            }
        } else {
            // Degenerate: the direction is (numerically) zero.
            nudge = span;
        }

        // Termination: the first clause is the orthogonality check, the
        // second a rough test that conjugating the gradient here will point
        // downhill, the rest sanity and span controls.
        let stop_gate = MU0
            * self.best().grad_norm
            * self.basept.direction_norm
            * self.bracket.angle_precision
            * (1.0 + 2.0 * self.sum_error_estimate);
        let best_ep = self.best().ep;
        if best_ep.abs() < stop_gate
            && (best_ep == 0.0 || best_ep > self.basept.ep)
            && (best_ep == 0.0 || span <= self.bracket.stop_span || nudge >= span)
        {
            self.bracket.min_found = true;
            self.bestpt.is_line_minimum = true; // Good gradient info
            self.bracket.last_min_reduction_ratio = 0.0;
            self.bracket.next_to_last_min_reduction_ratio = 0.0;
            return Ok(());
        }

        if self.bracket.left.ep >= 0.0
            || nudge >= span * (1.0 - f64::EPSILON)
            || self.bracket.right.ep == 0.0
        {
            // left.Ep == 0 means a minimum; > 0 is an error but handled for
            // robustness.  A span below the nudge cannot move any spin, so
            // further refinement is pointless.  right.Ep exactly 0 likewise
            // indicates a minimum.
            self.bestpt.is_line_minimum = nudge >= span * (1.0 - f64::EPSILON);
            self.bracket.min_found = true;
            self.bracket.last_min_reduction_ratio = 0.0;
            self.bracket.next_to_last_min_reduction_ratio = 0.0;
            return Ok(());
        }

        if self.bad_precision_test(
            self.bracket.left.offset,
            self.bracket.left.ep,
            self.bracket.right.offset,
            self.bracket.right.ep,
            energy_slack,
        ) {
            self.bracket.min_found = true;
            self.bracket.bad_edata = true;
            self.bracket.last_min_reduction_ratio = 0.0;
            self.bracket.next_to_last_min_reduction_ratio = 0.0;
            return Ok(());
        }

        // Pick the test point: a cubic fit on (E, Ep) blended against an
        // alternative that only leans on derivative data, weighted by the
        // cubic's own error estimate (obtained by perturbing the energy
        // difference by +- the slack).
        let l_ep = self.bracket.left.ep * span;
        let r_ep = self.bracket.right.ep * span;
        let ediff = self.bracket.right.e - self.bracket.left.e;

        let mut cubic_testpt = 0.5;
        let mut cubic_error = 1.0;
        if r_ep > 0.0 || ediff - energy_slack >= 0.0 {
            cubic_testpt = find_cubic_minimum(ediff, l_ep, r_ep);
            let chk_a = find_cubic_minimum(ediff + energy_slack, l_ep, r_ep);
            let chk_b = find_cubic_minimum(ediff - energy_slack, l_ep, r_ep);
            // Up to rounding, chk_b > chk_a.
            if 0.0 < chk_a && chk_b < 1.0 {
                cubic_error = (chk_b - chk_a).abs();
            }
        }
        const CUBIC_ERROR_LOWER_BOUND: f64 = 0.125; // Empirically derived
        const CUBIC_ERROR_UPPER_BOUND: f64 = 0.625; // values.

        let mut alt_testpt = -1.0;
        if cubic_error > CUBIC_ERROR_LOWER_BOUND {
            if self.bracket.right.ep > 0.0 {
                // With a usable extra bracket of comparable span, fit a
                // quadratic to the three Ep values; otherwise fall back to
                // a linear Ep fit.
                let ex_off = self.bracket.extra.offset;
                let left_off = self.bracket.left.offset;
                let right_off = self.bracket.right.offset;
                let mut extra_size = -1.0;
                let extra_left = 0.0 <= ex_off && ex_off < left_off * (1.0 - f64::EPSILON);
                let extra_right = right_off * (1.0 + f64::EPSILON) < ex_off;
                if extra_left {
                    extra_size = left_off - ex_off;
                } else if extra_right {
                    extra_size = ex_off - right_off;
                }
                let extra_lower = 0.05 * span; // Empirically derived
                let extra_upper = 1.50 * span; // values.
                if extra_lower < extra_size && extra_size < extra_upper {
                    let (lspan, rspan, tspan, va, vb, vc) = if extra_left {
                        (
                            left_off - ex_off,
                            span,
                            right_off - ex_off,
                            self.bracket.extra.ep,
                            self.bracket.left.ep,
                            self.bracket.right.ep,
                        )
                    } else {
                        (
                            span,
                            ex_off - right_off,
                            ex_off - left_off,
                            self.bracket.left.ep,
                            self.bracket.right.ep,
                            self.bracket.extra.ep,
                        )
                    };
                    let a = (lspan * vc + rspan * va - tspan * vb) * tspan / (lspan * rspan);
                    let b = (tspan * tspan * vb - lspan * lspan * vc
                        - rspan * (tspan + lspan) * va)
                        / (lspan * rspan);
                    let c = va;
                    let disc = b * b - 4.0 * a * c;
                    if disc >= 0.0 {
                        let disc = disc.sqrt();
                        let root = if b >= 0.0 {
                            -2.0 * c / (b + disc)
                        } else {
                            0.5 * (disc - b) / a
                        };
                        // The root is relative to tspan; express it across
                        // [left.offset, right.offset].
                        alt_testpt = if extra_left {
                            (root * tspan - lspan) / rspan
                        } else {
                            root * tspan / lspan
                        };
                    }
                }
                if alt_testpt <= 0.0 || 1.0 <= alt_testpt {
                    // Linear Ep fit; left.Ep < 0 < right.Ep keeps the result
                    // inside [0, 1].
                    let ep_diff = self.bracket.right.ep - self.bracket.left.ep;
                    alt_testpt = -self.bracket.left.ep / ep_diff;
                }
            } else {
                // right.Ep < 0 is suspicious; guess from leftE/Ep and
                // rightE with a hard floor on the reduction.
                const REDUCE_LIMIT: f64 = 1.0 / 32.0;
                let numerator = -l_ep; // > 0
                let denominator = (2.0 * (ediff - l_ep)).abs();
                alt_testpt = if numerator < REDUCE_LIMIT * denominator {
                    REDUCE_LIMIT
                } else if numerator > (1.0 - REDUCE_LIMIT) * denominator {
                    1.0 - REDUCE_LIMIT
                } else {
                    numerator / denominator
                };
            }
            alt_testpt = alt_testpt.clamp(0.0, 1.0);
        }

        let mut lambda = if cubic_error <= CUBIC_ERROR_LOWER_BOUND {
            cubic_testpt
        } else if cubic_error >= CUBIC_ERROR_UPPER_BOUND {
            alt_testpt
        } else {
            ((CUBIC_ERROR_UPPER_BOUND - cubic_error) * cubic_testpt
                + (cubic_error - CUBIC_ERROR_LOWER_BOUND) * alt_testpt)
                / (CUBIC_ERROR_UPPER_BOUND - CUBIC_ERROR_LOWER_BOUND)
        };

        // Shrink away from the interval ends so the minimum more likely
        // lands in the smaller piece.
        const SAFETY: f64 = 1.0 / (1024.0 * 1024.0);
        if lambda < 0.25 {
            lambda *= 1.0 + SAFETY;
        } else if lambda > 0.75 {
            lambda *= 1.0 - SAFETY;
        }

        // Restrict the reduction ratio: the square of the smaller of the
        // last two ratios, floored by machine resolution and the nudge.
        const MAX_REDUCE_BASE: f64 = 0.5; // Do not set above 0.707
        let mut max_reduce = MAX_REDUCE_BASE
            .min(self.bracket.last_min_reduction_ratio)
            .min(self.bracket.next_to_last_min_reduction_ratio);
        max_reduce *= max_reduce;
        if span * max_reduce < f64::EPSILON * self.bracket.right.offset {
            let temp = f64::EPSILON * self.bracket.right.offset;
            max_reduce = if temp < 0.5 * span { temp / span } else { 0.5 };
        }
        if span * max_reduce < nudge {
            max_reduce = nudge / span;
        }
        if max_reduce > 0.5 {
            max_reduce = 0.5; // Safety; should not trigger
        }
        if lambda > 0.5 {
            if lambda > 1.0 - max_reduce {
                lambda = 1.0 - max_reduce;
            }
        } else if lambda < max_reduce {
            lambda = max_reduce;
        }

        let mut test_offset = self.bracket.left.offset + lambda * span;
        if test_offset <= self.bracket.left.offset || test_offset >= self.bracket.right.offset {
            // Roundoff check
            test_offset = 0.5 * (self.bracket.left.offset + self.bracket.right.offset);
            if test_offset <= self.bracket.left.offset
                || test_offset >= self.bracket.right.offset
            {
                // Interval width is effectively machine zero.
                self.bracket.min_found = true;
                self.bracket.last_min_reduction_ratio = 0.0;
                self.bracket.next_to_last_min_reduction_ratio = 0.0;
                return Ok(());
            }
        }

        self.line_minimum_count += 1;
        self.fill_bracket(driver, test_offset, oldstate)?;
        self.update_brackets(false);

        let newspan = self.bracket.right.offset - self.bracket.left.offset;
        self.bracket.next_to_last_min_reduction_ratio = self.bracket.last_min_reduction_ratio;
        self.bracket.last_min_reduction_ratio = newspan / span;

        // Re-run the termination test against the refreshed best point.
        let stop_gate = MU0
            * self.best().grad_norm
            * self.basept.direction_norm
            * self.bracket.angle_precision
            * (1.0 + 2.0 * self.sum_error_estimate);
        let best_ep = self.best().ep;
        if best_ep.abs() < stop_gate
            && (best_ep == 0.0 || best_ep > self.basept.ep)
            && (best_ep == 0.0
                || span <= self.bracket.stop_span
                || (nudge >= span && self.bracket.right.ep <= self.bracket.left.ep))
        {
            self.bracket.min_found = true;
            self.bestpt.is_line_minimum = true;
        } else if self.bracket.right.ep < 0.0 {
            // A weak bracket; too many in a row means the E data lies.
            self.bracket.weak_bracket_count += 1;
            if self.bracket.weak_bracket_count > 4 {
                self.bracket.bad_edata = true;
                self.bracket.weak_bracket_count = 0;
                self.bracket.min_bracketed = false; // Redo bracketing
            }
        }

        debug_assert!(
            self.bracket.left.ep < 0.0
                && (self.bracket.right.e > self.bracket.left.e || self.bracket.right.ep >= 0.0)
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // --- DIRECTION UPDATES --------------------------------------------------
    // ------------------------------------------------------------------------

    /// Computes the conjugation numerator and the new g^T P g.  For
    /// Polak-Ribiere the previous torque snapshot is refreshed in place.
    fn conjugation_sums(&mut self, _cstate: &SimState) -> CoreResult<(f64, f64)> {
        let slots = reduce_slots(crate::thread_count());
        let polak_ribiere = self.method == ConjugateMethod::PolakRibiere;
        let mut prev_mxhxm = std::mem::take(&mut self.basept.mxhxm);
        {
            let best = self.best();
            let torque = best.mxhxm.as_slice();
            let scale = self.preconditioner_ms2_v2.as_slice();
            let prev = ParallelWriter::new(prev_mxhxm.as_mut_slice());
            run_threaded(self.preconditioner_ms2_v2.array(), 1, |worker, start, stop| {
                let mut work_sum = Accumulator::default();
                let mut work_gamma = Accumulator::default();
                for i in start..stop {
                    let t = torque[i];
                    let s = scale[i];
                    work_sum += t.x * t.x * s.x;
                    work_sum += t.y * t.y * s.y;
                    work_sum += t.z * t.z * s.z;
                    if polak_ribiere {
                        let p = unsafe { prev.get_mut(i) };
                        work_gamma += (t.x - p.x) * t.x * s.x;
                        work_gamma += (t.y - p.y) * t.y * s.y;
                        work_gamma += (t.z - p.z) * t.z * s.z;
                        *p = t;
                    }
                }
                let mut slot = slots[worker].lock();
                slot.a += &work_sum;
                slot.b += &work_gamma;
            })?;
        }
        self.basept.mxhxm = prev_mxhxm;

        let mut sum = Accumulator::default();
        let mut gamma = Accumulator::default();
        for slot in &slots {
            let s = slot.lock();
            sum += &s.a;
            gamma += &s.b;
        }
        let new_g_sum_sq = sum.value();
        let gamma_numerator = if polak_ribiere { gamma.value() } else { new_g_sum_sq };
        Ok((gamma_numerator, new_g_sum_sq))
    }

    /// Direction update `d <- a*(P o torque) + b*d`, projected orthogonal to
    /// the spins.  Returns (maxmagsq, normsumsq, gradsumsq, ep_sum) where
    /// ep_sum is the raw (unsigned by -mu0) directional derivative sum.
    fn direction_update(
        &mut self,
        cstate: &SimState,
        torque_coef: f64,
        direction_coef: f64,
    ) -> CoreResult<(f64, f64, f64, f64)> {
        let slots = reduce_slots(crate::thread_count());
        let mut direction = std::mem::take(&mut self.basept.direction);
        {
            let best = self.best();
            let torque = best.mxhxm.as_slice();
            let pc = self.preconditioner_ms_v.as_slice();
            let ms_v = self.ms_v.as_slice();
            let spin = cstate.spin.as_slice();
            let dir = ParallelWriter::new(direction.as_mut_slice());
            run_threaded(self.ms_v.array(), 1, |worker, start, stop| {
                let mut maxmagsq: f64 = 0.0;
                let mut normsumsq = Accumulator::default();
                let mut gradsumsq = Accumulator::default();
                let mut ep = Accumulator::default();
                for i in start..stop {
                    let t = torque[i];
                    // The preconditioner carries Ms*V built in.
                    let mut temp = t.mul_components(&pc[i]) * torque_coef;
                    let d = unsafe { dir.get_mut(i) };
                    temp.accum(direction_coef, d);
                    // Project out the spin component; assumes |spin| == 1.
                    temp.accum(-temp.dot(&spin[i]), &spin[i]);
                    *d = temp;

                    let magsq = temp.mag_sq();
                    if magsq > maxmagsq {
                        maxmagsq = magsq;
                    }
                    normsumsq += temp.x * temp.x;
                    normsumsq += temp.y * temp.y;
                    normsumsq += temp.z * temp.z;
                    let mut work = Accumulator::new(temp.x * t.x);
                    work += temp.y * t.y;
                    work += temp.z * t.z;
                    work *= ms_v[i];
                    ep += &work;
                    gradsumsq += t.mag_sq() * ms_v[i] * ms_v[i];
                }
                let mut slot = slots[worker].lock();
                if maxmagsq > slot.maxval {
                    slot.maxval = maxmagsq;
                }
                slot.a += &normsumsq;
                slot.b += &gradsumsq;
                slot.c += &ep;
            })?;
        }
        self.basept.direction = direction;

        let mut maxmagsq: f64 = 0.0;
        let mut normsumsq = Accumulator::default();
        let mut gradsumsq = Accumulator::default();
        let mut ep = Accumulator::default();
        for slot in &slots {
            let s = slot.lock();
            maxmagsq = maxmagsq.max(s.maxval);
            normsumsq += &s.a;
            gradsumsq += &s.b;
            ep += &s.c;
        }
        Ok((maxmagsq, normsumsq.value(), gradsumsq.value(), ep.value()))
    }

    /// Restart fill `d <- P o torque` (no projection needed: the torque is
    /// already tangent).  Returns (maxmagsq, sumsq, gradsumsq, ep_sum).
    fn gradient_direction(&mut self) -> CoreResult<(f64, f64, f64, f64)> {
        let slots = reduce_slots(crate::thread_count());
        let mut direction = std::mem::take(&mut self.basept.direction);
        {
            let best = self.best();
            let torque = best.mxhxm.as_slice();
            let pc = self.preconditioner_ms_v.as_slice();
            let ms_v = self.ms_v.as_slice();
            let dir = ParallelWriter::new(direction.as_mut_slice());
            run_threaded(self.ms_v.array(), 1, |worker, start, stop| {
                let mut maxmagsq: f64 = 0.0;
                let mut sumsq = Accumulator::default();
                let mut gradsumsq = Accumulator::default();
                let mut ep = Accumulator::default();
                for i in start..stop {
                    let t = torque[i];
                    let d = t.mul_components(&pc[i]);
                    unsafe { dir.write(i, d) };

                    let mut work = Accumulator::new(d.x * t.x);
                    work += d.y * t.y;
                    work += d.z * t.z;
                    work *= ms_v[i];
                    ep += &work;
                    gradsumsq += t.mag_sq() * ms_v[i] * ms_v[i];

                    let magsq = d.mag_sq();
                    if magsq > maxmagsq {
                        maxmagsq = magsq;
                    }
                    sumsq += d.x * d.x;
                    sumsq += d.y * d.y;
                    sumsq += d.z * d.z;
                }
                let mut slot = slots[worker].lock();
                if maxmagsq > slot.maxval {
                    slot.maxval = maxmagsq;
                }
                slot.a += &sumsq;
                slot.b += &gradsumsq;
                slot.c += &ep;
            })?;
        }
        self.basept.direction = direction;

        let mut maxmagsq: f64 = 0.0;
        let mut sumsq = Accumulator::default();
        let mut gradsumsq = Accumulator::default();
        let mut ep = Accumulator::default();
        for slot in &slots {
            let s = slot.lock();
            maxmagsq = maxmagsq.max(s.maxval);
            sumsq += &s.a;
            gradsumsq += &s.b;
            ep += &s.c;
        }
        Ok((maxmagsq, sumsq.value(), gradsumsq.value(), ep.value()))
    }

    // ------------------------------------------------------------------------
    // --- BASE POINT ---------------------------------------------------------
    // ------------------------------------------------------------------------

    /// Anchors a new line search at `cstate`: loads it as the left bracket,
    /// determines the search direction (conjugated or restarted), and seeds
    /// the step scalars.
    fn set_base_point(&mut self, cstate: &StateKey) -> CoreResult<()> {
        if cstate.id() == self.basept.id && self.basept.valid {
            return Ok(()); // Already set
        }

        if self.preconditioner_mesh_id != cstate.mesh.id() {
            self.initialize_preconditioner(cstate)?;
        }

        self.cycle_count += 1;
        self.cycle_sub_count += 1;
        cstate.add_derived_data(derived::CYCLE_COUNT, self.cycle_count as f64);
        // The sub count may still reset to zero below, so its derived data
        // entry waits until the direction is settled.

        // Guess the first step of the new search from the last line minimum.
        let mut next_step_guess = 0.0;
        if self.best().state.is_some() {
            next_step_guess = self.best().offset;
            if self.bestpt.is_line_minimum
                && self.bracket.left.ep < 0.0
                && self.bracket.right.ep > 0.0
            {
                // Improve the estimate with a linear fit to the last Ep data.
                next_step_guess = (self.bracket.right.ep * self.bracket.left.offset
                    - self.bracket.left.ep * self.bracket.right.offset)
                    / (self.bracket.right.ep - self.bracket.left.ep);
            }
        }
        let last_step_is_minimum = self.bestpt.is_line_minimum;
        let last_direction_norm = self.basept.direction_norm;

        // Move the best point's data into the left bracket.
        let best_matches_cstate =
            self.best().state.as_ref().map(|s| s.id()) == Some(cstate.id());
        if best_matches_cstate {
            if self.bestpt.side == BestSide::Right {
                let (left, right) = (&mut self.bracket.left, &mut self.bracket.right);
                std::mem::swap(left, right);
            }
            self.bestpt.side = BestSide::Left;
        } else {
            // Fresh anchor: evaluate cstate into the left bracket.
            self.bracket.left.state = Some(Arc::clone(cstate));
            let mut energy = std::mem::take(&mut self.bracket.left.energy);
            let mut mxhxm = std::mem::take(&mut self.bracket.left.mxhxm);
            self.get_energy_and_mxhxm(cstate, &mut energy, &mut mxhxm, None)?;
            self.bracket.left.energy = energy;
            self.bracket.left.mxhxm = mxhxm;
            self.bestpt.side = BestSide::Left;
        }
        let edee = cstate
            .get_derived_data(derived::ENERGY_DENSITY_ERROR_ESTIMATE)
            .ok_or_else(|| {
                core_err!(ProgramLogicError, "missing energy density error estimate")
            })?;
        self.bracket.left.offset = 0.0;
        self.bracket.left.e = 0.0;
        self.bracket.left.e_error_estimate = edee * cstate.mesh.total_volume()
            / (2.0 * cstate.mesh.size().max(1) as f64).sqrt();

        // Determine the new direction.
        let restart_needed = !self.basept.valid
            || cstate.stage_number != self.basept.stage
            || self.cycle_sub_count >= self.gradient_reset_count as u64
            || self.basept.direction.size() != self.bracket.left.mxhxm.size()
            || !last_step_is_minimum;

        let mut ep = 0.0;
        if restart_needed {
            self.basept.valid = false;
            if self.method == ConjugateMethod::PolakRibiere {
                let torque_copy = self.best().mxhxm.clone();
                self.basept.mxhxm = torque_copy;
            }
        } else {
            // Conjugate: d <- P g + gamma * d_prev, with g = Ms*V*mxHxm and
            // gamma per Fletcher-Reeves or Polak-Ribiere, then re-project
            // the result orthogonal to the spins.
            let (gamma_numerator, new_g_sum_sq) = self.conjugation_sums(cstate)?;
            let gamma = gamma_numerator / self.basept.g_sum_sq;

            let (mut maxmagsq, mut normsumsq, mut gradsumsq, mut ep_sum) =
                self.direction_update(cstate, 1.0, gamma)?;
            self.bracket.left.grad_norm = gradsumsq.sqrt();

            // Evidence of conjugation fatigue: the new gradient ending up
            // nearly parallel to the previous direction (it would be exactly
            // orthogonal with perfect minimization).
            if self.best().grad_norm
                < gamma * last_direction_norm * self.gradient_reset_angle_cot
            {
                self.gradient_reset_score = self.gradient_reset_wgt * self.gradient_reset_score
                    + (1.0 - self.gradient_reset_wgt);
            } else {
                self.gradient_reset_score *= self.gradient_reset_wgt;
            }

            if self.gradient_reset_score >= self.gradient_reset_trigger {
                self.basept.valid = false;
            } else {
                // Kludge for a direction that fails the downhill test: blend
                // back toward the gradient so the angle with the torque is
                // exactly the configured fallback angle.
                let grad_norm = self.best().grad_norm;
                if ep_sum
                    <= self.kludge_adjust_angle_cos
                        * normsumsq.sqrt()
                        * grad_norm
                        * (1.0 + 8.0 * f64::EPSILON)
                {
                    let tsq = grad_norm * grad_norm;
                    let betasq = self.kludge_adjust_angle_cos
                        * self.kludge_adjust_angle_cos
                        * (1.0 + 8.0 * f64::EPSILON);
                    let qa = (1.0 - betasq) * tsq * tsq;
                    let qb = 2.0 * (1.0 - betasq) * ep_sum * tsq;
                    let qc = ep_sum * ep_sum - betasq * normsumsq * tsq;
                    let delta = qb * qb - 4.0 * qa * qc;
                    let alpha = if delta > 0.0 {
                        if qb >= 0.0 {
                            -2.0 * qc / (delta.sqrt() + qb)
                        } else {
                            (delta.sqrt() - qb) / (2.0 * qa)
                        }
                    } else {
                        // Delta should only reach zero when the direction
                        // and torque are parallel; force it and fudge.
                        let guess = if qb > 0.0 { -2.0 * qc / qb } else { -qb / (2.0 * qa) };
                        guess * (1.0 + 1024.0 * f64::EPSILON)
                    };
                    let (m2, n2, g2, e2) = self.direction_update(cstate, alpha, 1.0)?;
                    maxmagsq = m2;
                    normsumsq = n2;
                    gradsumsq = g2;
                    ep_sum = e2;
                    self.bracket.left.grad_norm = gradsumsq.sqrt();
                }
                self.basept.direction_max_mag = maxmagsq.sqrt();
                self.basept.direction_norm = normsumsq.sqrt();
                self.basept.g_sum_sq = new_g_sum_sq;
                ep = -MU0 * ep_sum;
                self.basept.ep = ep;
                self.bracket.left.ep = ep;
                // Only a downhill direction is worth keeping.
                self.basept.valid = ep < 0.0;
            }
        }

        if !self.basept.valid {
            // Restart: the direction is the preconditioned gradient.
            self.basept.direction.adjust_size(cstate.mesh.as_ref())?;
            self.cycle_sub_count = 0;
            self.conjugate_cycle_count += 1;
            self.gradient_reset_score = 0.0;

            let (maxmagsq, sumsq, gradsumsq, ep_sum) = self.gradient_direction()?;
            self.bracket.left.grad_norm = gradsumsq.sqrt();
            self.basept.direction_max_mag = maxmagsq.sqrt();
            self.basept.g_sum_sq = sumsq;
            self.basept.direction_norm = sumsq.sqrt();
            ep = -MU0 * ep_sum;
            self.basept.ep = ep;
            self.bracket.left.ep = ep;
            self.basept.valid = true;
        }

        cstate.add_derived_data(derived::CYCLE_SUB_COUNT, self.cycle_sub_count as f64);
        cstate
            .add_derived_data(derived::CONJUGATE_CYCLE_COUNT, self.conjugate_cycle_count as f64);

        // Remaining base point bookkeeping.
        self.basept.id = cstate.id();
        self.basept.stage = cstate.stage_number;
        self.basept.total_energy = cstate
            .get_derived_data(derived::TOTAL_ENERGY)
            .ok_or_else(|| core_err!(ProgramLogicError, "missing total energy"))?;

        // Arm the bracketing state.
        self.bracket.min_bracketed = false;
        self.bracket.min_found = false;
        self.bracket.bad_edata = false;
        self.bracket.weak_bracket_count = 0;

        let dmax = self.basept.direction_max_mag;
        if dmax >= 1.0 || self.bracket.maxstep < dmax * f64::MAX {
            self.bracket.scaled_minstep = self.bracket.minstep / dmax;
            self.bracket.scaled_maxstep = self.bracket.maxstep / dmax;
        } else if self.bracket.maxstep > 0.0 {
            // Safety for a (numerically) vanishing direction.
            self.bracket.scaled_maxstep = 0.5 * f64::MAX;
            self.bracket.scaled_minstep =
                self.bracket.scaled_maxstep * (self.bracket.minstep / self.bracket.maxstep);
        } else {
            self.bracket.scaled_maxstep = 0.0;
            self.bracket.scaled_minstep = 0.0;
        }

        // Size the first step to the previous line minimum; the 1.25 pushes
        // the first probe past the expected minimum so it brackets at once.
        self.bracket.start_step = self.bracket.scaled_minstep;
        if next_step_guess > 0.0 {
            let scaling_ratio = 1.25;
            if next_step_guess < f64::MAX / scaling_ratio {
                self.bracket.start_step = next_step_guess * scaling_ratio;
            }
            if self.bracket.start_step > self.bracket.scaled_maxstep {
                self.bracket.start_step = self.bracket.scaled_maxstep;
            }
        }

        // Conservative seed for the reduction restriction; 1 and 1 would be
        // maximally restrictive, 0 and 0 fully free.
        self.bracket.last_min_reduction_ratio = 1.0 / 16.0;
        self.bracket.next_to_last_min_reduction_ratio = 1.0 / 256.0;
        self.bracket.left.ep = ep;
        self.bracket.right.clear();
        self.bracket.extra.clear();
        self.bestpt.is_line_minimum = false;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // --- RECOVERY -----------------------------------------------------------
    // ------------------------------------------------------------------------

    /// Jitters every spin by a machine epsilon and rebuilds the base point
    /// from the perturbed state.  Last resort when the direction collapsed.
    fn ruffle_base_point(&mut self, driver: &dyn Driver, oldstate: &StateKey) -> CoreResult<()> {
        let mut work = oldstate.spawn_like();
        driver.fill_state_member_data(oldstate, &mut work);
        driver.fill_state_supplemental_data(&mut work);
        {
            let old_spin = oldstate.spin.as_slice();
            let spin_out = ParallelWriter::new(work.spin.as_mut_slice());
            let seed_base = oldstate.id();
            run_threaded(oldstate.spin.array(), 1, |worker, start, stop| {
                // One deterministic stream per worker; since each worker
                // always owns the same stripe, the jitter pattern does not
                // depend on scheduling.
                let mut rng = Xoshiro256StarStar::seed_from_u64(
                    seed_base ^ ((worker as u64) << 32) ^ 0x9E37_79B9_7F4A_7C15,
                );
                for i in start..stop {
                    // Not uniform on the sphere, but it does not matter.
                    let mut spin = old_spin[i];
                    spin.x += rng.random_range(-1.0..=1.0) * f64::EPSILON;
                    spin.y += rng.random_range(-1.0..=1.0) * f64::EPSILON;
                    spin.z += rng.random_range(-1.0..=1.0) * f64::EPSILON;
                    spin.make_unit();
                    unsafe { spin_out.write(i, spin) };
                }
            })?;
        }
        work.iteration_count = oldstate.iteration_count + 1;
        work.stage_iteration_count = oldstate.stage_iteration_count + 1;
        let key: StateKey = Arc::new(work);
        driver.fill_state_derived_data(oldstate, &key);

        self.basept.valid = false;
        self.set_base_point(&key)
    }

    /// Escape hatch for a line minimum that collapsed onto offset zero: the
    /// next base point pass would regenerate the same direction and the
    /// algorithm would stall, so move somewhere defensible.
    fn nudge_bestpt(&mut self, driver: &dyn Driver, oldstate: &StateKey) -> CoreResult<()> {
        debug_assert!(
            self.bracket.left.ep <= 0.0
                && (self.bracket.right.e > self.bracket.left.e || self.bracket.right.ep >= 0.0)
        );
        NUDGE_WARNING.send(
            &REVISION_INFO,
            line!(),
            &format!(
                "failure in conjugate-gradient algorithm: no movement in line \
                 minimization.  Nudging base point to attempt recovery.  \
                 (cycle_sub_count={})",
                self.cycle_sub_count
            ),
        );

        let dmax = self.basept.direction_max_mag;
        let big = f64::MAX / 2.0;
        if dmax < 1.0 && big * dmax < 4.0 * f64::EPSILON {
            // The direction is numerically zero; twiddle the spins instead.
            return self.ruffle_base_point(driver, oldstate);
        }
        let nudge = 4.0 * f64::EPSILON / dmax;

        let mut test_offset = 0.5;
        if self.bracket.right.ep > 0.0 {
            if -self.bracket.left.ep
                < test_offset * (self.bracket.right.ep - self.bracket.left.ep)
            {
                test_offset =
                    -self.bracket.left.ep / (self.bracket.right.ep - self.bracket.left.ep);
            }
        } else {
            // Ep data is uninformative; rely on the nudge floor below.
            test_offset = 0.0;
        }
        // Scale the guess to the interval, halved to err on the safe side.
        test_offset *= self.bracket.right.offset / 2.0;
        if test_offset < nudge {
            test_offset = nudge;
        }

        self.line_minimum_count += 1;
        self.fill_bracket(driver, test_offset, oldstate)?;
        self.update_brackets(true);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // --- STEPPING -----------------------------------------------------------
    // ------------------------------------------------------------------------

    /// Performs one unit of progress on the minimization and returns the
    /// best state observed so far.  Inspect `Max mxHxm` in the returned
    /// state's derived data for convergence.
    pub fn try_step(&mut self, driver: &dyn Driver, current: &StateKey) -> CoreResult<StateKey> {
        self.step_attempt_count += 1;
        if self.step_attempt_count == 1 {
            // Resync counters from the state, so restarts from checkpointed
            // states continue their counts instead of starting over.
            let resync = [
                (derived::ENERGY_CALC_COUNT, &mut self.energy_calc_count),
                (derived::CYCLE_COUNT, &mut self.cycle_count),
                (derived::CYCLE_SUB_COUNT, &mut self.cycle_sub_count),
                (derived::BRACKET_COUNT, &mut self.bracket_count),
                (derived::LINE_MIN_COUNT, &mut self.line_minimum_count),
                (derived::CONJUGATE_CYCLE_COUNT, &mut self.conjugate_cycle_count),
            ];
            for (key, counter) in resync {
                if let Some(v) = current.get_derived_data(key) {
                    *counter = v as u64;
                }
            }
        }

        if !self.basept.valid
            || self.basept.stage != current.stage_number
            || self.bracket.min_found
        {
            self.set_base_point(current)?;
        }

        if !self.bracket.min_bracketed {
            self.find_bracket_step(driver, current)?;
        } else if !self.bracket.min_found {
            self.find_line_minimum_step(driver, current)?;
            if self.bracket.min_found && self.best().offset == 0.0 {
                if self.cycle_sub_count == 0 {
                    self.nudge_bestpt(driver, current)?;
                } else {
                    // Let the next conjugation restart take a fresh look
                    // before resorting to a nudge.
                    self.basept.valid = false;
                    self.set_base_point(current)?;
                }
            }
        }

        self.best()
            .state
            .clone()
            .ok_or_else(|| core_err!(ProgramLogicError, "step finished without a best state"))
    }

    // ------------------------------------------------------------------------
    // --- OUTPUTS ------------------------------------------------------------
    // ------------------------------------------------------------------------

    /// Fills the scalar outputs for `state`, evaluating the energy once if
    /// the state was produced outside this evolver.
    pub fn update_derived_outputs(&mut self, state: &StateKey) -> CoreResult<DerivedOutputs> {
        if state.get_derived_data(derived::TOTAL_ENERGY).is_none()
            || state.get_derived_data(derived::MAX_MXHXM).is_none()
        {
            let mut energy = std::mem::take(&mut self.total_energy_density_output.value);
            let mut mxhxm = std::mem::take(&mut self.mxhxm_output.value);
            self.get_energy_and_mxhxm(state, &mut energy, &mut mxhxm, None)?;
            self.total_energy_density_output.value = energy;
            self.mxhxm_output.value = mxhxm;
        }

        let total_energy = state
            .get_derived_data(derived::TOTAL_ENERGY)
            .ok_or_else(|| core_err!(ProgramLogicError, "missing total energy output"))?;
        let last_energy =
            state.get_derived_data(derived::LAST_ENERGY).unwrap_or(total_energy);

        // The cycle counts are filled by set_base_point; a state that never
        // anchored a search reports the evolver's running values.
        let read_or = |key: &str, fallback: u64| {
            state.get_derived_data(key).unwrap_or(fallback as f64)
        };

        Ok(DerivedOutputs {
            max_mxhxm: state.get_derived_data(derived::MAX_MXHXM).unwrap_or(0.0),
            total_energy,
            delta_e: total_energy - last_energy,
            bracket_count: read_or(derived::BRACKET_COUNT, self.bracket_count),
            line_min_count: read_or(derived::LINE_MIN_COUNT, self.line_minimum_count),
            cycle_count: read_or(derived::CYCLE_COUNT, self.cycle_count),
            cycle_sub_count: read_or(derived::CYCLE_SUB_COUNT, self.cycle_sub_count),
            conjugate_cycle_count: read_or(
                derived::CONJUGATE_CYCLE_COUNT,
                self.conjugate_cycle_count,
            ),
            energy_calc_count: read_or(derived::ENERGY_CALC_COUNT, self.energy_calc_count),
        })
    }

    /// Fills whichever field output caches have requests registered and are
    /// stale for `state`.
    pub fn update_derived_field_outputs(&mut self, state: &StateKey) -> CoreResult<()> {
        let want_h = self.total_h_field_output.requested();
        let need = (want_h && self.total_h_field_output.state_id != state.id())
            || (self.total_energy_density_output.requested()
                && self.total_energy_density_output.state_id != state.id())
            || (self.mxhxm_output.requested() && self.mxhxm_output.state_id != state.id());
        if !need {
            return Ok(());
        }
        self.total_energy_density_output.state_id = 0;
        self.mxhxm_output.state_id = 0;
        self.total_h_field_output.state_id = 0;

        let mut energy = std::mem::take(&mut self.total_energy_density_output.value);
        let mut mxhxm = std::mem::take(&mut self.mxhxm_output.value);
        let mut h = std::mem::take(&mut self.total_h_field_output.value);
        let result = self.get_energy_and_mxhxm(
            state,
            &mut energy,
            &mut mxhxm,
            if want_h { Some(&mut h) } else { None },
        );
        self.total_energy_density_output.value = energy;
        self.mxhxm_output.value = mxhxm;
        self.total_h_field_output.value = h;
        result?;

        self.total_energy_density_output.state_id = state.id();
        self.mxhxm_output.state_id = state.id();
        if want_h {
            self.total_h_field_output.state_id = state.id();
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// --- FIT HELPERS ------------------------------------------------------------
// ----------------------------------------------------------------------------

/// Least-squares quadratic fit to `(f0, fh, fp0, fph)` over `[0, h]`,
/// returning the position of its minimum.  `wgt` balances the direct f data
/// against the derivative data; 0 ignores f0 and fh entirely.  When the fit
/// is linear or concave there is no minimum and `f64::MAX` comes back.
fn estimate_quadratic_minimum(wgt: f64, h: f64, f0: f64, fh: f64, fp0: f64, fph: f64) -> f64 {
    debug_assert!((0.0..=1.0).contains(&wgt) && h > 0.0);
    let fdiff = fh - f0;
    let fpdiff = fph - fp0;

    // The x^2 coefficient is 0.5*h*fpdiff: a proper minimum needs it > 0.
    if fpdiff <= 0.0 {
        return f64::MAX;
    }

    let numer = wgt * (0.5 * fpdiff - h * fdiff) - 4.0 * (1.0 - wgt) * fp0;
    let denom = (wgt * h * h + 4.0 * (1.0 - wgt)) * fpdiff;

    if denom >= 1.0 || h * numer < f64::MAX * denom {
        // Multiplying by h last slightly helps the wgt = 0 case.
        (numer / denom) * h
    } else {
        f64::MAX
    }
}

#[inline]
fn signum1(x: f64) -> f64 {
    if x >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// Position of the minimum of the cubic with values `0`/`ediff` and
/// derivatives `l_ep`/`r_ep` at the interval ends (unit span).
fn find_cubic_minimum(ediff: f64, l_ep: f64, r_ep: f64) -> f64 {
    debug_assert!(l_ep < 0.0 && (r_ep > 0.0 || ediff >= 0.0));

    let a = -2.0 * ediff + l_ep + r_ep;
    let b = 3.0 * ediff - 2.0 * l_ep - r_ep;
    let c = l_ep;

    if a == 0.0 {
        // Quadratic
        if b != 0.0 {
            // Safety check; b should be >= -c/2 > 0.
            return -c / (2.0 * b);
        }
        return 0.5;
    }
    let mut disc = b * b - 3.0 * a * c;
    // A negative discriminant is rounding noise on a double root.
    disc = if disc <= 0.0 { 0.0 } else { disc.sqrt() };
    // Stable quadratic-root branches: never subtract nearly equal values.
    if b >= 0.0 {
        if c.abs() >= b + disc {
            signum1(-c)
        } else {
            -c / (b + disc)
        }
    } else if 3.0 * a.abs() <= -b + disc {
        signum1(a)
    } else {
        (-b + disc) / (3.0 * a)
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

/// The solver module is hard to unit test in pieces, so the configuration
/// handling is unit tested and the stepping machinery is validated on a
/// small problem with a known solution: a biaxial anisotropy energy, which
/// restricted to the unit sphere is exactly an elliptical quadratic bowl.
#[cfg(test)]
mod test_evolver {
    use super::*;
    use crate::abstraction::{EnergyAccumulator, Mesh, RectangularMesh, SimpleDriver};
    use crate::implementation::threads::pool;

    /// E = ka*mx^2 + kb*my^2 per unit volume; minima at m = +-z.
    struct BiaxialEnergy {
        ka: f64,
        kb: f64,
    }
    impl EnergyTerm for BiaxialEnergy {
        fn name(&self) -> &str {
            "biaxial"
        }
        fn accumulate(&self, acc: &mut EnergyAccumulator<'_>) -> CoreResult<()> {
            let spin = acc.state.spin.as_slice();
            let ms = acc.state.ms.as_slice();
            for i in 0..spin.len() {
                let m = spin[i];
                acc.energy[i] += self.ka * m.x * m.x + self.kb * m.y * m.y;
                let hscale = -2.0 / (MU0 * ms[i]);
                acc.field[i] += Vector3::new(
                    hscale * self.ka * m.x,
                    hscale * self.kb * m.y,
                    0.0,
                );
            }
            Ok(())
        }
        fn increment_preconditioner(
            &self,
            _state: &SimState,
            diag: &mut MeshValue<Vector3>,
        ) -> bool {
            for slot in diag.as_mut_slice() {
                *slot += Vector3::new(2.0 * self.ka, 2.0 * self.kb, 0.0);
            }
            true
        }
    }

    fn problem(
        start: Vector3,
    ) -> (StateKey, Vec<Arc<dyn EnergyTerm>>) {
        let mesh = Arc::new(RectangularMesh::new((1, 1, 1), (1e-8, 1e-8, 1e-8)));
        let mut ms = MeshValue::with_size(1).unwrap();
        ms.fill(8e5);
        let mut spin = MeshValue::with_size(1).unwrap();
        let mut m = start;
        m.make_unit();
        spin[0] = m;
        let state = Arc::new(SimState::new(mesh, Arc::new(ms), spin));
        let terms: Vec<Arc<dyn EnergyTerm>> =
            vec![Arc::new(BiaxialEnergy { ka: 1e4, kb: 1e3 })];
        (state, terms)
    }

    fn minimize(
        evolver: &mut CgEvolver,
        mut state: StateKey,
        tol: f64,
        max_steps: usize,
    ) -> (StateKey, usize) {
        let driver = SimpleDriver;
        for step in 0..max_steps {
            let next = evolver.try_step(&driver, &state).unwrap();
            // Acceptable-step invariant: left always points downhill, and
            // the right endpoint (once set) closes the bracket.
            assert!(evolver.bracket.left.ep <= 0.0);
            if evolver.bracket.min_bracketed && evolver.bracket.right.is_set() {
                assert!(
                    evolver.bracket.right.ep >= 0.0
                        || evolver.bracket.right.e >= evolver.bracket.left.e
                        || evolver.bracket.bad_edata
                        || evolver.bracket.min_found
                );
            }
            state = next;
            if let Some(torque) = state.get_derived_data(derived::MAX_MXHXM) {
                if torque < tol {
                    return (state, step + 1);
                }
            }
        }
        let torque = state.get_derived_data(derived::MAX_MXHXM);
        panic!("no convergence in {max_steps} steps; torque = {torque:?}");
    }

    #[test]
    fn parameter_validation() {
        let params = CgParamsBuilder::default()
            .preconditioner_weight(2.0)
            .build()
            .unwrap();
        assert!(CgEvolver::new(params, Vec::new()).is_err());

        let params = CgParamsBuilder::default()
            .minimum_bracket_step(20.0)
            .maximum_bracket_step(10.0)
            .build()
            .unwrap();
        assert!(CgEvolver::new(params, Vec::new()).is_err());

        // Defaults build and convert.
        let evolver = CgEvolver::new(CgParams::default(), Vec::new()).unwrap();
        assert!(evolver.bracket.minstep > 0.0);
        assert!(evolver.bracket.minstep < evolver.bracket.maxstep);
        assert!((evolver.bracket.angle_precision - 1f64.to_radians().sin()).abs() < 1e-15);
    }

    #[test]
    fn cubic_minimum_is_stable_on_both_branches() {
        // Symmetric bowl: minimum at the center.
        assert!((find_cubic_minimum(0.0, -1.0, 1.0) - 0.5).abs() < 1e-14);
        // Steep on the right: minimum shifts left.
        assert!(find_cubic_minimum(0.5, -0.1, 4.0) < 0.5);
        // Negative discriminant noise clamps instead of NaN.
        let v = find_cubic_minimum(1.0, -1e-18, 3.0);
        assert!(v.is_finite() && (0.0..=1.0).contains(&v));
    }

    #[test]
    fn quadratic_estimate_handles_degenerate_data() {
        // No curvature in the derivative data: no minimum.
        assert_eq!(f64::MAX, estimate_quadratic_minimum(0.5, 1.0, 0.0, -1.0, -1.0, -1.0));
        // Pure derivative fit (wgt = 0) of a symmetric bowl.
        let m = estimate_quadratic_minimum(0.0, 2.0, 0.0, 0.0, -1.0, 1.0);
        assert!((m - 1.0).abs() < 1e-14);
    }

    #[test]
    fn converges_on_the_elliptical_quadratic() {
        let _serial = crate::test_support::serial();
        pool::init_threads(4).unwrap();

        // Fletcher-Reeves with the blended diagonal preconditioner, started
        // in the hard corner of the bowl.
        let params = CgParamsBuilder::default()
            .method(ConjugateMethod::FletcherReeves)
            .preconditioner(PreconditionerType::Diagonal)
            .preconditioner_weight(0.5)
            .build()
            .unwrap();
        let (state, terms) = problem(Vector3::new(1.0, 1.0, 0.02));
        let start_energy_density = {
            // ka*mx^2 + kb*my^2 at the normalized start
            let m = state.spin[0];
            1e4 * m.x * m.x + 1e3 * m.y * m.y
        };
        let mut evolver = CgEvolver::new(params, terms).unwrap();
        let (final_state, steps) = minimize(&mut evolver, Arc::clone(&state), 1e-10, 200);

        // Converged to one of the +-z minima.
        let m = final_state.spin[0];
        assert!(m.z.abs() > 1.0 - 1e-12, "final spin {m:?} after {steps} steps");

        // The energy went essentially to zero (minimum of the bowl).
        let outputs = evolver.update_derived_outputs(&final_state).unwrap();
        let volume = 1e-24;
        assert!(outputs.total_energy.abs() < 1e-8 * start_energy_density * volume);
        assert!(outputs.max_mxhxm < 1e-10);

        // The line-search effort stays modest on a quadratic bowl.
        assert!(
            outputs.cycle_count <= 40.0,
            "took {} cycles, {} line mins",
            outputs.cycle_count,
            outputs.line_min_count
        );
    }

    #[test]
    fn delta_e_tracks_the_energy_drop() {
        let _serial = crate::test_support::serial();
        pool::init_threads(4).unwrap();

        let params = CgParamsBuilder::default().build().unwrap();
        let (state, terms) = problem(Vector3::new(1.0, 0.5, 0.2));
        let mut evolver = CgEvolver::new(params, terms).unwrap();
        let driver = SimpleDriver;

        // Every total energy ever observed; "Last energy" of any state the
        // evolver hands back must be one of them, because SimpleDriver
        // stamps it from the predecessor at state creation.
        let mut seen = vec![];
        let mut prev = Arc::clone(&state);
        let mut decreases = 0;
        for _ in 0..40 {
            let next = evolver.try_step(&driver, &prev).unwrap();
            if next.id() != prev.id() {
                if let Some(e) = prev.get_derived_data(derived::TOTAL_ENERGY) {
                    seen.push(e);
                }
                let outputs = evolver.update_derived_outputs(&next).unwrap();
                let last = next
                    .get_derived_data(derived::LAST_ENERGY)
                    .expect("work states carry their predecessor's energy");
                assert!(
                    seen.iter().any(|&e| e == last),
                    "last energy {last} does not match any observed total"
                );
                // Delta E is the plain difference of totals.
                let expect = outputs.total_energy - last;
                assert!(
                    (outputs.delta_e - expect).abs()
                        <= 1e-14 * outputs.total_energy.abs().max(last.abs()),
                    "delta_e = {}, expected {}",
                    outputs.delta_e,
                    expect
                );
                if outputs.delta_e < 0.0 {
                    decreases += 1;
                }
                prev = next;
            }
        }
        assert!(decreases > 0, "the energy never decreased");
    }

    #[test]
    fn polak_ribiere_also_converges() {
        let _serial = crate::test_support::serial();
        pool::init_threads(4).unwrap();

        let params = CgParamsBuilder::default()
            .method(ConjugateMethod::PolakRibiere)
            .preconditioner(PreconditionerType::MsV)
            .build()
            .unwrap();
        let (state, terms) = problem(Vector3::new(-1.0, 0.7, 0.1));
        let mut evolver = CgEvolver::new(params, terms).unwrap();
        let (final_state, _steps) = minimize(&mut evolver, state, 1e-9, 300);
        assert!(final_state.spin[0].z.abs() > 1.0 - 1e-10);
    }

    #[test]
    fn same_thread_count_reproduces_bitwise() {
        let _serial = crate::test_support::serial();
        pool::init_threads(4).unwrap();

        let run = || {
            let params = CgParamsBuilder::default().build().unwrap();
            let (state, terms) = problem(Vector3::new(1.0, 1.0, 0.05));
            let mut evolver = CgEvolver::new(params, terms).unwrap();
            let driver = SimpleDriver;
            let mut state = state;
            for _ in 0..25 {
                state = evolver.try_step(&driver, &state).unwrap();
            }
            state.spin[0]
        };
        let a = run();
        let b = run();
        assert_eq!(a.x.to_bits(), b.x.to_bits());
        assert_eq!(a.y.to_bits(), b.y.to_bits());
        assert_eq!(a.z.to_bits(), b.z.to_bits());
    }
}
