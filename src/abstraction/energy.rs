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

//! The energy collaborator contract: what a term must provide for the
//! minimizer to consume it, and the driver routine that sums a set of terms
//! into the quantities the minimizer actually reduces.

use std::sync::Arc;

use crate::implementation::storage::mesh_value::ParallelWriter;
use crate::implementation::threads::pool;
use crate::{core_err, derived, CoreResult, MeshValue, SimState, Vector3};

use super::Mesh;

/// Accumulation target handed to each energy term.  Terms add their energy
/// density and effective field contributions; they must never overwrite.
pub struct EnergyAccumulator<'a> {
    /// The state being evaluated.
    pub state: &'a SimState,
    /// Per-cell energy density, accumulated across terms.
    pub energy: &'a mut MeshValue<f64>,
    /// Per-cell effective field H, accumulated across terms.
    pub field: &'a mut MeshValue<Vector3>,
    /// Accumulated dE/dt of explicitly time dependent terms.  Minimization
    /// requires this to end at zero.
    pub pe_pt: f64,
    /// Accumulated estimate of the rounding error in one cell's energy
    /// density.  Terms that do not track their own error may leave it
    /// untouched; a fallback estimate is derived from the totals.
    pub energy_density_error_estimate: f64,
}

/// One term of the energy functional.
pub trait EnergyTerm: Send + Sync {
    /// Display name, used in warnings and error messages.
    fn name(&self) -> &str;

    /// Adds this term's energy density and field into the accumulator.
    fn accumulate(&self, acc: &mut EnergyAccumulator<'_>) -> CoreResult<()>;

    /// Adds this term's diagonal preconditioner contribution into `diag`,
    /// returning true on success.  Terms without explicit support keep the
    /// default and are skipped (with a one-time warning) by the
    /// `diagonal` preconditioner setup.
    fn increment_preconditioner(
        &self,
        _state: &SimState,
        _diag: &mut MeshValue<Vector3>,
    ) -> bool {
        false
    }
}

/// Scalar outputs of [compute_energies].
#[derive(Debug, Clone, Copy, Default)]
pub struct ComputeEnergiesOutput {
    /// Largest |m x H x m| over the mesh.
    pub max_mxhxm: f64,
    /// Estimate of the rounding error in one cell's accumulated energy
    /// density.
    pub energy_density_error_estimate: f64,
    /// Accumulated explicit time dependence; nonzero is an error for
    /// minimization and is surfaced by the caller.
    pub pe_pt: f64,
}

/// Evaluates the sum of `terms` on `state`: fills the per-cell energy
/// density and torque `m x H x m`, optionally exports the total field, and
/// returns the scalar summary.  Term callouts run sequentially on the
/// master; the torque formation and maximum reduction run on the pool.
pub fn compute_energies(
    state: &SimState,
    terms: &[Arc<dyn EnergyTerm>],
    energy: &mut MeshValue<f64>,
    mxhxm: &mut MeshValue<Vector3>,
    mut h_out: Option<&mut MeshValue<Vector3>>,
    scratch_field: &mut MeshValue<Vector3>,
) -> CoreResult<ComputeEnergiesOutput> {
    let mesh = state.mesh.as_ref();
    energy.adjust_size(mesh)?;
    mxhxm.adjust_size(mesh)?;
    scratch_field.adjust_size(mesh)?;
    if let Some(h) = h_out.as_mut() {
        h.adjust_size(mesh)?;
    }
    energy.fill(0.0);
    scratch_field.fill(Vector3::ZERO);

    let (pe_pt, mut error_estimate) = {
        let mut acc = EnergyAccumulator {
            state,
            energy: &mut *energy,
            field: &mut *scratch_field,
            pe_pt: 0.0,
            energy_density_error_estimate: 0.0,
        };
        for term in terms {
            term.accumulate(&mut acc)
                .map_err(|mut e| {
                    e.prepend(&format!("energy term {:?}: ", term.name()));
                    e
                })?;
        }
        (acc.pe_pt, acc.energy_density_error_estimate)
    };

    // Torque formation and reductions, one stripe per worker.
    // Note: (m x H) x m = m x (H x m) = -m x (m x H).
    let worker_count = pool::thread_count();
    let max_slots: Vec<parking_lot::Mutex<f64>> =
        (0..worker_count).map(|_| parking_lot::Mutex::new(0.0)).collect();
    let abs_energy_slots: Vec<parking_lot::Mutex<f64>> =
        (0..worker_count).map(|_| parking_lot::Mutex::new(0.0)).collect();
    {
        let spin = state.spin.as_slice();
        let field = scratch_field.as_slice();
        let energy = energy.as_slice();
        let torque = ParallelWriter::new(mxhxm.as_mut_slice());
        let h_copy = h_out.as_mut().map(|h| ParallelWriter::new(h.as_mut_slice()));
        pool::run_threaded(state.spin.array(), 1, |worker, start, stop| {
            let mut max_magsq: f64 = 0.0;
            let mut max_abs_e: f64 = 0.0;
            for i in start..stop {
                let m = spin[i];
                let h = field[i];
                let mxh = m.cross(&h);
                let t = mxh.cross(&m);
                // Workers write disjoint stripes.
                unsafe { torque.write(i, t) };
                if let Some(out) = &h_copy {
                    unsafe { out.write(i, h) };
                }
                max_magsq = max_magsq.max(t.mag_sq());
                max_abs_e = max_abs_e.max(energy[i].abs());
            }
            let mut slot = max_slots[worker].lock();
            *slot = slot.max(max_magsq);
            let mut slot = abs_energy_slots[worker].lock();
            *slot = slot.max(max_abs_e);
        })?;
    }
    let max_mxhxm = max_slots
        .iter()
        .fold(0.0f64, |acc, slot| acc.max(*slot.lock()))
        .sqrt();
    if error_estimate == 0.0 {
        // No term supplied its own estimate; assume each accumulated density
        // is good to a rounding of its magnitude.
        let max_abs_e = abs_energy_slots.iter().fold(0.0f64, |acc, s| acc.max(*s.lock()));
        error_estimate = max_abs_e * f64::EPSILON;
    }

    Ok(ComputeEnergiesOutput { max_mxhxm, energy_density_error_estimate: error_estimate, pe_pt })
}

/// Convenience wrapper raising the time dependence error the way every
/// minimizer call site needs it.
pub fn compute_energies_static(
    state: &SimState,
    terms: &[Arc<dyn EnergyTerm>],
    energy: &mut MeshValue<f64>,
    mxhxm: &mut MeshValue<Vector3>,
    h_out: Option<&mut MeshValue<Vector3>>,
    scratch_field: &mut MeshValue<Vector3>,
) -> CoreResult<ComputeEnergiesOutput> {
    let out = compute_energies(state, terms, energy, mxhxm, h_out, scratch_field)?;
    if out.pe_pt != 0.0 {
        return Err(core_err!(
            BadUserInput,
            "at least one energy term is time varying; this property is not \
             supported by minimization evolvers"
        ));
    }
    state.add_derived_data(derived::MAX_MXHXM, out.max_mxhxm);
    state.add_derived_data(
        derived::ENERGY_DENSITY_ERROR_ESTIMATE,
        out.energy_density_error_estimate,
    );
    Ok(out)
}
