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

//! Diagonal preconditioner setup, re-run whenever the mesh identity
//! changes.
//!
//! Three kinds are supported: none (C^-2 = (Ms V)^2), Ms V scaling, and the
//! energy-term supplied diagonal.  For the latter, every term is asked to
//! increment the raw diagonal; terms without the capability are skipped with
//! a warning.  The raw diagonal is then blended against the Ms V scaling
//! with the configured convex weight and protected against division by
//! small, and both the applied diagonal and its square are cached.

use parking_lot::Mutex;

use crate::abstraction::Mesh;
use crate::implementation::threads::pool::run_threaded;
use crate::warn::{RevisionInfo, WarningMessage};
use crate::{core_err, CoreResult, SimState, Vector3};

use super::evolver::{CgEvolver, PreconditionerType};

static REVISION_INFO: RevisionInfo =
    RevisionInfo::new(file!(), "2.0", "2020-06-30", "xgillard");
static NO_CAPABILITY_WARNING: WarningMessage = WarningMessage::new(-1);

impl CgEvolver {
    /// (Re)builds the preconditioner caches for the mesh of `state`.
    ///
    /// This assumes per-cell Ms and volumes do not change without a mesh
    /// identity change; if that assumption ever breaks, the caller must
    /// force a rebuild itself.
    pub(super) fn initialize_preconditioner(&mut self, state: &SimState) -> CoreResult<()> {
        self.preconditioner_mesh_id = 0; // Work in progress

        let mesh = state.mesh.as_ref();
        let size = mesh.size();
        self.preconditioner_ms_v.adjust_size(mesh)?;
        self.preconditioner_ms2_v2.adjust_size(mesh)?;
        self.ms_v.adjust_size(mesh)?;

        let ms = state.ms.as_slice();

        // Stage one: the raw diagonal.
        let mut init_ok = false;
        match self.preconditioner_type {
            PreconditionerType::None => {}
            PreconditionerType::MsV => {
                for (slot, &ms_i) in
                    self.preconditioner_ms_v.as_mut_slice().iter_mut().zip(ms)
                {
                    let val = if ms_i == 0.0 { 0.0 } else { 1.0 };
                    *slot = Vector3::new(val, val, val);
                }
                init_ok = true;
            }
            PreconditionerType::Diagonal => {
                self.preconditioner_ms_v.fill(Vector3::ZERO);
                let mut count = 0;
                let terms = std::mem::take(&mut self.energy_terms);
                for term in &terms {
                    if term.increment_preconditioner(state, &mut self.preconditioner_ms_v) {
                        count += 1;
                    } else {
                        NO_CAPABILITY_WARNING.send(
                            &REVISION_INFO,
                            line!(),
                            &format!(
                                "energy term {:?} does not support diagonal \
                                 preconditioning",
                                term.name()
                            ),
                        );
                    }
                }
                self.energy_terms = terms;
                init_ok = count != 0;
            }
        }

        // Stage two: scan for the scaling maxima (and for invalid entries).
        let mut maxval = 0.0f64;
        let mut maxval_ms_v = 0.0f64;
        if init_ok {
            let worker_count = crate::thread_count();
            let max_slots: Vec<Mutex<(f64, f64)>> =
                (0..worker_count).map(|_| Mutex::new((0.0, 0.0))).collect();
            let negative = Mutex::new(false);
            {
                let raw = self.preconditioner_ms_v.as_slice();
                run_threaded(self.preconditioner_ms_v.array(), 1, |worker, start, stop| {
                    let mut local_max: f64 = 0.0;
                    let mut local_max_ms_v: f64 = 0.0;
                    for i in start..stop {
                        let v = raw[i];
                        if v.x < 0.0 || v.y < 0.0 || v.z < 0.0 {
                            *negative.lock() = true;
                            return;
                        }
                        let tmp = v.max_component();
                        local_max = local_max.max(tmp);
                        local_max_ms_v = local_max_ms_v.max(tmp * ms[i] * mesh.volume(i));
                    }
                    let mut slot = max_slots[worker].lock();
                    slot.0 = slot.0.max(local_max);
                    slot.1 = slot.1.max(local_max_ms_v);
                })?;
            }
            if *negative.lock() {
                return Err(core_err!(
                    BadData,
                    "invalid preconditioner: negative value detected"
                ));
            }
            for slot in &max_slots {
                let (a, b) = *slot.lock();
                maxval = maxval.max(a);
                maxval_ms_v = maxval_ms_v.max(b);
            }
            if maxval == 0.0 {
                init_ok = false; // Preconditioner matrix all zeroes
            }
        }

        // Stage three: blend and cache.
        if init_ok {
            let pw = self.preconditioner_weight;
            let cpw = 1.0 - pw;
            let mut raw = std::mem::take(&mut self.preconditioner_ms_v);
            let mut squared = std::mem::take(&mut self.preconditioner_ms2_v2);
            let mut ms_v = std::mem::take(&mut self.ms_v);
            {
                use crate::implementation::storage::mesh_value::ParallelWriter;
                let raw_w = ParallelWriter::new(raw.as_mut_slice());
                let sq_w = ParallelWriter::new(squared.as_mut_slice());
                let msv_w = ParallelWriter::new(ms_v.as_mut_slice());
                run_threaded(state.spin.array(), 1, |_worker, start, stop| {
                    for i in start..stop {
                        let scale = ms[i] * mesh.volume(i);
                        unsafe { msv_w.write(i, scale) };
                        if scale < 1.0 && maxval_ms_v > f64::MAX * scale {
                            // Cells with Ms == 0 carry no spin; zero them out.
                            unsafe {
                                raw_w.write(i, Vector3::ZERO);
                                sq_w.write(i, Vector3::ZERO);
                            }
                            continue;
                        }
                        let c0 = maxval_ms_v * cpw / scale;
                        let raw_i = unsafe { raw_w.get_mut(i) };
                        let blend = |raw_comp: f64| {
                            let c = c0 + pw * raw_comp;
                            if c >= 1.0 || maxval < f64::MAX * c {
                                maxval / c
                            } else {
                                1.0 // Division-by-small protection
                            }
                        };
                        let cx = blend(raw_i.x);
                        let cy = blend(raw_i.y);
                        let cz = blend(raw_i.z);
                        *raw_i = Vector3::new(cx, cy, cz);
                        unsafe {
                            sq_w.write(i, Vector3::new(scale * cx, scale * cy, scale * cz))
                        };
                    }
                })?;
            }
            self.preconditioner_ms_v = raw;
            self.preconditioner_ms2_v2 = squared;
            self.ms_v = ms_v;
        } else {
            // No usable diagonal: C^-2 reduces to (Ms V)^2.
            let mut plain = std::mem::take(&mut self.preconditioner_ms_v);
            let mut squared = std::mem::take(&mut self.preconditioner_ms2_v2);
            let mut ms_v = std::mem::take(&mut self.ms_v);
            {
                use crate::implementation::storage::mesh_value::ParallelWriter;
                let plain_w = ParallelWriter::new(plain.as_mut_slice());
                let sq_w = ParallelWriter::new(squared.as_mut_slice());
                let msv_w = ParallelWriter::new(ms_v.as_mut_slice());
                run_threaded(state.spin.array(), 1, |_worker, start, stop| {
                    for i in start..stop {
                        let scale = ms[i] * mesh.volume(i);
                        unsafe {
                            msv_w.write(i, scale);
                            plain_w.write(i, Vector3::new(scale, scale, scale));
                            let sq = scale * scale;
                            sq_w.write(i, Vector3::new(sq, sq, sq));
                        }
                    }
                })?;
            }
            self.preconditioner_ms_v = plain;
            self.preconditioner_ms2_v2 = squared;
            self.ms_v = ms_v;
        }

        self.sum_error_estimate = f64::EPSILON * (size as f64).sqrt();
        self.preconditioner_mesh_id = mesh.id();
        Ok(())
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_preconditioner {
    use std::sync::Arc;

    use super::super::evolver::{CgEvolver, CgParams, PreconditionerType};
    use crate::abstraction::{EnergyAccumulator, EnergyTerm, Mesh, RectangularMesh};
    use crate::{CoreResult, MeshValue, SimState, Vector3};

    struct FlatTerm;
    impl EnergyTerm for FlatTerm {
        fn name(&self) -> &str {
            "flat"
        }
        fn accumulate(&self, _acc: &mut EnergyAccumulator<'_>) -> CoreResult<()> {
            Ok(())
        }
        fn increment_preconditioner(
            &self,
            _state: &SimState,
            diag: &mut MeshValue<Vector3>,
        ) -> bool {
            for slot in diag.as_mut_slice() {
                *slot += Vector3::new(4.0, 2.0, 1.0);
            }
            true
        }
    }

    struct NegativeTerm;
    impl EnergyTerm for NegativeTerm {
        fn name(&self) -> &str {
            "negative"
        }
        fn accumulate(&self, _acc: &mut EnergyAccumulator<'_>) -> CoreResult<()> {
            Ok(())
        }
        fn increment_preconditioner(
            &self,
            _state: &SimState,
            diag: &mut MeshValue<Vector3>,
        ) -> bool {
            for slot in diag.as_mut_slice() {
                *slot += Vector3::new(-1.0, 0.0, 0.0);
            }
            true
        }
    }

    fn state() -> Arc<SimState> {
        let mesh = Arc::new(RectangularMesh::new((2, 2, 1), (1e-9, 1e-9, 1e-9)));
        let mut ms = MeshValue::with_size(4).unwrap();
        ms.fill(8e5);
        let mut spin = MeshValue::with_size(4).unwrap();
        spin.fill(Vector3::new(0.0, 0.0, 1.0));
        Arc::new(SimState::new(mesh, Arc::new(ms), spin))
    }

    fn evolver(kind: PreconditionerType, pw: f64, terms: Vec<Arc<dyn EnergyTerm>>) -> CgEvolver {
        let params = CgParams {
            preconditioner: kind,
            preconditioner_weight: pw,
            ..CgParams::default()
        };
        CgEvolver::new(params, terms).unwrap()
    }

    #[test]
    fn none_falls_back_to_ms_v_scaling() {
        let _serial = crate::test_support::serial();
        let state = state();
        let mut ev = evolver(PreconditionerType::None, 0.5, Vec::new());
        ev.initialize_preconditioner(&state).unwrap();
        let scale = 8e5 * 1e-27;
        assert!((ev.ms_v[0] - scale).abs() < 1e-40);
        assert!((ev.preconditioner_ms_v[0].x - scale).abs() < 1e-40);
        assert!((ev.preconditioner_ms2_v2[0].x - scale * scale).abs() < 1e-55);
        assert!(ev.sum_error_estimate > 0.0);
        assert_eq!(state.mesh.id(), ev.preconditioner_mesh_id);
    }

    #[test]
    fn diagonal_blends_toward_the_largest_entry() {
        let _serial = crate::test_support::serial();
        let state = state();
        let mut ev =
            evolver(PreconditionerType::Diagonal, 1.0, vec![Arc::new(FlatTerm)]);
        ev.initialize_preconditioner(&state).unwrap();
        // With pw = 1 the blend is maxval/raw: (1, 2, 4) componentwise.
        let v = ev.preconditioner_ms_v[0];
        assert!((v.x - 1.0).abs() < 1e-12);
        assert!((v.y - 2.0).abs() < 1e-12);
        assert!((v.z - 4.0).abs() < 1e-12);
    }

    #[test]
    fn negative_diagonal_is_rejected() {
        let _serial = crate::test_support::serial();
        let state = state();
        let mut ev =
            evolver(PreconditionerType::Diagonal, 0.5, vec![Arc::new(NegativeTerm)]);
        let err = ev.initialize_preconditioner(&state).unwrap_err();
        assert_eq!(crate::ErrorKind::BadData, err.kind);
    }

    #[test]
    fn diagonal_without_capable_terms_warns_and_degrades() {
        let _serial = crate::test_support::serial();
        struct Mute;
        impl EnergyTerm for Mute {
            fn name(&self) -> &str {
                "mute"
            }
            fn accumulate(&self, _acc: &mut EnergyAccumulator<'_>) -> CoreResult<()> {
                Ok(())
            }
        }
        let state = state();
        let mut ev = evolver(PreconditionerType::Diagonal, 0.5, vec![Arc::new(Mute)]);
        ev.initialize_preconditioner(&state).unwrap();
        // Degraded to the plain Ms V scaling.
        let scale = 8e5 * 1e-27;
        assert!((ev.preconditioner_ms_v[0].x - scale).abs() < 1e-40);
        crate::warn::transmit_message_hold();
    }
}
