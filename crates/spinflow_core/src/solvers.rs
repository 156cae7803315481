//! The stepper family.
//!
//! All schemes share one protocol: back up the state, evaluate stages while
//! renormalizing the state after every write (the torque is only defined for
//! unit vectors), estimate the error from the embedded pair, then either
//! commit the step or restore the backup and shrink the step.

pub mod backward_euler;
pub mod euler;
pub mod heun;
pub mod rk23;
pub mod rk4;
pub mod rk45;
pub mod rk56;

pub use backward_euler::BackwardEuler;
pub use euler::Euler;
pub use heun::Heun;
pub use rk23::BogackiShampine;
pub use rk4::RungeKutta;
pub use rk45::DormandPrince;
pub use rk56::Fehlberg;

use crate::controller::StepController;
use crate::device::{Device, Slice};
use crate::error::{Result, SolverError};
use crate::gpu::Gpu;
use crate::settings::Method;
use crate::stats::Statistics;
use crate::traits::{Stepper, TorqueProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
}

/// Everything a stepper may read or change during one step.
pub struct StepContext<'a, D: Device> {
    pub gpu: &'a Gpu<D>,
    pub model: &'a mut dyn TorqueProvider<D>,
    /// The state being integrated.
    pub m: &'a Slice,
    pub time: &'a mut f64,
    pub ctrl: &'a mut StepController,
    pub stats: &'a mut Statistics,
    pub gamma_ll: f64,
}

impl<D: Device> StepContext<'_, D> {
    /// Evaluates the torque for the current state and time into `dst`.
    pub fn torque(&mut self, dst: &Slice) -> Result<()> {
        self.model.torque(self.gpu, *self.time, self.m, dst)?;
        self.stats.n_evals += 1;
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.model.normalize(self.gpu, self.m);
    }

    pub fn set_max_torque(&mut self, tau: &Slice) {
        self.stats.last_torque = self.gpu.max_vec_norm(tau);
    }

    /// Step size in internal units, `dt · γ`, as used by the kernels.
    pub fn internal_step(&self, dt_si: f64) -> Result<f32> {
        let h = (dt_si * self.gamma_ll) as f32;
        if h == 0.0 {
            return Err(SolverError::TimeStepUnderflow);
        }
        if !(h > 0.0) || !h.is_finite() {
            return Err(SolverError::InvalidTimeStep(format!(
                "internal time step must be positive and finite, got {h}"
            )));
        }
        Ok(h)
    }

    /// Books an accepted adaptive step: statistics, time, next step size.
    pub fn accept(&mut self, err: f64, exponent: f64, t0: f64, tau: &Slice) -> Result<StepOutcome> {
        if err >= self.ctrl.max_err() && self.ctrl.fix_dt() == 0.0 {
            log::warn!(
                "accepting step at t = {t0:e} s with error {err:e} at the minimum time step {:e} s",
                self.ctrl.dt()
            );
        }
        self.stats.set_last_err(err);
        self.set_max_torque(tau);
        self.stats.n_steps += 1;
        *self.time = self.ctrl.end_time(t0);
        let corr = self.ctrl.correction(exponent, err);
        self.ctrl.apply_correction(corr, *self.time)?;
        Ok(StepOutcome::Accepted)
    }

    /// Undoes a step: restores `backup` and `t0`, shrinks the step.
    pub fn reject(
        &mut self,
        err: f64,
        exponent: f64,
        t0: f64,
        backup: &Slice,
    ) -> Result<StepOutcome> {
        debug_assert!(self.ctrl.fix_dt() == 0.0, "cannot undo a fixed step");
        log::debug!(
            "bad step at t = {t0:e} s: error {err:e} > {:e}, dt = {:e} s",
            self.ctrl.max_err(),
            self.ctrl.dt()
        );
        *self.time = t0;
        self.gpu.copy(self.m, backup);
        self.stats.n_undone += 1;
        let corr = self.ctrl.correction(exponent, err);
        self.ctrl.apply_correction(corr, t0)?;
        Ok(StepOutcome::Rejected)
    }
}

/// A torque field kept from one step to the next.
#[derive(Debug, Default)]
pub struct CarriedStage {
    slice: Option<Slice>,
    valid: bool,
}

/// Returns a buffer of `len` cells from `slot`, replacing one of another size
/// (the mesh was resized). The flag tells whether the buffer is new.
fn reserve<'s, D: Device>(
    slot: &'s mut Option<Slice>,
    gpu: &Gpu<D>,
    len: usize,
) -> Result<(&'s Slice, bool)> {
    let (slice, fresh) = match slot.take() {
        Some(slice) if slice.len() == len => (slice, false),
        stale => {
            if let Some(stale) = stale {
                log::debug!("dropping carried stage of stale size {}", stale.len());
                gpu.free_slice(stale);
            }
            (gpu.new_slice(3, len)?, true)
        }
    };
    Ok((slot.insert(slice), fresh))
}

impl CarriedStage {
    /// Makes sure a buffer of the state's size exists. A new buffer starts out invalid.
    pub(crate) fn ensure<D: Device>(&mut self, gpu: &Gpu<D>, len: usize) -> Result<&Slice> {
        let CarriedStage { slice, valid } = self;
        let (slice, fresh) = reserve(slice, gpu, len)?;
        if fresh {
            *valid = false;
        }
        Ok(slice)
    }

    /// Returns the first stage of the step about to start, re-evaluating it
    /// unless the value carried over from the previous step can be trusted.
    pub(crate) fn first_stage<D: Device>(&mut self, cx: &mut StepContext<'_, D>) -> Result<&Slice> {
        let CarriedStage { slice, valid } = self;
        let (k1, fresh) = reserve(slice, cx.gpu, cx.m.len())?;
        let reuse = *valid && !fresh && cx.model.fsal_valid();
        if !reuse {
            *valid = false;
            cx.torque(k1)?;
            *valid = true;
        }
        Ok(k1)
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid && self.slice.is_some()
    }

    pub(crate) fn mark_valid(&mut self) {
        self.valid = true;
    }

    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn free<D: Device>(&mut self, gpu: &Gpu<D>) {
        if let Some(slice) = self.slice.take() {
            gpu.free_slice(slice);
        }
        self.valid = false;
    }

    pub fn is_allocated(&self) -> bool {
        self.slice.is_some()
    }
}

/// The stepper currently driving a solver.
#[derive(Debug)]
pub enum ActiveStepper {
    BackwardEuler(BackwardEuler),
    Euler(Euler),
    Heun(Heun),
    BogackiShampine(BogackiShampine),
    RungeKutta(RungeKutta),
    DormandPrince(DormandPrince),
    Fehlberg(Fehlberg),
}

impl ActiveStepper {
    pub fn new(method: Method) -> Self {
        match method {
            Method::BackwardEuler => ActiveStepper::BackwardEuler(BackwardEuler::default()),
            Method::Euler => ActiveStepper::Euler(Euler),
            Method::Heun => ActiveStepper::Heun(Heun),
            Method::BogackiShampine => ActiveStepper::BogackiShampine(BogackiShampine::default()),
            Method::RungeKutta => ActiveStepper::RungeKutta(RungeKutta),
            Method::DormandPrince => ActiveStepper::DormandPrince(DormandPrince::default()),
            Method::Fehlberg => ActiveStepper::Fehlberg(Fehlberg),
        }
    }

    pub fn method(&self) -> Method {
        match self {
            ActiveStepper::BackwardEuler(_) => Method::BackwardEuler,
            ActiveStepper::Euler(_) => Method::Euler,
            ActiveStepper::Heun(_) => Method::Heun,
            ActiveStepper::BogackiShampine(_) => Method::BogackiShampine,
            ActiveStepper::RungeKutta(_) => Method::RungeKutta,
            ActiveStepper::DormandPrince(_) => Method::DormandPrince,
            ActiveStepper::Fehlberg(_) => Method::Fehlberg,
        }
    }

    /// Forces the next step to re-evaluate its first stage. Needed whenever the
    /// state, the time or the model changes outside a step.
    pub fn invalidate_carried(&mut self) {
        match self {
            ActiveStepper::BackwardEuler(s) => s.previous.invalidate(),
            ActiveStepper::BogackiShampine(s) => s.k1.invalidate(),
            ActiveStepper::DormandPrince(s) => s.k1.invalidate(),
            _ => {}
        }
    }

    /// The torque carried into the next step, if this scheme keeps one.
    pub fn carried(&self) -> Option<&CarriedStage> {
        match self {
            ActiveStepper::BackwardEuler(s) => Some(&s.previous),
            ActiveStepper::BogackiShampine(s) => Some(&s.k1),
            ActiveStepper::DormandPrince(s) => Some(&s.k1),
            _ => None,
        }
    }
}

impl<D: Device> Stepper<D> for ActiveStepper {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        match self {
            ActiveStepper::BackwardEuler(s) => s.step(cx),
            ActiveStepper::Euler(s) => s.step(cx),
            ActiveStepper::Heun(s) => s.step(cx),
            ActiveStepper::BogackiShampine(s) => s.step(cx),
            ActiveStepper::RungeKutta(s) => s.step(cx),
            ActiveStepper::DormandPrince(s) => s.step(cx),
            ActiveStepper::Fehlberg(s) => s.step(cx),
        }
    }

    fn free(&mut self, gpu: &Gpu<D>) {
        match self {
            ActiveStepper::BackwardEuler(s) => Stepper::<D>::free(s, gpu),
            ActiveStepper::BogackiShampine(s) => Stepper::<D>::free(s, gpu),
            ActiveStepper::DormandPrince(s) => Stepper::<D>::free(s, gpu),
            _ => {}
        }
    }
}
