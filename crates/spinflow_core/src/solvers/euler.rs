use crate::device::Device;
use crate::error::{Result, SolverError};
use crate::solvers::{StepContext, StepOutcome};
use crate::traits::Stepper;

/// Forward Euler. Never rejects a step. Without a fixed step, `max_err` is
/// read as the largest change of any spin in one step, which overestimates
/// the true error.
#[derive(Debug, Default, Clone, Copy)]
pub struct Euler;

impl<D: Device> Stepper<D> for Euler {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        let gpu = cx.gpu;
        let m = cx.m;
        let dy0 = gpu.buffer(3, m.len())?;

        cx.torque(&dy0)?;
        cx.set_max_torque(&dy0);

        let t0 = *cx.time;
        if cx.ctrl.fix_dt() == 0.0 {
            let dt = cx.ctrl.max_err() / cx.stats.last_torque / cx.gamma_ll;
            cx.ctrl.set_dt(dt);
            cx.ctrl.clamp_to_bounds();
        }
        let dt_si = cx.ctrl.begin_step(t0);
        if !(dt_si > 0.0) || !dt_si.is_finite() {
            return Err(SolverError::InvalidTimeStep(format!(
                "Euler solver needs a positive, finite step, got {dt_si} s; set a fixed step for torque-free states"
            )));
        }
        let h = cx.internal_step(dt_si)?;
        cx.stats.set_last_err(h as f64 * cx.stats.last_torque);

        gpu.madd2(m, m, &dy0, 1.0, h);
        cx.normalize();
        *cx.time = cx.ctrl.end_time(t0);
        cx.stats.n_steps += 1;
        Ok(StepOutcome::Accepted)
    }
}
