use crate::device::Device;
use crate::error::{Result, SolverError};
use crate::gpu::Gpu;
use crate::solvers::{CarriedStage, StepContext, StepOutcome};
use crate::traits::Stepper;

/// Implicit midpoint rule solved with a single fixed-point iteration.
///
/// The torque of the previous step serves as predictor when the model allows
/// reuse. Only fixed steps are supported and no step is ever rejected; the
/// error estimate is informational.
#[derive(Debug, Default)]
pub struct BackwardEuler {
    pub(crate) previous: CarriedStage,
}

impl<D: Device> Stepper<D> for BackwardEuler {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        if !(cx.ctrl.max_err() > 0.0) {
            return Err(SolverError::InvalidTimeStep(
                "backward Euler solver requires max_err > 0".to_string(),
            ));
        }
        if !(cx.ctrl.fix_dt() > 0.0) {
            return Err(SolverError::InvalidTimeStep(
                "backward Euler solver requires a fixed time step > 0".to_string(),
            ));
        }

        let gpu = cx.gpu;
        let m = cx.m;
        let n = m.len();
        let t0 = *cx.time;
        let dt_si = cx.ctrl.begin_step(t0);
        let h = cx.internal_step(dt_si)?;

        let y0 = gpu.buffer(3, n)?;
        gpu.copy(&y0, m);
        let dy0 = gpu.buffer(3, n)?;

        let predict = self.previous.is_valid() && cx.model.fsal_valid();
        let dy1 = self.previous.ensure(gpu, n)?;

        // Evaluating at the midpoint makes this the implicit midpoint rule.
        *cx.time = t0 + 0.5 * dt_si;
        if predict {
            gpu.madd2(m, &y0, dy1, 1.0, h);
            cx.normalize();
        }

        cx.torque(&dy0)?;
        gpu.madd2(m, &y0, &dy0, 1.0, h);
        cx.normalize();

        cx.torque(dy1)?;
        gpu.madd2(m, &y0, dy1, 1.0, h);
        cx.normalize();

        *cx.time = t0 + dt_si;

        let err = gpu.max_vec_diff(&dy0, dy1) * h as f64;
        cx.stats.n_steps += 1;
        cx.stats.set_last_err(err);
        cx.set_max_torque(dy1);
        self.previous.mark_valid();
        Ok(StepOutcome::Accepted)
    }

    fn free(&mut self, gpu: &Gpu<D>) {
        self.previous.free(gpu);
    }
}
