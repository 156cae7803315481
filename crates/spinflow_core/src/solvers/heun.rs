use crate::device::Device;
use crate::error::Result;
use crate::solvers::{StepContext, StepOutcome};
use crate::traits::Stepper;

/// Heun's method, 2nd order, with the Euler predictor as embedded 1st-order estimate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Heun;

impl<D: Device> Stepper<D> for Heun {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        let gpu = cx.gpu;
        let m = cx.m;
        let n = m.len();
        let t0 = *cx.time;
        let dt_si = cx.ctrl.begin_step(t0);
        let h = cx.internal_step(dt_si)?;

        let m0 = gpu.buffer(3, n)?;
        gpu.copy(&m0, m);
        let dy0 = gpu.buffer(3, n)?;
        let dy = gpu.buffer(3, n)?;

        cx.torque(&dy0)?;
        gpu.madd2(m, m, &dy0, 1.0, h);
        cx.normalize();

        *cx.time = t0 + dt_si;
        cx.torque(&dy)?;

        let err = gpu.max_vec_diff(&dy0, &dy) * h as f64;
        if cx.ctrl.accepts(err) {
            gpu.madd3(m, [&m0, &dy0, &dy], [1.0, 0.5 * h, 0.5 * h]);
            cx.normalize();
            cx.accept(err, 2.0, t0, &dy)
        } else {
            cx.reject(err, 3.0, t0, &m0)
        }
    }
}
