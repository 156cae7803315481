use crate::device::Device;
use crate::error::Result;
use crate::solvers::{StepContext, StepOutcome};
use crate::traits::Stepper;

/// Classical 4th-order Runge-Kutta. There is no embedded pair; the spread
/// between first and last stage serves as error estimate.
#[derive(Debug, Default, Clone, Copy)]
pub struct RungeKutta;

impl<D: Device> Stepper<D> for RungeKutta {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        let gpu = cx.gpu;
        let m = cx.m;
        let n = m.len();
        let t0 = *cx.time;
        let dt_si = cx.ctrl.begin_step(t0);
        let h = cx.internal_step(dt_si)?;

        let m0 = gpu.buffer(3, n)?;
        gpu.copy(&m0, m);
        let k1 = gpu.buffer(3, n)?;
        let k2 = gpu.buffer(3, n)?;
        let k3 = gpu.buffer(3, n)?;
        let k4 = gpu.buffer(3, n)?;

        cx.torque(&k1)?;

        *cx.time = t0 + 0.5 * dt_si;
        gpu.madd2(m, m, &k1, 1.0, 0.5 * h);
        cx.normalize();
        cx.torque(&k2)?;

        gpu.madd2(m, &m0, &k2, 1.0, 0.5 * h);
        cx.normalize();
        cx.torque(&k3)?;

        *cx.time = t0 + dt_si;
        gpu.madd2(m, &m0, &k3, 1.0, h);
        cx.normalize();
        cx.torque(&k4)?;

        let err = gpu.max_vec_diff(&k1, &k4) * h as f64;

        if cx.ctrl.accepts(err) {
            gpu.madd5(
                m,
                [&m0, &k1, &k2, &k3, &k4],
                [1.0, h / 6.0, h / 3.0, h / 3.0, h / 6.0],
            );
            cx.normalize();
            cx.accept(err, 4.0, t0, &k4)
        } else {
            cx.reject(err, 5.0, t0, &m0)
        }
    }
}
