use crate::device::Device;
use crate::error::Result;
use crate::solvers::{StepContext, StepOutcome};
use crate::traits::Stepper;

const E: f32 = (5.0 / 66.0) as f32;

/// Eight-stage Fehlberg-type 6(5) pair. Stage 7 is evaluated at the start of
/// the step. No stage carries over, so every step costs eight evaluations
/// plus one at the accepted state for the torque statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fehlberg;

impl<D: Device> Stepper<D> for Fehlberg {
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
        let k5 = gpu.buffer(3, n)?;
        let k6 = gpu.buffer(3, n)?;
        let k7 = gpu.buffer(3, n)?;
        let k8 = gpu.buffer(3, n)?;

        cx.torque(&k1)?;

        *cx.time = t0 + (1.0 / 6.0) * dt_si;
        gpu.madd2(m, m, &k1, 1.0, (1.0 / 6.0) * h);
        cx.normalize();
        cx.torque(&k2)?;

        *cx.time = t0 + (4.0 / 15.0) * dt_si;
        gpu.madd3(m, [&m0, &k1, &k2], [1.0, (4.0 / 75.0) * h, (16.0 / 75.0) * h]);
        cx.normalize();
        cx.torque(&k3)?;

        *cx.time = t0 + (2.0 / 3.0) * dt_si;
        gpu.madd4(
            m,
            [&m0, &k1, &k2, &k3],
            [1.0, (5.0 / 6.0) * h, (-8.0 / 3.0) * h, (5.0 / 2.0) * h],
        );
        cx.normalize();
        cx.torque(&k4)?;

        *cx.time = t0 + (4.0 / 5.0) * dt_si;
        gpu.madd5(
            m,
            [&m0, &k1, &k2, &k3, &k4],
            [
                1.0,
                (-8.0 / 5.0) * h,
                (144.0 / 25.0) * h,
                -4.0 * h,
                (16.0 / 25.0) * h,
            ],
        );
        cx.normalize();
        cx.torque(&k5)?;

        *cx.time = t0 + dt_si;
        gpu.madd6(
            m,
            [&m0, &k1, &k2, &k3, &k4, &k5],
            [
                1.0,
                (361.0 / 320.0) * h,
                (-18.0 / 5.0) * h,
                (407.0 / 128.0) * h,
                (-11.0 / 80.0) * h,
                (55.0 / 128.0) * h,
            ],
        );
        cx.normalize();
        cx.torque(&k6)?;

        *cx.time = t0;
        gpu.madd5(
            m,
            [&m0, &k1, &k3, &k4, &k5],
            [
                1.0,
                (-11.0 / 640.0) * h,
                (11.0 / 256.0) * h,
                (-11.0 / 160.0) * h,
                (11.0 / 256.0) * h,
            ],
        );
        cx.normalize();
        cx.torque(&k7)?;

        *cx.time = t0 + dt_si;
        gpu.madd7(
            m,
            [&m0, &k1, &k2, &k3, &k4, &k5, &k7],
            [
                1.0,
                (93.0 / 640.0) * h,
                (-18.0 / 5.0) * h,
                (803.0 / 256.0) * h,
                (-11.0 / 160.0) * h,
                (99.0 / 256.0) * h,
                h,
            ],
        );
        cx.normalize();
        cx.torque(&k8)?;

        gpu.madd7(
            m,
            [&m0, &k1, &k3, &k4, &k5, &k7, &k8],
            [
                1.0,
                (7.0 / 1408.0) * h,
                (1125.0 / 2816.0) * h,
                (9.0 / 32.0) * h,
                (125.0 / 768.0) * h,
                (5.0 / 66.0) * h,
                (5.0 / 66.0) * h,
            ],
        );
        cx.normalize();
        let tau = &k2;
        cx.torque(tau)?;

        let err_field = gpu.buffer(3, n)?;
        gpu.madd4(&err_field, [&k1, &k6, &k7, &k8], [-E, -E, E, E]);
        let err = gpu.max_vec_norm(&err_field) * h as f64;

        if cx.ctrl.accepts(err) {
            cx.accept(err, 6.0, t0, tau)
        } else {
            cx.reject(err, 7.0, t0, &m0)
        }
    }
}
