use crate::device::Device;
use crate::error::Result;
use crate::gpu::Gpu;
use crate::solvers::{CarriedStage, StepContext, StepOutcome};
use crate::traits::Stepper;

// 5th-order weights (b) and their difference with the embedded 4th-order ones.
const B1: f32 = (35.0 / 384.0) as f32;
const B3: f32 = (500.0 / 1113.0) as f32;
const B4: f32 = (125.0 / 192.0) as f32;
const B5: f32 = (-2187.0 / 6784.0) as f32;
const B6: f32 = (11.0 / 84.0) as f32;
const E1: f32 = (35.0 / 384.0 - 5179.0 / 57600.0) as f32;
const E3: f32 = (500.0 / 1113.0 - 7571.0 / 16695.0) as f32;
const E4: f32 = (125.0 / 192.0 - 393.0 / 640.0) as f32;
const E5: f32 = (-2187.0 / 6784.0 + 92097.0 / 339200.0) as f32;
const E6: f32 = (11.0 / 84.0 - 187.0 / 2100.0) as f32;
const E7: f32 = (-1.0 / 40.0) as f32;

/// Dormand-Prince 5(4), first-same-as-last.
#[derive(Debug, Default)]
pub struct DormandPrince {
    pub(crate) k1: CarriedStage,
}

impl<D: Device> Stepper<D> for DormandPrince {
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome> {
        let gpu = cx.gpu;
        let m = cx.m;
        let n = m.len();
        let t0 = *cx.time;
        let dt_si = cx.ctrl.begin_step(t0);
        let h = cx.internal_step(dt_si)?;

        let k1 = self.k1.first_stage(cx)?;

        let m0 = gpu.buffer(3, n)?;
        gpu.copy(&m0, m);
        let k2 = gpu.buffer(3, n)?;
        let k3 = gpu.buffer(3, n)?;
        let k4 = gpu.buffer(3, n)?;
        let k5 = gpu.buffer(3, n)?;
        let k6 = gpu.buffer(3, n)?;

        *cx.time = t0 + (1.0 / 5.0) * dt_si;
        gpu.madd2(m, m, k1, 1.0, (1.0 / 5.0) * h);
        cx.normalize();
        cx.torque(&k2)?;

        *cx.time = t0 + (3.0 / 10.0) * dt_si;
        gpu.madd3(m, [&m0, k1, &k2], [1.0, (3.0 / 40.0) * h, (9.0 / 40.0) * h]);
        cx.normalize();
        cx.torque(&k3)?;

        *cx.time = t0 + (4.0 / 5.0) * dt_si;
        gpu.madd4(
            m,
            [&m0, k1, &k2, &k3],
            [1.0, (44.0 / 45.0) * h, (-56.0 / 15.0) * h, (32.0 / 9.0) * h],
        );
        cx.normalize();
        cx.torque(&k4)?;

        *cx.time = t0 + (8.0 / 9.0) * dt_si;
        gpu.madd5(
            m,
            [&m0, k1, &k2, &k3, &k4],
            [
                1.0,
                (19372.0 / 6561.0) * h,
                (-25360.0 / 2187.0) * h,
                (64448.0 / 6561.0) * h,
                (-212.0 / 729.0) * h,
            ],
        );
        cx.normalize();
        cx.torque(&k5)?;

        *cx.time = t0 + dt_si;
        gpu.madd6(
            m,
            [&m0, k1, &k2, &k3, &k4, &k5],
            [
                1.0,
                (9017.0 / 3168.0) * h,
                (-355.0 / 33.0) * h,
                (46732.0 / 5247.0) * h,
                (49.0 / 176.0) * h,
                (-5103.0 / 18656.0) * h,
            ],
        );
        cx.normalize();
        cx.torque(&k6)?;

        // 5th-order solution; its torque, k7, lands in k2.
        gpu.madd6(
            m,
            [&m0, k1, &k3, &k4, &k5, &k6],
            [1.0, B1 * h, B3 * h, B4 * h, B5 * h, B6 * h],
        );
        cx.normalize();
        let k7 = &k2;
        cx.torque(k7)?;

        let err_field = gpu.buffer(3, n)?;
        gpu.madd6(
            &err_field,
            [k1, &k3, &k4, &k5, &k6, k7],
            [E1, E3, E4, E5, E6, E7],
        );
        let err = gpu.max_vec_norm(&err_field) * h as f64;

        if cx.ctrl.accepts(err) {
            gpu.copy(k1, k7);
            cx.accept(err, 5.0, t0, k7)
        } else {
            let outcome = cx.reject(err, 6.0, t0, &m0);
            self.k1.invalidate();
            outcome
        }
    }

    fn free(&mut self, gpu: &Gpu<D>) {
        self.k1.free(gpu);
    }
}
