use crate::device::Device;
use crate::error::Result;
use crate::gpu::Gpu;
use crate::solvers::{CarriedStage, StepContext, StepOutcome};
use crate::traits::Stepper;

// 3rd-order weights minus the embedded 2nd-order ones.
const E1: f32 = (7.0 / 24.0 - 2.0 / 9.0) as f32;
const E2: f32 = (1.0 / 4.0 - 1.0 / 3.0) as f32;
const E3: f32 = (1.0 / 3.0 - 4.0 / 9.0) as f32;
const E4: f32 = (1.0 / 8.0) as f32;

/// Bogacki-Shampine 3(2). The last stage is the first of the next step.
#[derive(Debug, Default)]
pub struct BogackiShampine {
    pub(crate) k1: CarriedStage,
}

impl<D: Device> Stepper<D> for BogackiShampine {
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

        *cx.time = t0 + 0.5 * dt_si;
        gpu.madd2(m, m, k1, 1.0, 0.5 * h);
        cx.normalize();
        cx.torque(&k2)?;

        *cx.time = t0 + 0.75 * dt_si;
        gpu.madd2(m, &m0, &k2, 1.0, 0.75 * h);
        cx.normalize();
        cx.torque(&k3)?;

        gpu.madd4(
            m,
            [&m0, k1, &k2, &k3],
            [1.0, (2.0 / 9.0) * h, (1.0 / 3.0) * h, (4.0 / 9.0) * h],
        );
        cx.normalize();

        *cx.time = t0 + dt_si;
        cx.torque(&k4)?;

        // k2 is free again and holds the error field.
        gpu.madd4(&k2, [k1, &k2, &k3, &k4], [E1, E2, E3, E4]);
        let err = gpu.max_vec_norm(&k2) * h as f64;

        if cx.ctrl.accepts(err) {
            gpu.copy(k1, &k4);
            cx.accept(err, 3.0, t0, &k4)
        } else {
            let outcome = cx.reject(err, 4.0, t0, &m0);
            self.k1.invalidate();
            outcome
        }
    }

    fn free(&mut self, gpu: &Gpu<D>) {
        self.k1.free(gpu);
    }
}
