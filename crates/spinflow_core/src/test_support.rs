//! Host-side Landau-Lifshitz model of non-interacting spins in a uniform field.

use crate::device::{HostDevice, Slice};
use crate::error::{Result, SolverError};
use crate::gpu::Gpu;
use crate::run::Solver;
use crate::settings::SolverSettings;
use crate::traits::TorqueProvider;
use nalgebra::Vector3;

pub(crate) struct Macrospin {
    /// Applied field in tesla.
    pub(crate) field: Vector3<f64>,
    pub(crate) alpha: f64,
    pub(crate) relaxing: bool,
    /// Pretend to be a thermal model: the carried torque may not be reused.
    pub(crate) stochastic: bool,
    /// Every torque evaluation fails, as a lost device would.
    pub(crate) failing: bool,
}

impl Macrospin {
    /// Field of `b` tesla along +z with damping `alpha`.
    pub(crate) fn precession(b: f64, alpha: f64) -> Self {
        Self {
            field: Vector3::new(0.0, 0.0, b),
            alpha,
            relaxing: false,
            stochastic: false,
            failing: false,
        }
    }

    pub(crate) fn torque_at(&self, m: &Vector3<f64>) -> Vector3<f64> {
        let mxb = m.cross(&self.field);
        let damping = m.cross(&mxb);
        if self.relaxing {
            return -damping;
        }
        -(mxb + self.alpha * damping) / (1.0 + self.alpha * self.alpha)
    }

    /// Closed-form solution for a field along +z: the azimuth turns at
    /// `γB/(1+α²)` while `tan(θ/2)` decays as `exp(-αγBt/(1+α²))`.
    pub(crate) fn exact(&self, m0: &Vector3<f64>, t: f64, gamma: f64) -> Vector3<f64> {
        let b = self.field.z;
        let rate = gamma * b / (1.0 + self.alpha * self.alpha);
        let theta0 = m0.z.clamp(-1.0, 1.0).acos();
        let phi0 = m0.y.atan2(m0.x);
        let theta = 2.0 * ((theta0 / 2.0).tan() * (-self.alpha * rate * t).exp()).atan();
        let phi = phi0 + rate * t;
        Vector3::new(
            theta.sin() * phi.cos(),
            theta.sin() * phi.sin(),
            theta.cos(),
        )
    }
}

impl TorqueProvider<HostDevice> for Macrospin {
    fn torque(&mut self, gpu: &Gpu<HostDevice>, _time: f64, m: &Slice, dst: &Slice) -> Result<()> {
        if self.failing {
            return Err(SolverError::Device("torque kernel failed".to_string()));
        }
        let comps = gpu.download(m);
        let mut out = vec![vec![0.0f32; m.len()]; 3];
        for i in 0..m.len() {
            let mi = Vector3::new(comps[0][i] as f64, comps[1][i] as f64, comps[2][i] as f64);
            let tau = self.torque_at(&mi);
            for c in 0..3 {
                out[c][i] = tau[c] as f32;
            }
        }
        for (c, data) in out.iter().enumerate() {
            gpu.upload(dst, c, data);
        }
        Ok(())
    }

    fn fsal_valid(&self) -> bool {
        !self.stochastic
    }

    fn set_relaxing(&mut self, relaxing: bool) {
        self.relaxing = relaxing;
    }
}

/// A single-cell solver.
pub(crate) fn macrospin(settings: SolverSettings, model: Macrospin) -> Solver<HostDevice, Macrospin> {
    Solver::new(HostDevice::new(), model, [1, 1, 1], settings).expect("solver should build")
}

/// The state of the first cell.
pub(crate) fn spin(solver: &Solver<HostDevice, Macrospin>) -> Vector3<f64> {
    let m = solver.magnetization()[0];
    Vector3::new(m[0] as f64, m[1] as f64, m[2] as f64)
}
