use crate::device::{Device, Slice};
use crate::error::Result;
use crate::gpu::Gpu;
use crate::solvers::{StepContext, StepOutcome};

/// The physical model: supplies the right-hand side of the Landau-Lifshitz
/// equation for the current state.
pub trait TorqueProvider<D: Device> {
    /// Writes the torque (dm/dt divided by the gyromagnetic ratio, in tesla)
    /// for state `m` at `time` into the 3-component field `dst`.
    fn torque(&mut self, gpu: &Gpu<D>, time: f64, m: &Slice, dst: &Slice) -> Result<()>;

    /// Projects the state back onto unit vectors. Models with holes in the
    /// geometry override this to keep empty cells at zero.
    fn normalize(&mut self, gpu: &Gpu<D>, m: &Slice) {
        gpu.normalize(m);
    }

    /// Whether the torque at the end of one step may be reused as the first
    /// stage of the next. Stochastic (thermal) models must return `false`.
    fn fsal_valid(&self) -> bool {
        true
    }

    /// Called when relaxation starts and ends; models typically drop the
    /// precessional term while relaxing.
    fn set_relaxing(&mut self, _relaxing: bool) {}
}

/// A single-step integration scheme.
pub trait Stepper<D: Device> {
    /// Attempts one step of the size held by the controller. A rejected step
    /// leaves state and time as they were.
    fn step(&mut self, cx: &mut StepContext<'_, D>) -> Result<StepOutcome>;

    /// Releases any state carried between steps.
    fn free(&mut self, _gpu: &Gpu<D>) {}
}
