//! The `spinflow_core` crate integrates the Landau-Lifshitz equation forward in
//! time on device-resident magnetization fields.
//!
//! Key components:
//! - **Traits**: `TorqueProvider` (the physical model) and `Stepper` (integration schemes).
//! - **Device**: the `Device` kernel seam, the `BufferArena` of scratch fields and the `Gpu` context.
//! - **Solvers**: Euler, backward Euler, Heun, Bogacki-Shampine, RK4, Dormand-Prince and RK56,
//!   sharing one step-size controller.
//! - **Run loop**: `Solver` with timed and conditional runs, relaxation, post-step hooks,
//!   periodic output and task injection from other threads.
pub mod arena;
pub mod autosave;
pub mod controller;
pub mod device;
pub mod error;
pub mod gpu;
pub mod run;
pub mod settings;
pub mod solvers;
pub mod stats;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use device::{Device, HostDevice, Slice};
pub use error::{ErrorKind, Result, SolverError};
pub use gpu::Gpu;
pub use run::{Injector, RunState, Solver};
pub use settings::{Method, SolverSettings};
pub use solvers::StepOutcome;
pub use stats::Statistics;
pub use traits::{Stepper, TorqueProvider};
