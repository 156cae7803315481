//! Fatal error conditions of the integration engine.
//!
//! Step rejection is not an error and never travels through this type:
//! steppers report it as [`crate::solvers::StepOutcome::Rejected`].

use thiserror::Error;

/// Broad classification of a [`SolverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller broke a contract (unknown stepper, bad buffer shape, foreign handle).
    Contract,
    /// A resource ceiling was hit; treated as a leak signal.
    Resource,
    /// The time step degenerated.
    Numerical,
    /// The device backend failed.
    Device,
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("unknown solver type: {0}")]
    UnknownStepper(i32),

    #[error("invalid buffer shape: {ncomp} components of {len} cells")]
    InvalidBufferShape { ncomp: usize, len: usize },

    #[error("recycle: buffer was not obtained from this arena")]
    ForeignBuffer,

    #[error("recycle: buffer handle is stale (arena was cleared or buffer already recycled)")]
    StaleBuffer,

    #[error("too many buffers in use ({live} live of {len} cells, limit {max}), possible memory leak")]
    BufferLeak { len: usize, live: usize, max: usize },

    #[error("time step too small, check if parameters are sensible")]
    TimeStepUnderflow,

    #[error("invalid time step: {0}")]
    InvalidTimeStep(String),

    #[error("invalid solver settings: {0}")]
    InvalidSettings(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("solver is no longer accepting tasks")]
    SolverGone,
}

impl SolverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SolverError::UnknownStepper(_)
            | SolverError::InvalidBufferShape { .. }
            | SolverError::ForeignBuffer
            | SolverError::StaleBuffer
            | SolverError::InvalidTimeStep(_)
            | SolverError::InvalidSettings(_)
            | SolverError::SolverGone => ErrorKind::Contract,
            SolverError::BufferLeak { .. } => ErrorKind::Resource,
            SolverError::TimeStepUnderflow => ErrorKind::Numerical,
            SolverError::Device(_) => ErrorKind::Device,
        }
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;

#[cfg(test)]
mod tests {
    use super::{ErrorKind, SolverError};

    #[test]
    fn leak_is_a_resource_error() {
        let err = SolverError::BufferLeak {
            len: 8,
            live: 101,
            max: 100,
        };
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.to_string().contains("possible memory leak"));
    }

    #[test]
    fn unknown_stepper_reports_id() {
        let err = SolverError::UnknownStepper(9);
        assert_eq!(err.kind(), ErrorKind::Contract);
        assert_eq!(err.to_string(), "unknown solver type: 9");
    }

    #[test]
    fn underflow_is_numerical() {
        assert_eq!(SolverError::TimeStepUnderflow.kind(), ErrorKind::Numerical);
    }
}
