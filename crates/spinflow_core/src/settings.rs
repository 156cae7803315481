use crate::arena::DEFAULT_MAX_LIVE_BUFFERS;
use crate::error::{Result, SolverError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gyromagnetic ratio of spins, in rad/(T·s).
pub const GAMMA_LL: f64 = 1.7595e11;

/// Integration scheme. Integer ids match the scripting interface of the
/// simulation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Method {
    /// Implicit midpoint with one fixed-point iteration. Fixed step only.
    BackwardEuler,
    Euler,
    Heun,
    /// Bogacki-Shampine 3(2), FSAL.
    BogackiShampine,
    RungeKutta,
    /// Dormand-Prince 5(4), FSAL.
    #[default]
    DormandPrince,
    /// 8-stage 6(5) pair.
    Fehlberg,
}

impl Method {
    pub fn from_id(id: i32) -> Result<Self> {
        match id {
            -1 => Ok(Method::BackwardEuler),
            1 => Ok(Method::Euler),
            2 => Ok(Method::Heun),
            3 => Ok(Method::BogackiShampine),
            4 => Ok(Method::RungeKutta),
            5 => Ok(Method::DormandPrince),
            6 => Ok(Method::Fehlberg),
            other => Err(SolverError::UnknownStepper(other)),
        }
    }

    pub fn id(self) -> i32 {
        match self {
            Method::BackwardEuler => -1,
            Method::Euler => 1,
            Method::Heun => 2,
            Method::BogackiShampine => 3,
            Method::RungeKutta => 4,
            Method::DormandPrince => 5,
            Method::Fehlberg => 6,
        }
    }

    /// Whether the scheme rejects steps and adapts its step size.
    pub fn is_adaptive(self) -> bool {
        !matches!(self, Method::BackwardEuler | Method::Euler)
    }

    /// Whether the scheme carries its last stage into the next step.
    pub fn is_fsal(self) -> bool {
        matches!(self, Method::BogackiShampine | Method::DormandPrince)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub method: Method,
    /// Initial time step in seconds.
    pub dt: f64,
    /// Fixed time step in seconds; 0 enables adaptive stepping.
    pub fix_dt: f64,
    /// Lower bound on adaptive steps; 0 disables the bound.
    pub min_dt: f64,
    /// Upper bound on adaptive steps; 0 disables the bound.
    pub max_dt: f64,
    /// Maximum error per step.
    pub max_err: f64,
    /// Safety factor applied to every step-size correction.
    pub headroom: f64,
    /// Converts seconds to the internal time unit: `h = dt · gamma_ll`.
    pub gamma_ll: f64,
    /// Live scratch buffers of one size before a leak is reported.
    pub max_live_buffers: usize,
    /// Device barrier around every scratch buffer hand-out and recycle.
    pub synchronous: bool,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            method: Method::default(),
            dt: 1e-15,
            fix_dt: 0.0,
            min_dt: 0.0,
            max_dt: 0.0,
            max_err: 1e-5,
            headroom: 0.8,
            gamma_ll: GAMMA_LL,
            max_live_buffers: DEFAULT_MAX_LIVE_BUFFERS,
            synchronous: false,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SolverError::InvalidSettings(msg));
        if !(self.max_err > 0.0) {
            return invalid(format!("max_err must be positive, got {}", self.max_err));
        }
        if !(self.headroom > 0.0 && self.headroom <= 1.0) {
            return invalid(format!("headroom must lie in (0, 1], got {}", self.headroom));
        }
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return invalid(format!("dt must be positive and finite, got {}", self.dt));
        }
        for (name, value) in [
            ("fix_dt", self.fix_dt),
            ("min_dt", self.min_dt),
            ("max_dt", self.max_dt),
        ] {
            if !(value >= 0.0) || !value.is_finite() {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }
        if self.min_dt != 0.0 && self.max_dt != 0.0 && self.min_dt > self.max_dt {
            return invalid(format!(
                "min_dt ({}) exceeds max_dt ({})",
                self.min_dt, self.max_dt
            ));
        }
        if !(self.gamma_ll > 0.0) {
            return invalid(format!("gamma_ll must be positive, got {}", self.gamma_ll));
        }
        if self.max_live_buffers == 0 {
            return invalid("max_live_buffers must be at least 1".to_string());
        }
        Ok(())
    }

    /// Parses settings from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let settings: SolverSettings =
            serde_json::from_str(text).context("Failed to parse solver settings.")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read solver settings from {}.", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("Invalid solver settings in {}.", path.display()))
    }
}
