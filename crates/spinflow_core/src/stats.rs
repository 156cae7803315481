use serde::{Deserialize, Serialize};

/// Error and work statistics of a solver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Error estimate of the last accepted step.
    pub last_err: f64,
    /// Highest error estimate ever accepted.
    pub peak_err: f64,
    /// Largest torque norm at the end of the last accepted step.
    pub last_torque: f64,
    /// Accepted steps.
    pub n_steps: u64,
    /// Rejected (undone) steps.
    pub n_undone: u64,
    /// Right-hand-side evaluations.
    pub n_evals: u64,
}

impl Statistics {
    pub fn set_last_err(&mut self, err: f64) {
        self.last_err = err;
        if err > self.peak_err {
            self.peak_err = err;
        }
    }

    /// Accepted plus rejected steps.
    pub fn attempts(&self) -> u64 {
        self.n_steps + self.n_undone
    }
}

#[cfg(test)]
mod tests {
    use super::Statistics;

    #[test]
    fn peak_error_only_grows() {
        let mut stats = Statistics::default();
        stats.set_last_err(2e-6);
        stats.set_last_err(1e-6);
        assert_eq!(stats.last_err, 1e-6);
        assert_eq!(stats.peak_err, 2e-6);
    }

    #[test]
    fn serializes_for_tables() {
        let stats = Statistics {
            n_steps: 3,
            n_undone: 1,
            ..Statistics::default()
        };
        let json = serde_json::to_string(&stats).expect("stats should serialize");
        assert!(json.contains("\"n_steps\":3"));
        assert_eq!(stats.attempts(), 4);
    }
}
