//! Step-size control.
//!
//! Corrections follow the usual power law `(target / error)^(1/k)`, scaled by
//! a headroom factor (Gustafsson, 1992, Control of Error and Convergence in
//! ODE Solvers) and limited to halving or doubling per call.

use crate::error::{Result, SolverError};
use crate::settings::SolverSettings;
use serde::{Deserialize, Serialize};

/// Per-call limits on the step-size ratio.
pub const MIN_CORRECTION: f64 = 0.5;
pub const MAX_CORRECTION: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepController {
    dt: f64,
    fix_dt: f64,
    min_dt: f64,
    max_dt: f64,
    max_err: f64,
    headroom: f64,
    /// End time of the current run; adaptation never steps across it.
    alarm: f64,
    /// The current step was shortened to land on the alarm.
    on_alarm: bool,
}

impl StepController {
    pub fn new(settings: &SolverSettings) -> Self {
        Self {
            dt: settings.dt,
            fix_dt: settings.fix_dt,
            min_dt: settings.min_dt,
            max_dt: settings.max_dt,
            max_err: settings.max_err,
            headroom: settings.headroom,
            alarm: 0.0,
            on_alarm: false,
        }
    }

    /// `(target / estimated)^(1/exponent)`. A zero or NaN error estimate asks
    /// for no correction at all.
    pub fn propose_correction(exponent: f64, estimated: f64, target: f64) -> f64 {
        if estimated == 0.0 {
            return 1.0;
        }
        let corr = (target / estimated).powf(1.0 / exponent);
        if corr.is_nan() {
            1.0
        } else {
            corr
        }
    }

    /// Correction for an error estimate against this controller's target.
    pub fn correction(&self, exponent: f64, estimated: f64) -> f64 {
        Self::propose_correction(exponent, estimated, self.max_err)
    }

    /// `dt *= corr · headroom`, limited to sensible values. A fixed step is
    /// used verbatim instead.
    pub fn apply_correction(&mut self, corr: f64, time: f64) -> Result<()> {
        if self.fix_dt != 0.0 {
            self.dt = self.fix_dt;
            return Ok(());
        }

        // An unbounded factor can only come from a zero error estimate.
        let corr = if corr.is_nan() || corr.is_infinite() {
            1.0
        } else {
            corr
        };
        if corr == 0.0 {
            return Err(SolverError::TimeStepUnderflow);
        }
        let corr = (corr * self.headroom).clamp(MIN_CORRECTION, MAX_CORRECTION);
        self.dt *= corr;
        self.clamp_to_bounds();
        if self.dt == 0.0 {
            return Err(SolverError::TimeStepUnderflow);
        }

        self.clamp_to_alarm(time);
        if !(self.dt > 0.0) {
            return Err(SolverError::TimeStepUnderflow);
        }
        Ok(())
    }

    pub(crate) fn clamp_to_bounds(&mut self) {
        if self.min_dt != 0.0 && self.dt < self.min_dt {
            self.dt = self.min_dt;
        }
        if self.max_dt != 0.0 && self.dt > self.max_dt {
            self.dt = self.max_dt;
        }
    }

    /// Shortens the step so that `time + dt` lands exactly on the alarm
    /// instead of crossing it.
    pub fn clamp_to_alarm(&mut self, time: f64) {
        self.on_alarm = time < self.alarm && time + self.dt >= self.alarm;
        if self.on_alarm {
            self.dt = self.alarm - time;
        }
    }

    /// Step size for the step about to start at `time`.
    pub(crate) fn begin_step(&mut self, time: f64) -> f64 {
        if self.fix_dt != 0.0 {
            self.dt = self.fix_dt;
            self.on_alarm = false;
        } else {
            self.clamp_to_alarm(time);
        }
        self.dt
    }

    /// Time reached by a step of the current size from `t0`, snapped onto the
    /// alarm when the step was shortened to hit it.
    pub(crate) fn end_time(&self, t0: f64) -> f64 {
        if self.on_alarm {
            self.alarm
        } else {
            t0 + self.dt
        }
    }

    /// Acceptance policy. Steps at the minimum size are accepted regardless so
    /// that an unreachable target cannot loop forever; fixed steps are never
    /// rejected.
    pub fn accepts(&self, err: f64) -> bool {
        err < self.max_err || self.dt <= self.min_dt || self.fix_dt != 0.0
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn set_dt(&mut self, dt: f64) {
        self.dt = dt;
    }

    pub fn fix_dt(&self) -> f64 {
        self.fix_dt
    }

    pub fn set_fix_dt(&mut self, fix_dt: f64) {
        self.fix_dt = fix_dt;
    }

    pub fn min_dt(&self) -> f64 {
        self.min_dt
    }

    pub fn set_min_dt(&mut self, min_dt: f64) {
        self.min_dt = min_dt;
    }

    pub fn max_dt(&self) -> f64 {
        self.max_dt
    }

    pub fn set_max_dt(&mut self, max_dt: f64) {
        self.max_dt = max_dt;
    }

    pub fn max_err(&self) -> f64 {
        self.max_err
    }

    pub fn set_max_err(&mut self, max_err: f64) {
        self.max_err = max_err;
    }

    pub fn headroom(&self) -> f64 {
        self.headroom
    }

    pub fn set_headroom(&mut self, headroom: f64) {
        self.headroom = headroom;
    }

    pub fn alarm(&self) -> f64 {
        self.alarm
    }

    pub fn set_alarm(&mut self, alarm: f64) {
        self.alarm = alarm;
    }
}

#[cfg(test)]
mod tests {
    use super::StepController;
    use crate::error::SolverError;
    use crate::settings::SolverSettings;

    fn controller(dt: f64) -> StepController {
        StepController::new(&SolverSettings {
            dt,
            ..SolverSettings::default()
        })
    }

    #[test]
    fn zero_error_keeps_the_step_apart_from_headroom() {
        let corr = StepController::propose_correction(5.0, 0.0, 1e-5);
        assert_eq!(corr, 1.0);
        let nan = StepController::propose_correction(5.0, f64::NAN, 1e-5);
        assert_eq!(nan, 1.0);

        let mut ctrl = controller(1e-13);
        let corr = ctrl.correction(5.0, 0.0);
        ctrl.apply_correction(corr, 0.0).expect("correction should apply");
        assert!((ctrl.dt() - 0.8e-13).abs() < 1e-27, "dt = {}", ctrl.dt());

        let mut ctrl = controller(1e-13);
        ctrl.apply_correction(f64::INFINITY, 0.0).expect("correction should apply");
        assert!((ctrl.dt() - 0.8e-13).abs() < 1e-27, "dt = {}", ctrl.dt());
    }

    #[test]
    fn correction_follows_power_law() {
        let corr = StepController::propose_correction(2.0, 4e-5, 1e-5);
        assert!((corr - 0.5).abs() < 1e-12);
    }

    #[test]
    fn new_step_is_monotone_in_error_and_clamped() {
        let errors = [1e-9, 1e-7, 5e-6, 1e-5, 2e-5, 1e-4, 1e-2, 1.0];
        let mut previous = f64::INFINITY;
        for err in errors {
            let mut ctrl = controller(1e-13);
            let corr = ctrl.correction(5.0, err);
            ctrl.apply_correction(corr, 0.0).expect("correction should apply");
            let ratio = ctrl.dt() / 1e-13;
            assert!(ratio <= 2.0 + 1e-12 && ratio >= 0.5 - 1e-12, "ratio {ratio}");
            assert!(ctrl.dt() <= previous);
            previous = ctrl.dt();
        }
    }

    #[test]
    fn fixed_step_is_used_verbatim() {
        let mut ctrl = controller(1e-13);
        ctrl.set_fix_dt(3e-14);
        ctrl.apply_correction(100.0, 0.0).expect("correction should apply");
        assert_eq!(ctrl.dt(), 3e-14);
        assert!(ctrl.accepts(1e9));
    }

    #[test]
    fn bounds_apply_after_the_ratio_limit() {
        let mut ctrl = controller(1e-13);
        ctrl.set_max_dt(1.5e-13);
        ctrl.apply_correction(10.0, 0.0).expect("correction should apply");
        assert_eq!(ctrl.dt(), 1.5e-13);

        ctrl.set_min_dt(1.2e-13);
        ctrl.apply_correction(1e-3, 0.0).expect("correction should apply");
        assert_eq!(ctrl.dt(), 1.2e-13);
        assert!(ctrl.accepts(1.0));
    }

    #[test]
    fn alarm_is_never_crossed() {
        let mut ctrl = controller(1e-12);
        ctrl.set_alarm(2.5e-12);
        ctrl.apply_correction(1.0, 2e-12).expect("correction should apply");
        assert!((ctrl.dt() - 0.5e-12).abs() < 1e-27);
        assert_eq!(ctrl.end_time(2e-12), 2.5e-12);
    }

    #[test]
    fn past_alarm_is_ignored() {
        let mut ctrl = controller(1e-12);
        ctrl.set_alarm(1e-12);
        let dt = ctrl.begin_step(5e-12);
        assert_eq!(dt, 1e-12);
        assert!((ctrl.end_time(5e-12) - 6e-12).abs() < 1e-26);
    }

    #[test]
    fn infinite_error_is_an_underflow() {
        let mut ctrl = controller(1e-13);
        let corr = ctrl.correction(5.0, f64::INFINITY);
        let err = ctrl
            .apply_correction(corr, 0.0)
            .expect_err("zero correction is fatal");
        assert!(matches!(err, SolverError::TimeStepUnderflow));
    }

    #[test]
    fn rejection_threshold() {
        let ctrl = controller(1e-13);
        assert!(ctrl.accepts(0.9e-5));
        assert!(!ctrl.accepts(1e-5));
    }
}
