//! The solver context and its run loop.
//!
//! All state that the steppers read and write lives in [`Solver`]. The run
//! loop alternates between stepping and executing tasks injected from other
//! threads through an [`Injector`]; a task always runs between two steps, on
//! the thread that owns the solver.

use crate::autosave::{AutosaveTable, Schedule};
use crate::controller::StepController;
use crate::device::{Device, Slice};
use crate::error::{Result, SolverError};
use crate::gpu::Gpu;
use crate::settings::{Method, SolverSettings};
use crate::solvers::{ActiveStepper, StepContext, StepOutcome};
use crate::stats::Statistics;
use crate::traits::{Stepper, TorqueProvider};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};

/// Work executed inside the run loop, between two steps.
pub type Task<D, M> = Box<dyn FnOnce(&mut Solver<D, M>) + Send>;

/// Called after every step, accepted or rejected.
pub type PostStepHook<D, M> = Box<dyn FnMut(&mut Solver<D, M>)>;

/// Steps taken per torque check while relaxing.
const RELAX_STEPS: u64 = 3;
/// Relaxation stops tightening the error target below this.
const RELAX_MIN_ERR: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    /// Waiting for tasks in [`Solver::run_interactive`].
    Idle,
    Running,
    #[default]
    Paused,
}

pub struct Solver<D: Device, M: TorqueProvider<D>> {
    gpu: Gpu<D>,
    model: M,
    m: Slice,
    mesh: [usize; 3],
    time: f64,
    ctrl: StepController,
    stats: Statistics,
    gamma_ll: f64,
    stepper: ActiveStepper,
    state: RunState,
    pause: bool,
    interactive: bool,
    post_step: Vec<PostStepHook<D, M>>,
    autosaves: AutosaveTable<Solver<D, M>>,
    inject_tx: SyncSender<Task<D, M>>,
    inject_rx: Receiver<Task<D, M>>,
}

fn cell_count(mesh: [usize; 3]) -> Result<usize> {
    let n = mesh.iter().product::<usize>();
    if n == 0 {
        return Err(SolverError::InvalidBufferShape { ncomp: 3, len: n });
    }
    Ok(n)
}

impl<D: Device, M: TorqueProvider<D>> Solver<D, M> {
    /// Creates a solver on `device` for a `mesh` of cells, magnetized along +x.
    pub fn new(device: D, model: M, mesh: [usize; 3], settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        let n = cell_count(mesh)?;
        let mut gpu = Gpu::new(device, settings.max_live_buffers);
        gpu.set_synchronous(settings.synchronous);
        let m = gpu.new_slice(3, n)?;
        let (inject_tx, inject_rx) = mpsc::sync_channel(0);

        let mut solver = Self {
            gpu,
            model,
            m,
            mesh,
            time: 0.0,
            ctrl: StepController::new(&settings),
            stats: Statistics::default(),
            gamma_ll: settings.gamma_ll,
            stepper: ActiveStepper::new(settings.method),
            state: RunState::Paused,
            pause: true,
            interactive: false,
            post_step: Vec::new(),
            autosaves: AutosaveTable::default(),
            inject_tx,
            inject_rx,
        };
        solver.set_uniform([1.0, 0.0, 0.0]);
        log::info!(
            "solver ready: {} cells, {:?} stepper",
            n,
            settings.method
        );
        Ok(solver)
    }

    /// Selects the integration scheme. State carried by the previous scheme is released.
    pub fn set_stepper(&mut self, method: Method) {
        self.free_stepper();
        self.stepper = ActiveStepper::new(method);
        log::info!("using {method:?} stepper");
    }

    /// Selects the integration scheme by its scripting id.
    pub fn set_stepper_id(&mut self, id: i32) -> Result<()> {
        let method = Method::from_id(id)?;
        self.set_stepper(method);
        Ok(())
    }

    fn free_stepper(&mut self) {
        Stepper::<D>::free(&mut self.stepper, &self.gpu);
    }

    /// Takes one step, runs the post-step hooks and any due output.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.step_inner(true)
    }

    fn step_inner(&mut self, output: bool) -> Result<StepOutcome> {
        let outcome = {
            let mut cx = StepContext {
                gpu: &self.gpu,
                model: &mut self.model,
                m: &self.m,
                time: &mut self.time,
                ctrl: &mut self.ctrl,
                stats: &mut self.stats,
                gamma_ll: self.gamma_ll,
            };
            self.stepper.step(&mut cx)?
        };

        let mut hooks = std::mem::take(&mut self.post_step);
        for hook in hooks.iter_mut() {
            hook(self);
        }
        // Hooks registered by a hook go after the existing ones.
        hooks.append(&mut self.post_step);
        self.post_step = hooks;

        if output {
            self.save_if_needed();
        }
        Ok(outcome)
    }

    fn save_if_needed(&mut self) {
        if self.autosaves.is_empty() {
            return;
        }
        let mut autosaves = std::mem::take(&mut self.autosaves);
        autosaves.save_due(self, self.time);
        self.autosaves = autosaves;
    }

    /// Runs for `seconds` of simulated time. Adaptive steps land exactly on the end time.
    pub fn run(&mut self, seconds: f64) -> Result<()> {
        let start = self.time;
        let stop = start + seconds;
        self.ctrl.set_alarm(stop);
        self.pause = false;
        self.state = RunState::Running;
        log::info!("run from t = {start:e} s to {stop:e} s");

        self.free_stepper();
        let result = self.run_inner(|solver| solver.time < stop, true);

        self.pause = true;
        self.state = RunState::Paused;
        match &result {
            Ok(()) => log::info!(
                "run stopped at t = {:e} s after {} steps ({} undone)",
                self.time,
                self.stats.n_steps,
                self.stats.n_undone
            ),
            Err(err) => log::error!("run aborted at t = {:e} s: {err}", self.time),
        }
        result
    }

    /// Runs as long as `condition` holds.
    pub fn run_while(&mut self, condition: impl FnMut(&Self) -> bool) -> Result<()> {
        self.ctrl.set_alarm(self.time);
        self.pause = false;
        self.state = RunState::Running;
        self.free_stepper();
        let result = self.run_inner(condition, true);
        self.pause = true;
        self.state = RunState::Paused;
        if let Err(err) = &result {
            log::error!("run aborted at t = {:e} s: {err}", self.time);
        }
        result
    }

    /// Runs `n` step attempts, accepted or rejected.
    pub fn run_steps(&mut self, n: u64) -> Result<()> {
        let stop = self.stats.attempts() + n;
        self.run_while(move |solver| solver.stats.attempts() < stop)
    }

    fn run_inner(&mut self, mut condition: impl FnMut(&Self) -> bool, output: bool) -> Result<()> {
        if output {
            self.save_if_needed();
        }
        while condition(self) && !self.pause {
            match self.inject_rx.try_recv() {
                Ok(task) => task(self),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                    self.step_inner(output)?;
                }
            }
        }
        Ok(())
    }

    /// Executes injected tasks until one of them calls [`Solver::stop_interactive`].
    pub fn run_interactive(&mut self) {
        self.interactive = true;
        log::info!("waiting for tasks");
        while self.interactive {
            self.state = RunState::Idle;
            match self.inject_rx.recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
        self.state = RunState::Paused;
    }

    pub fn stop_interactive(&mut self) {
        self.interactive = false;
    }

    /// Stops the current run after the step in progress. For use inside
    /// hooks and tasks; other threads use [`Injector::break_run`].
    pub fn pause(&mut self) {
        self.pause = true;
    }

    /// Handle for injecting tasks from other threads.
    pub fn injector(&self) -> Injector<D, M> {
        Injector {
            tx: self.inject_tx.clone(),
        }
    }

    /// Registers `hook` to run after every step.
    pub fn post_step(&mut self, hook: impl FnMut(&mut Self) + 'static) {
        self.post_step.push(Box::new(hook));
    }

    /// Calls `action` every `period` seconds of simulated time, starting now.
    /// A zero period cancels the output of that name.
    pub fn autosave(
        &mut self,
        name: &str,
        period: f64,
        action: impl FnMut(&Self, &str, u64) + 'static,
    ) {
        self.autosaves
            .register(name, period, self.time, Box::new(action));
    }

    pub fn autosave_schedule(&self, name: &str) -> Option<&Schedule> {
        self.autosaves.schedule(name)
    }

    /// Minimizes the energy by damping-only dynamics. With a positive
    /// `torque_threshold` (tesla) steps continue until the largest torque drops
    /// below it; otherwise until the mean square torque stops decreasing. The
    /// error target is tightened between rounds. Time does not advance, and
    /// the stepper and step settings are restored afterwards.
    pub fn relax(&mut self, torque_threshold: f64) -> Result<()> {
        let prev_method = self.method();
        let prev_max_err = self.ctrl.max_err();
        let prev_fix_dt = self.ctrl.fix_dt();
        log::info!("relaxing at t = {:e} s", self.time);

        self.pause = false;
        self.state = RunState::Running;
        self.set_stepper(Method::BogackiShampine);
        self.ctrl.set_fix_dt(0.0);
        self.ctrl.set_alarm(self.time);
        self.model.set_relaxing(true);

        let result = self.relax_inner(torque_threshold);

        // The carried torque belongs to the relaxing model; set_stepper drops it.
        self.set_stepper(prev_method);
        self.ctrl.set_max_err(prev_max_err);
        self.ctrl.set_fix_dt(prev_fix_dt);
        self.model.set_relaxing(false);
        self.pause = true;
        self.state = RunState::Paused;
        result
    }

    fn relax_inner(&mut self, torque_threshold: f64) -> Result<()> {
        self.relax_steps(RELAX_STEPS)?;

        if torque_threshold > 0.0 {
            while !self.pause {
                while self.stats.last_torque > torque_threshold && !self.pause {
                    self.relax_steps(RELAX_STEPS)?;
                }
                let max_err = self.ctrl.max_err() / std::f64::consts::SQRT_2;
                self.ctrl.set_max_err(max_err);
                if max_err < RELAX_MIN_ERR {
                    break;
                }
            }
        } else {
            // The largest torque is too noisy to detect the end of the descent.
            let mut t1 = self.mean_square_torque()?;
            while self.ctrl.max_err() > RELAX_MIN_ERR && !self.pause {
                self.ctrl
                    .set_max_err(self.ctrl.max_err() / std::f64::consts::SQRT_2);
                self.relax_steps(RELAX_STEPS)?;
                let mut t0 = t1;
                t1 = self.mean_square_torque()?;
                while t1 < t0 && !self.pause {
                    self.relax_steps(RELAX_STEPS)?;
                    t0 = t1;
                    t1 = self.mean_square_torque()?;
                }
            }
        }
        log::info!(
            "relaxed: max torque {:e} T after {} steps",
            self.stats.last_torque,
            self.stats.n_steps
        );
        Ok(())
    }

    /// Mean of `|τ|²` over the cells, at the current state.
    fn mean_square_torque(&mut self) -> Result<f64> {
        let tau = self.gpu.buffer(3, self.m.len())?;
        self.model.torque(&self.gpu, self.time, &self.m, &tau)?;
        self.stats.n_evals += 1;
        Ok(self.gpu.dot(&tau, &tau) / self.m.len() as f64)
    }

    /// `n` accepted steps without output; time is put back afterwards.
    fn relax_steps(&mut self, n: u64) -> Result<()> {
        let t0 = self.time;
        let stop = self.stats.n_steps + n;
        let result = self.run_inner(|solver| solver.stats.n_steps < stop, false);
        self.set_time(t0);
        result
    }

    /// Changes the mesh. All device buffers are dropped and the state is
    /// reset to +x.
    pub fn resize(&mut self, mesh: [usize; 3]) -> Result<()> {
        let n = cell_count(mesh)?;
        self.free_stepper();
        let old = std::mem::take(&mut self.m);
        self.gpu.free_slice(old);
        self.gpu.free_buffers();
        self.m = self.gpu.new_slice(3, n)?;
        self.mesh = mesh;
        self.set_uniform([1.0, 0.0, 0.0]);
        log::info!("resized to {}x{}x{} cells", mesh[0], mesh[1], mesh[2]);
        Ok(())
    }

    /// Sets every cell to the direction of `v`.
    pub fn set_uniform(&mut self, v: [f32; 3]) {
        let n = self.m.len();
        for (c, value) in v.into_iter().enumerate() {
            self.gpu.upload(&self.m, c, &vec![value; n]);
        }
        self.model.normalize(&self.gpu, &self.m);
        self.stepper.invalidate_carried();
    }

    /// Sets the state cell by cell; vectors are normalized.
    pub fn set_magnetization(&mut self, cells: &[[f32; 3]]) -> Result<()> {
        if cells.len() != self.m.len() {
            return Err(SolverError::InvalidBufferShape {
                ncomp: 3,
                len: cells.len(),
            });
        }
        for c in 0..3 {
            let data: Vec<f32> = cells.iter().map(|cell| cell[c]).collect();
            self.gpu.upload(&self.m, c, &data);
        }
        self.model.normalize(&self.gpu, &self.m);
        self.stepper.invalidate_carried();
        Ok(())
    }

    pub fn magnetization(&self) -> Vec<[f32; 3]> {
        let comps = self.gpu.download(&self.m);
        (0..self.m.len())
            .map(|i| [comps[0][i], comps[1][i], comps[2][i]])
            .collect()
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
        self.stepper.invalidate_carried();
    }

    pub fn dt(&self) -> f64 {
        self.ctrl.dt()
    }

    pub fn last_err(&self) -> f64 {
        self.stats.last_err
    }

    pub fn peak_err(&self) -> f64 {
        self.stats.peak_err
    }

    pub fn last_torque(&self) -> f64 {
        self.stats.last_torque
    }

    pub fn n_steps(&self) -> u64 {
        self.stats.n_steps
    }

    pub fn n_undone(&self) -> u64 {
        self.stats.n_undone
    }

    pub fn n_evals(&self) -> u64 {
        self.stats.n_evals
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.stepper.method()
    }

    pub fn stepper(&self) -> &ActiveStepper {
        &self.stepper
    }

    pub fn mesh(&self) -> [usize; 3] {
        self.mesh
    }

    pub fn controller(&self) -> &StepController {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut StepController {
        &mut self.ctrl
    }

    pub fn gpu(&self) -> &Gpu<D> {
        &self.gpu
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Mutable access to the model. The next step starts from a freshly
    /// evaluated torque.
    pub fn model_mut(&mut self) -> &mut M {
        self.stepper.invalidate_carried();
        &mut self.model
    }
}

impl<D: Device, M: TorqueProvider<D>> Drop for Solver<D, M> {
    fn drop(&mut self) {
        self.free_stepper();
        let m = std::mem::take(&mut self.m);
        self.gpu.free_slice(m);
    }
}

/// Cloneable handle that lets other threads run code inside a solver's loop.
///
/// Sending blocks until the solver picks the task up, which it does only
/// while [`Solver::run`], [`Solver::run_while`] or [`Solver::run_interactive`]
/// is executing.
pub struct Injector<D: Device, M: TorqueProvider<D>> {
    tx: SyncSender<Task<D, M>>,
}

impl<D: Device, M: TorqueProvider<D>> Clone for Injector<D, M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<D: Device, M: TorqueProvider<D>> Injector<D, M> {
    /// Hands `task` to the run loop without waiting for it to finish.
    pub fn inject(&self, task: impl FnOnce(&mut Solver<D, M>) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(task))
            .map_err(|_| SolverError::SolverGone)
    }

    /// Runs `task` between two steps and returns its result.
    pub fn inject_and_wait<R: Send + 'static>(
        &self,
        task: impl FnOnce(&mut Solver<D, M>) -> R + Send + 'static,
    ) -> Result<R> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.inject(move |solver| {
            // The caller may have stopped listening; nothing to do then.
            let _ = reply_tx.send(task(solver));
        })?;
        reply_rx.recv().map_err(|_| SolverError::SolverGone)
    }

    /// Stops the current run after the step in progress.
    pub fn break_run(&self) -> Result<()> {
        self.inject(|solver| solver.pause())
    }
}
