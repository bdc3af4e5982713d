//! SCAFFOLD client-side correction (Karimireddy et al., 2020).
//!
//! [`ScaffoldCoordinator`] binds to one local training run at a time and
//! keeps the client's own control variate `c_i` between runs.
//!
//! | Phase | Call | Effect |
//! |-------|------|--------|
//! | start | [`start_run`](ScaffoldCoordinator::start_run) | copy `c`, snapshot `x`, `K = 0` |
//! | before step | [`before_step`](ScaffoldCoordinator::before_step) | record `eta_l` |
//! | after step | [`after_step`](ScaffoldCoordinator::after_step) | `w += eta_l*(c_i - c)`, `K++` |
//! | end | [`finish_run`](ScaffoldCoordinator::finish_run) | update `c_i`, emit [`LocalUpdate`] |
//!
//! Inside a [`HookChain`](super::HookChain) the end phase is split in two:
//! [`stage_finish`](ScaffoldCoordinator::stage_finish) computes the update and
//! holds the new `c_i` aside, and [`commit_finish`](ScaffoldCoordinator::commit_finish)
//! persists it once every hook in the chain has finished. An abort in between
//! drops the staged value.
//!
//! Reference: "SCAFFOLD: Stochastic Controlled Averaging for Federated Learning"

use log::debug;

use super::{HookOutput, Phase, TrainableModel, TrainingHook};
use crate::error::{Result, ScaffoldError};
use crate::params::{ControlVariate, ParameterVector};
use crate::registry::HookRequirement;
use crate::update::{GlobalStateSnapshot, LocalUpdate};

/// State scoped to a single local training run.
#[derive(Clone, Debug)]
struct RunState {
    global_control_variate: ControlVariate,
    initial_weights: ParameterVector,
    local_steps: usize,
    learning_rate: f32,
    step_open: bool,
}

#[derive(Clone, Debug)]
enum State {
    NotStarted,
    Initialized(RunState),
    Running(RunState),
    Completed,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::NotStarted => Phase::NotStarted,
            State::Initialized(_) => Phase::Initialized,
            State::Running(_) => Phase::Running,
            State::Completed => Phase::Completed,
        }
    }

    fn run(&self) -> Option<&RunState> {
        match self {
            State::Initialized(run) | State::Running(run) => Some(run),
            _ => None,
        }
    }
}

/// Client-side SCAFFOLD correction state machine.
///
/// Not meant to be shared between concurrently running training loops:
/// every phase method takes `&mut self`.
///
/// # Example
///
/// ```rust
/// use ndarray::ArrayD;
/// use scaffold_fl::hooks::{ScaffoldCoordinator, TrainableModel};
/// use scaffold_fl::params::ParameterVector;
///
/// struct Scalar { w: Vec<ArrayD<f32>>, g: Vec<ArrayD<f32>> }
///
/// impl TrainableModel for Scalar {
///     fn parameters(&self) -> &[ArrayD<f32>] { &self.w }
///     fn parameters_mut(&mut self) -> &mut [ArrayD<f32>] { &mut self.w }
///     fn gradient(&self, i: usize) -> Option<&ArrayD<f32>> { self.g.get(i) }
///     fn learning_rate(&self) -> f32 { 0.5 }
///     fn num_samples(&self) -> usize { 4 }
/// }
///
/// let mut model = Scalar {
///     w: vec![ArrayD::from_elem(vec![1], 1.0)],
///     g: vec![ArrayD::from_elem(vec![1], 1.0)],
/// };
/// let c = ParameterVector::from_arrays(model.parameters()).zeros_like();
///
/// let mut coordinator = ScaffoldCoordinator::new();
/// coordinator.start_run(&model, &c).unwrap();
/// coordinator.before_step(&model).unwrap();
/// model.w[0] -= 0.5; // optimizer step: w -= lr * g
/// coordinator.after_step(&mut model).unwrap();
///
/// let update = coordinator.finish_run(&model).unwrap();
/// assert_eq!(update.delta_y()[0].sum(), -0.5);
/// assert_eq!(update.num_samples(), 4);
/// ```
#[derive(Clone, Debug)]
pub struct ScaffoldCoordinator {
    local_control_variate: Option<ControlVariate>,
    staged_control_variate: Option<ControlVariate>,
    state: State,
}

impl Default for ScaffoldCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ScaffoldCoordinator {
    /// Create a coordinator whose control variate is zero-initialized on the first run.
    pub fn new() -> Self {
        Self {
            local_control_variate: None,
            staged_control_variate: None,
            state: State::NotStarted,
        }
    }

    /// Create a coordinator that resumes from a previously persisted `c_i`.
    pub fn with_control_variate(c_i: ControlVariate) -> Self {
        Self {
            local_control_variate: Some(c_i),
            staged_control_variate: None,
            state: State::NotStarted,
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// The client's control variate `c_i`, once initialized.
    pub fn local_control_variate(&self) -> Option<&ControlVariate> {
        self.local_control_variate.as_ref()
    }

    /// Optimizer steps recorded in the current run.
    pub fn local_steps(&self) -> Option<usize> {
        self.state.run().map(|run| run.local_steps)
    }

    /// Learning rate recorded at the most recent step of the current run.
    pub fn learning_rate(&self) -> Option<f32> {
        self.state
            .run()
            .filter(|run| run.local_steps > 0 || run.step_open)
            .map(|run| run.learning_rate)
    }

    /// Phase 1: bind to a new local run.
    ///
    /// `global_control_variate` is copied; later changes on the server side
    /// do not affect this run.
    pub fn start_run(
        &mut self,
        model: &dyn TrainableModel,
        global_control_variate: &ControlVariate,
    ) -> Result<()> {
        let phase = self.phase();
        if !matches!(phase, Phase::NotStarted | Phase::Completed) {
            return Err(invalid_phase("start_run", phase));
        }

        if self.staged_control_variate.take().is_some() {
            debug!("scaffold run started over an uncommitted update, discarding it");
        }

        let initial_weights = ParameterVector::from_arrays(model.parameters());
        initial_weights.check_compatible(global_control_variate)?;
        match &self.local_control_variate {
            Some(c_i) => initial_weights.check_compatible(c_i)?,
            None => self.local_control_variate = Some(initial_weights.zeros_like()),
        }

        debug!(
            "scaffold run started: params={} elements={}",
            initial_weights.len(),
            initial_weights.num_elements()
        );
        self.state = State::Initialized(RunState {
            global_control_variate: global_control_variate.clone(),
            initial_weights,
            local_steps: 0,
            learning_rate: 0.0,
            step_open: false,
        });
        Ok(())
    }

    /// Phase 2: record the learning rate the optimizer is about to use.
    pub fn before_step(&mut self, model: &dyn TrainableModel) -> Result<()> {
        match std::mem::replace(&mut self.state, State::NotStarted) {
            State::Initialized(mut run) | State::Running(mut run) if !run.step_open => {
                run.learning_rate = model.learning_rate();
                run.step_open = true;
                self.state = State::Running(run);
                Ok(())
            }
            other => {
                let phase = other.phase();
                self.state = other;
                Err(invalid_phase("before_step", phase))
            }
        }
    }

    /// Phase 3: shift every parameter that received a gradient by `eta_l * (c_i - c)`.
    pub fn after_step(&mut self, model: &mut dyn TrainableModel) -> Result<()> {
        let phase = self.phase();
        let (run, c_i) = match (&mut self.state, &self.local_control_variate) {
            (State::Running(run), Some(c_i)) if run.step_open => (run, c_i),
            _ => return Err(invalid_phase("after_step", phase)),
        };
        run.initial_weights.check_arrays(model.parameters())?;

        let eta_l = run.learning_rate;
        let c = &run.global_control_variate;
        let has_gradient: Vec<bool> = (0..c.len()).map(|i| model.gradient(i).is_some()).collect();
        for (index, param) in model.parameters_mut().iter_mut().enumerate() {
            if !has_gradient[index] {
                continue;
            }
            param.scaled_add(eta_l, &c_i[index]);
            param.scaled_add(-eta_l, &c[index]);
        }

        run.local_steps += 1;
        run.step_open = false;
        Ok(())
    }

    /// Phase 4: update `c_i` and emit this client's [`LocalUpdate`].
    ///
    /// With `K` local steps, last learning rate `eta_l`, start weights `x`
    /// and final weights `y_i`:
    ///
    /// - `c_i_new = c_i_old - (x - y_i) / (K * eta_l)`
    /// - `delta_y_i = y_i - x`
    /// - `delta_c_i = c_i_new - c_i_old`
    ///
    /// Any failure discards the run without touching `c_i`; the caller must
    /// leave this client out of the round.
    pub fn finish_run(&mut self, model: &dyn TrainableModel) -> Result<LocalUpdate> {
        let update = self.stage_finish(model)?;
        self.commit_finish();
        Ok(update)
    }

    /// First half of [`finish_run`](Self::finish_run): compute the update and
    /// stage `c_i_new` without persisting it.
    ///
    /// `c_i` only changes on [`commit_finish`](Self::commit_finish);
    /// [`abort_run`](Self::abort_run) drops the staged value.
    pub fn stage_finish(&mut self, model: &dyn TrainableModel) -> Result<LocalUpdate> {
        let run = match std::mem::replace(&mut self.state, State::NotStarted) {
            State::Initialized(run) | State::Running(run) if !run.step_open => run,
            other => {
                let phase = other.phase();
                self.state = other;
                return Err(invalid_phase("finish_run", phase));
            }
        };

        if run.local_steps == 0 {
            return Err(ScaffoldError::ZeroLocalSteps);
        }
        let eta_l = run.learning_rate;
        if eta_l == 0.0 || !eta_l.is_finite() {
            return Err(ScaffoldError::InvalidLearningRate(eta_l));
        }

        let c_i_old = self
            .local_control_variate
            .as_ref()
            .ok_or(ScaffoldError::Uninitialized)?;
        let x = &run.initial_weights;
        let y_i = ParameterVector::from_arrays(model.parameters());
        let drift = x.sub(&y_i)?;

        let mut c_i_new = c_i_old.clone();
        c_i_new.scaled_add(-1.0 / (run.local_steps as f32 * eta_l), &drift)?;
        let delta_y_i = y_i.sub(x)?;
        let delta_c_i = c_i_new.sub(c_i_old)?;

        debug!(
            "scaffold run finished: steps={} lr={} |dy|={:.6} |dc|={:.6}",
            run.local_steps,
            eta_l,
            delta_y_i.l2_norm(),
            delta_c_i.l2_norm()
        );
        self.staged_control_variate = Some(c_i_new);
        self.state = State::Completed;
        Ok(LocalUpdate::new(delta_y_i, delta_c_i, model.num_samples()))
    }

    /// Persist the `c_i` staged by [`stage_finish`](Self::stage_finish).
    ///
    /// No-op when nothing is staged.
    pub fn commit_finish(&mut self) {
        if let Some(c_i_new) = self.staged_control_variate.take() {
            self.local_control_variate = Some(c_i_new);
        }
    }

    /// Whether a finished run is waiting for [`commit_finish`](Self::commit_finish).
    pub fn has_staged_update(&self) -> bool {
        self.staged_control_variate.is_some()
    }

    /// Discard the current run, or a finished run that was not committed yet.
    ///
    /// `c_i` is kept and no update is produced.
    pub fn abort_run(&mut self) {
        let staged = self.staged_control_variate.take().is_some();
        if staged || self.state.run().is_some() {
            debug!("scaffold run aborted");
        }
        self.state = State::NotStarted;
    }
}

fn invalid_phase(operation: &'static str, phase: Phase) -> ScaffoldError {
    ScaffoldError::InvalidPhase { operation, phase }
}

impl TrainingHook for ScaffoldCoordinator {
    fn requirement(&self) -> HookRequirement {
        HookRequirement::Scaffold
    }

    fn on_train_start(
        &mut self,
        model: &dyn TrainableModel,
        global: &GlobalStateSnapshot,
    ) -> Result<()> {
        self.start_run(model, &global.control_variate)
    }

    fn on_before_optimizer_step(&mut self, model: &dyn TrainableModel) -> Result<()> {
        self.before_step(model)
    }

    fn on_after_optimizer_step(&mut self, model: &mut dyn TrainableModel) -> Result<()> {
        self.after_step(model)
    }

    fn on_train_end(&mut self, model: &dyn TrainableModel) -> Result<Option<HookOutput>> {
        self.stage_finish(model).map(|u| Some(HookOutput::LocalUpdate(u)))
    }

    fn on_train_commit(&mut self) {
        self.commit_finish();
    }

    fn on_abort(&mut self) {
        self.abort_run();
    }
}
