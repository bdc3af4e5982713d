//! Training-loop hooks.
//!
//! The local training loop is owned by the host framework. It exposes its
//! model through [`TrainableModel`] and calls the [`TrainingHook`] lifecycle
//! methods in this order:
//!
//! 1. `on_train_start` once per run
//! 2. `on_before_optimizer_step` / `on_after_optimizer_step` around every optimizer step
//! 3. `on_train_epoch_end` after each epoch
//! 4. `on_train_end` once, unless the run was cancelled (then `on_abort`)
//! 5. `on_train_commit` once every hook's `on_train_end` succeeded, otherwise
//!    `on_abort` on every hook
//!
//! Hooks are resolved per framework by [`HookRegistry`](crate::registry::HookRegistry)
//! and run together through a [`HookChain`].

pub mod gradient_capture;
pub mod scaffold;

pub use gradient_capture::{CapturedGradients, GradientCaptureHook};
pub use scaffold::ScaffoldCoordinator;

use ndarray::ArrayD;

use crate::error::Result;
use crate::registry::HookRequirement;
use crate::update::{GlobalStateSnapshot, LocalUpdate};

/// View of the host framework's model during local training.
pub trait TrainableModel {
    /// Current parameter arrays, in model order.
    fn parameters(&self) -> &[ArrayD<f32>];

    /// Mutable access to the parameter arrays.
    fn parameters_mut(&mut self) -> &mut [ArrayD<f32>];

    /// Gradient of parameter `index` from the latest backward pass, if any.
    ///
    /// Frozen parameters return `None`.
    fn gradient(&self, index: usize) -> Option<&ArrayD<f32>>;

    /// Effective learning rate the optimizer will use for its next step.
    fn learning_rate(&self) -> f32;

    /// Number of local training samples.
    fn num_samples(&self) -> usize;
}

/// Lifecycle phase of a hook bound to a local training run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// No run in progress
    NotStarted,
    /// Run started, no optimizer step yet
    Initialized,
    /// At least one optimizer step begun
    Running,
    /// Run finished and its update emitted
    Completed,
}

/// Result produced by a hook when a run ends.
#[derive(Clone, Debug, PartialEq)]
pub enum HookOutput {
    /// SCAFFOLD weight and control-variate deltas
    LocalUpdate(LocalUpdate),
    /// Last gradient snapshot
    Gradients(CapturedGradients),
}

/// Callback set attached to one local training run.
pub trait TrainingHook: Send {
    /// Capability this hook implements.
    fn requirement(&self) -> HookRequirement;

    /// Called once before the first optimizer step.
    fn on_train_start(
        &mut self,
        _model: &dyn TrainableModel,
        _global: &GlobalStateSnapshot,
    ) -> Result<()> {
        Ok(())
    }

    /// Called right before every optimizer step.
    fn on_before_optimizer_step(&mut self, _model: &dyn TrainableModel) -> Result<()> {
        Ok(())
    }

    /// Called right after every optimizer step.
    fn on_after_optimizer_step(&mut self, _model: &mut dyn TrainableModel) -> Result<()> {
        Ok(())
    }

    /// Called after every training epoch.
    fn on_train_epoch_end(&mut self, _model: &dyn TrainableModel) -> Result<()> {
        Ok(())
    }

    /// Called once when training finishes.
    ///
    /// Hooks that keep state across runs must not persist it here; that
    /// happens in [`on_train_commit`](Self::on_train_commit).
    fn on_train_end(&mut self, model: &dyn TrainableModel) -> Result<Option<HookOutput>>;

    /// Called after `on_train_end` succeeded on every hook of the run.
    fn on_train_commit(&mut self) {}

    /// Called when the run is cancelled, or when any hook failed to end it.
    fn on_abort(&mut self) {}
}

/// Outputs collected from every hook at the end of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrainingOutputs {
    /// Update emitted by the SCAFFOLD coordinator
    pub local_update: Option<LocalUpdate>,
    /// Gradients captured at the last epoch end
    pub gradients: Option<CapturedGradients>,
}

/// Ordered set of hooks driven together by the host training loop.
///
/// A client resolves its chain once and reuses it every round so that
/// per-client state (the SCAFFOLD control variate) survives between runs.
#[derive(Default)]
pub struct HookChain {
    hooks: Vec<Box<dyn TrainingHook>>,
}

impl HookChain {
    /// Build a chain from resolved hooks.
    pub fn new(hooks: Vec<Box<dyn TrainingHook>>) -> Self {
        Self { hooks }
    }

    /// Append a hook at the end of the chain.
    pub fn push(&mut self, hook: Box<dyn TrainingHook>) {
        self.hooks.push(hook);
    }

    /// Number of hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Capabilities provided by the chain, in call order.
    pub fn requirements(&self) -> Vec<HookRequirement> {
        self.hooks.iter().map(|h| h.requirement()).collect()
    }

    /// Start a run on every hook.
    ///
    /// If any hook fails, the hooks already started are aborted.
    pub fn on_train_start(
        &mut self,
        model: &dyn TrainableModel,
        global: &GlobalStateSnapshot,
    ) -> Result<()> {
        for i in 0..self.hooks.len() {
            if let Err(e) = self.hooks[i].on_train_start(model, global) {
                self.hooks[..i].iter_mut().for_each(|h| h.on_abort());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Forward the pre-step callback.
    pub fn on_before_optimizer_step(&mut self, model: &dyn TrainableModel) -> Result<()> {
        self.hooks
            .iter_mut()
            .try_for_each(|h| h.on_before_optimizer_step(model))
    }

    /// Forward the post-step callback.
    pub fn on_after_optimizer_step(&mut self, model: &mut dyn TrainableModel) -> Result<()> {
        for hook in &mut self.hooks {
            hook.on_after_optimizer_step(model)?;
        }
        Ok(())
    }

    /// Forward the epoch-end callback.
    pub fn on_train_epoch_end(&mut self, model: &dyn TrainableModel) -> Result<()> {
        self.hooks
            .iter_mut()
            .try_for_each(|h| h.on_train_epoch_end(model))
    }

    /// Finish the run on every hook, then commit, and collect their outputs.
    ///
    /// If any hook fails, every hook is aborted (including those that already
    /// ended) and the error is returned. No hook keeps an effect of the run
    /// and no outputs are produced in that case.
    pub fn on_train_end(&mut self, model: &dyn TrainableModel) -> Result<TrainingOutputs> {
        let mut outputs = TrainingOutputs::default();
        for i in 0..self.hooks.len() {
            match self.hooks[i].on_train_end(model) {
                Ok(Some(HookOutput::LocalUpdate(update))) => outputs.local_update = Some(update),
                Ok(Some(HookOutput::Gradients(grads))) => outputs.gradients = Some(grads),
                Ok(None) => {}
                Err(e) => {
                    self.abort();
                    return Err(e);
                }
            }
        }
        self.hooks.iter_mut().for_each(|h| h.on_train_commit());
        Ok(outputs)
    }

    /// Cancel the run on every hook.
    pub fn abort(&mut self) {
        self.hooks.iter_mut().for_each(|h| h.on_abort());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal SGD model used by hook tests.

    use ndarray::ArrayD;

    use super::TrainableModel;

    pub struct SgdModel {
        pub params: Vec<ArrayD<f32>>,
        pub grads: Vec<Option<ArrayD<f32>>>,
        pub lr: f32,
        pub samples: usize,
    }

    impl SgdModel {
        pub fn scalars(values: &[f32], lr: f32) -> Self {
            Self {
                params: values
                    .iter()
                    .map(|&v| ArrayD::from_elem(vec![1], v))
                    .collect(),
                grads: vec![None; values.len()],
                lr,
                samples: 10,
            }
        }

        pub fn set_grads(&mut self, grads: &[Option<f32>]) {
            self.grads = grads
                .iter()
                .map(|g| g.map(|v| ArrayD::from_elem(vec![1], v)))
                .collect();
        }

        pub fn sgd_step(&mut self) {
            for (p, g) in self.params.iter_mut().zip(&self.grads) {
                if let Some(g) = g {
                    p.scaled_add(-self.lr, g);
                }
            }
        }

        pub fn values(&self) -> Vec<f32> {
            self.params.iter().map(|p| p.sum()).collect()
        }
    }

    impl TrainableModel for SgdModel {
        fn parameters(&self) -> &[ArrayD<f32>] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [ArrayD<f32>] {
            &mut self.params
        }

        fn gradient(&self, index: usize) -> Option<&ArrayD<f32>> {
            self.grads.get(index).and_then(|g| g.as_ref())
        }

        fn learning_rate(&self) -> f32 {
            self.lr
        }

        fn num_samples(&self) -> usize {
            self.samples
        }
    }
}
