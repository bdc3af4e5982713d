//! Gradient capture hook.
//!
//! Snapshots every parameter's gradient at the end of each training epoch
//! and reports the most recent snapshot when the run ends.

use ndarray::ArrayD;

use super::{HookOutput, TrainableModel, TrainingHook};
use crate::error::Result;
use crate::registry::HookRequirement;
use crate::update::GlobalStateSnapshot;

/// Per-parameter gradients, `None` where the parameter had no gradient.
pub type CapturedGradients = Vec<Option<ArrayD<f32>>>;

/// Records the gradients seen at the last epoch end.
#[derive(Clone, Debug, Default)]
pub struct GradientCaptureHook {
    captured: Option<CapturedGradients>,
}

impl GradientCaptureHook {
    /// Create a hook with nothing captured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gradients captured so far in the current run.
    pub fn captured(&self) -> Option<&CapturedGradients> {
        self.captured.as_ref()
    }
}

impl TrainingHook for GradientCaptureHook {
    fn requirement(&self) -> HookRequirement {
        HookRequirement::GradientCapture
    }

    fn on_train_start(
        &mut self,
        _model: &dyn TrainableModel,
        _global: &GlobalStateSnapshot,
    ) -> Result<()> {
        self.captured = None;
        Ok(())
    }

    fn on_train_epoch_end(&mut self, model: &dyn TrainableModel) -> Result<()> {
        let n = model.parameters().len();
        self.captured = Some((0..n).map(|i| model.gradient(i).cloned()).collect());
        Ok(())
    }

    fn on_train_end(&mut self, _model: &dyn TrainableModel) -> Result<Option<HookOutput>> {
        Ok(self.captured.take().map(HookOutput::Gradients))
    }

    fn on_abort(&mut self) {
        self.captured = None;
    }
}
