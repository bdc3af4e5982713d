//! Capability requirement registry.
//!
//! Aggregation strategies declare the training hooks they need as
//! [`HookRequirement`] tags. The correction logic has to be written once per
//! training framework, so the registry maps `(requirement, framework)` to a
//! factory producing the framework's [`TrainingHook`].
//!
//! Registration is append-only: a second factory for the same key is
//! rejected. Resolution is lenient: a requirement with no factory for the
//! active framework is skipped with a warning and reported in
//! [`Resolution::missing`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ScaffoldError};
use crate::hooks::{GradientCaptureHook, HookChain, ScaffoldCoordinator, TrainingHook};

/// Framework id of the built-in `ndarray` hooks.
pub const NDARRAY_FRAMEWORK: &str = "ndarray";

/// Capability a training hook provides.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookRequirement {
    /// Snapshot parameter gradients at the end of each epoch
    GradientCapture,
    /// SCAFFOLD control-variate correction
    Scaffold,
}

impl fmt::Display for HookRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookRequirement::GradientCapture => write!(f, "gradient_capture"),
            HookRequirement::Scaffold => write!(f, "scaffold"),
        }
    }
}

/// Constructor for a fresh hook instance.
pub type HookFactory = Box<dyn Fn() -> Box<dyn TrainingHook> + Send + Sync>;

/// Hooks found for a set of requirements.
pub struct Resolution {
    /// One hook per satisfied requirement, in requirement order
    pub hooks: Vec<Box<dyn TrainingHook>>,
    /// Requirements with no implementation for the framework
    pub missing: Vec<HookRequirement>,
}

impl Resolution {
    /// Whether every requirement was satisfied.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Wrap the resolved hooks in a [`HookChain`].
    pub fn into_chain(self) -> HookChain {
        HookChain::new(self.hooks)
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provided: Vec<HookRequirement> = self.hooks.iter().map(|h| h.requirement()).collect();
        f.debug_struct("Resolution")
            .field("hooks", &provided)
            .field("missing", &self.missing)
            .finish()
    }
}

/// Map from `(requirement, framework)` to hook factories.
#[derive(Default)]
pub struct HookRegistry {
    factories: BTreeMap<(HookRequirement, String), HookFactory>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in hooks registered under [`NDARRAY_FRAMEWORK`].
    pub fn with_defaults() -> Self {
        let mut factories: BTreeMap<(HookRequirement, String), HookFactory> = BTreeMap::new();
        factories.insert(
            (HookRequirement::GradientCapture, NDARRAY_FRAMEWORK.to_string()),
            Box::new(|| Box::new(GradientCaptureHook::new()) as Box<dyn TrainingHook>),
        );
        factories.insert(
            (HookRequirement::Scaffold, NDARRAY_FRAMEWORK.to_string()),
            Box::new(|| Box::new(ScaffoldCoordinator::new()) as Box<dyn TrainingHook>),
        );
        Self { factories }
    }

    /// Register a factory for `(requirement, framework)`.
    ///
    /// Framework ids are case-insensitive. Fails with
    /// [`ScaffoldError::RegistrationConflict`] if the key is already taken.
    pub fn register<F>(
        &mut self,
        requirement: HookRequirement,
        framework: &str,
        factory: F,
    ) -> Result<()>
    where
        F: Fn() -> Box<dyn TrainingHook> + Send + Sync + 'static,
    {
        let key = (requirement, normalize(framework));
        if self.factories.contains_key(&key) {
            error!(
                "hook for requirement '{}' and framework '{}' is already registered",
                requirement, key.1
            );
            return Err(ScaffoldError::RegistrationConflict {
                requirement,
                framework: key.1,
            });
        }
        self.factories.insert(key, Box::new(factory));
        Ok(())
    }

    /// Whether a factory exists for `(requirement, framework)`.
    pub fn is_registered(&self, requirement: HookRequirement, framework: &str) -> bool {
        self.factories
            .contains_key(&(requirement, normalize(framework)))
    }

    /// Number of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Instantiate one hook per requirement for `framework`.
    ///
    /// Duplicate requirements are collapsed. Unregistered requirements are
    /// logged and listed in [`Resolution::missing`] instead of failing.
    pub fn resolve<I>(&self, requirements: I, framework: &str) -> Resolution
    where
        I: IntoIterator<Item = HookRequirement>,
    {
        let framework = normalize(framework);
        let requirements: BTreeSet<HookRequirement> = requirements.into_iter().collect();

        let mut hooks = Vec::with_capacity(requirements.len());
        let mut missing = Vec::new();
        for requirement in requirements {
            match self.factories.get(&(requirement, framework.clone())) {
                Some(factory) => hooks.push(factory()),
                None => {
                    warn!(
                        "no hook registered for requirement '{}' and framework '{}'",
                        requirement, framework
                    );
                    missing.push(requirement);
                }
            }
        }
        Resolution { hooks, missing }
    }
}

fn normalize(framework: &str) -> String {
    framework.trim().to_lowercase()
}
