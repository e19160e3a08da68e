//! The Simulation Model boundary.
//!
//! RULE: The engine never reaches into model internals.
//! It only knows quantity names and evaluators, and drives each model
//! through `SimulationModel`. Installing an alternate computation for a
//! quantity is always reversible through `override_for` / `clear_override`.

use std::fmt;
use std::sync::Arc;

/// One black-box stateful model instance, bound to exactly one region.
pub trait SimulationModel: Send {
    /// Evaluate a named quantity, honouring any installed override.
    fn get(&self, attr: &str) -> anyhow::Result<f64>;

    fn current_time(&self) -> f64;
    fn time_step(&self) -> f64;
    fn final_time(&self) -> f64;

    /// Integrate one step of length `dt`.
    /// Must not read any other region's live state.
    fn advance(&mut self, dt: f64) -> anyhow::Result<()>;

    /// Finalize the step at time `t` and release step-local caches.
    fn commit_time(&mut self, t: f64) -> anyhow::Result<()>;

    /// Evaluate the model's own equation for `attr`, ignoring overrides.
    fn evaluate_native(&self, attr: &str) -> anyhow::Result<f64>;

    /// Replace how `attr` is computed until cleared or replaced again.
    fn set_override(&mut self, attr: &str, evaluator: Evaluator);

    /// Remove the override on `attr`, returning it if one was installed.
    fn clear_override(&mut self, attr: &str) -> Option<Evaluator>;

    /// The override currently installed on `attr`, if any.
    fn override_for(&self, attr: &str) -> Option<Evaluator>;

    /// Names of every quantity the model defines. May be empty when the
    /// model cannot enumerate them.
    fn element_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Export the state needed to resume stepping.
    fn save_state(&self) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Load state previously produced by `save_state`.
    fn restore_state(&mut self, _state: &serde_json::Value) -> anyhow::Result<()> {
        anyhow::bail!("model does not support state restore")
    }
}

/// Builds one fresh model per region. All regions share the definition.
pub trait ModelFactory {
    fn create(&self, region_index: usize, region: &str) -> anyhow::Result<Box<dyn SimulationModel>>;
}

impl<F> ModelFactory for F
where
    F: Fn(usize, &str) -> anyhow::Result<Box<dyn SimulationModel>>,
{
    fn create(&self, region_index: usize, region: &str) -> anyhow::Result<Box<dyn SimulationModel>> {
        self(region_index, region)
    }
}

type EvalFn = dyn Fn(&dyn SimulationModel) -> anyhow::Result<f64> + Send + Sync;

/// An alternate computation for a named quantity.
#[derive(Clone)]
pub struct Evaluator {
    label: Arc<str>,
    func:  Arc<EvalFn>,
}

impl Evaluator {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn(&dyn SimulationModel) -> anyhow::Result<f64> + Send + Sync + 'static,
    {
        let label: String = label.into();
        Self { label: label.into(), func: Arc::new(func) }
    }

    /// An evaluator that always yields `value`.
    pub fn constant(value: f64) -> Self {
        Self::new(format!("const({value})"), move |_| Ok(value))
    }

    pub fn evaluate(&self, model: &dyn SimulationModel) -> anyhow::Result<f64> {
        (self.func)(model)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True when both handles point at the same computation.
    pub fn same_as(&self, other: &Evaluator) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Evaluator").field(&self.label).finish()
    }
}

/// How a quantity was being computed at some moment: either the model's
/// own equation or an installed override. Used to restore exactly.
#[derive(Debug, Clone)]
pub enum Computation {
    Native,
    Override(Evaluator),
}

impl Computation {
    /// Capture the computation currently in effect for `attr`.
    pub fn current(model: &dyn SimulationModel, attr: &str) -> Self {
        match model.override_for(attr) {
            Some(evaluator) => Self::Override(evaluator),
            None => Self::Native,
        }
    }

    pub fn evaluate(&self, model: &dyn SimulationModel, attr: &str) -> anyhow::Result<f64> {
        match self {
            Self::Native => model.evaluate_native(attr),
            Self::Override(evaluator) => evaluator.evaluate(model),
        }
    }

    /// Put this computation back in place on `model`.
    pub fn reinstall(&self, model: &mut dyn SimulationModel, attr: &str) {
        match self {
            Self::Native => {
                model.clear_override(attr);
            }
            Self::Override(evaluator) => model.set_override(attr, evaluator.clone()),
        }
    }
}
