//! Player actions and the queue they travel through.
//!
//! RULE: Actions are only ever applied by the stepping thread, at a step
//! boundary, before any model is advanced. The UI side only submits.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use crate::{
    error::{SimError, SimResult},
    model::{Computation, Evaluator, SimulationModel},
    sync::lock,
    types::{Attribute, RegionId, StepIndex},
};

/// A named, activatable unit of runtime model modification.
#[derive(Debug, Clone)]
pub struct Action {
    pub name:      String,
    /// `None` targets every region.
    pub region:    Option<RegionId>,
    /// The activation state the player asks for.
    pub activated: bool,
    pub kind:      ActionKind,
}

#[derive(Debug, Clone)]
pub enum ActionKind {
    Policy(Policy),
    Budget(Budget),
    Edict(Edict),
}

#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub modifiers: Vec<Modifier>,
}

/// One `(attribute, evaluator)` pair a policy installs.
#[derive(Debug, Clone)]
pub struct Modifier {
    pub attribute: Attribute,
    pub evaluator: Evaluator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Budget {
    pub attribute: Attribute,
    pub value:     f64,
}

/// Reserved action kind. Carries a description and has no model effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Edict {
    pub description: String,
}

impl Action {
    pub fn policy(name: impl Into<String>, region: Option<RegionId>, modifiers: Vec<Modifier>) -> Self {
        Self {
            name: name.into(),
            region,
            activated: true,
            kind: ActionKind::Policy(Policy { modifiers }),
        }
    }

    pub fn budget(
        name: impl Into<String>,
        region: Option<RegionId>,
        attribute: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            name: name.into(),
            region,
            activated: true,
            kind: ActionKind::Budget(Budget { attribute: attribute.into(), value }),
        }
    }

    pub fn edict(name: impl Into<String>, region: Option<RegionId>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region,
            activated: true,
            kind: ActionKind::Edict(Edict { description: description.into() }),
        }
    }

    /// The same action, asking for the opposite activation state.
    pub fn deactivated(mut self) -> Self {
        self.activated = false;
        self
    }

    pub fn with_activated(mut self, activated: bool) -> Self {
        self.activated = activated;
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            ActionKind::Policy(_) => "policy",
            ActionKind::Budget(_) => "budget",
            ActionKind::Edict(_)  => "edict",
        }
    }
}

impl Modifier {
    pub fn new(attribute: impl Into<String>, evaluator: Evaluator) -> Self {
        Self { attribute: attribute.into(), evaluator }
    }
}

/// A queued action with its submission step and a unique id.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    pub action_id: String,
    pub queued_at: StepIndex,
    pub action:    Action,
}

/// Thread-safe FIFO inbox of submitted actions.
///
/// Region validation happens here, synchronously, so an action naming an
/// unknown region never reaches the stepping thread.
#[derive(Debug)]
pub struct ActionQueue {
    regions: Arc<HashSet<RegionId>>,
    pending: Mutex<VecDeque<QueuedAction>>,
}

impl ActionQueue {
    pub fn new(regions: Arc<HashSet<RegionId>>) -> Self {
        Self { regions, pending: Mutex::new(VecDeque::new()) }
    }

    /// Append an action. Returns the id assigned to it.
    pub fn submit(&self, action: Action, queued_at: StepIndex) -> SimResult<String> {
        if let Some(region) = &action.region {
            if !self.regions.contains(region) {
                return Err(SimError::InvalidRegion { region: region.clone() });
            }
        }
        let action_id = uuid::Uuid::new_v4().to_string();
        log::debug!(
            "queued {} '{}' ({action_id}) for {:?}",
            action.kind_name(),
            action.name,
            action.region
        );
        lock(&self.pending).push_back(QueuedAction {
            action_id: action_id.clone(),
            queued_at,
            action,
        });
        Ok(action_id)
    }

    /// Pop every queued action in submission order, atomically.
    pub fn drain(&self) -> Vec<QueuedAction> {
        let mut pending = lock(&self.pending);
        std::mem::take(&mut *pending).into()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an applied action saved so it can be undone exactly.
#[derive(Debug, Clone)]
struct ActiveEntry {
    saved: Vec<(Attribute, Computation)>,
}

/// Activation state of every action, per region.
#[derive(Debug, Default)]
pub struct ActionBook {
    active: HashMap<(RegionId, String), ActiveEntry>,
}

impl ActionBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, region: &str, name: &str) -> bool {
        self.active.contains_key(&(region.to_string(), name.to_string()))
    }

    /// Names of the actions currently active on `region`, sorted.
    pub fn active_on(&self, region: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .active
            .keys()
            .filter(|(r, _)| r == region)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Apply `action` to one region's model.
    /// Returns true when the model or the book changed.
    pub fn apply(&mut self, action: &Action, region: &str, model: &mut dyn SimulationModel) -> bool {
        let key = (region.to_string(), action.name.clone());
        let was_active = self.active.contains_key(&key);

        match (&action.kind, was_active, action.activated) {
            (_, false, false) => false,
            (ActionKind::Policy(_), true, true) => false,

            (ActionKind::Policy(policy), false, true) => {
                let mut saved: Vec<(Attribute, Computation)> = Vec::new();
                for modifier in &policy.modifiers {
                    if !saved.iter().any(|(attr, _)| attr == &modifier.attribute) {
                        saved.push((
                            modifier.attribute.clone(),
                            Computation::current(model, &modifier.attribute),
                        ));
                    }
                    model.set_override(&modifier.attribute, modifier.evaluator.clone());
                }
                self.active.insert(key, ActiveEntry { saved });
                true
            }

            (ActionKind::Budget(budget), false, true) => {
                let saved = vec![(
                    budget.attribute.clone(),
                    Computation::current(model, &budget.attribute),
                )];
                model.set_override(&budget.attribute, Evaluator::constant(budget.value));
                self.active.insert(key, ActiveEntry { saved });
                true
            }

            // Re-applying an active budget replaces the constant; the
            // saved original stays the one from first activation. A budget
            // moved to another attribute gives the old one back first.
            (ActionKind::Budget(budget), true, true) => {
                if let Some(entry) = self.active.get_mut(&key) {
                    if entry.saved.iter().all(|(attr, _)| attr != &budget.attribute) {
                        log::info!(
                            "budget '{}' on {region} moved to '{}'",
                            action.name,
                            budget.attribute
                        );
                        for (attr, computation) in entry.saved.iter().rev() {
                            computation.reinstall(model, attr);
                        }
                        entry.saved = vec![(
                            budget.attribute.clone(),
                            Computation::current(model, &budget.attribute),
                        )];
                    }
                }
                model.set_override(&budget.attribute, Evaluator::constant(budget.value));
                true
            }

            (ActionKind::Edict(_), false, true) => {
                self.active.insert(key, ActiveEntry { saved: Vec::new() });
                true
            }
            (ActionKind::Edict(_), true, true) => false,

            (_, true, false) => {
                if let Some(entry) = self.active.remove(&key) {
                    for (attr, computation) in entry.saved.iter().rev() {
                        computation.reinstall(model, attr);
                    }
                }
                true
            }
        }
    }
}
