//! Engine notifications for external consumers (UI, plots, statistics).
//!
//! RULE: Notifications never carry model state. Consumers re-query the
//! OutputLog after `StepCompleted`.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::{
    action::Action,
    sync::lock,
    types::StepIndex,
};

#[derive(Debug, Clone)]
pub enum EngineEvent {
    StepCompleted {
        step: StepIndex,
    },
    ActionApplied {
        action: Action,
    },
    Paused,
    /// The step loop exited. `error` is set when it exited on a failure.
    Stopped {
        step:  StepIndex,
        error: Option<String>,
    },
    /// The models reached their final time; the loop paused itself.
    Finished {
        step: StepIndex,
        time: f64,
    },
}

impl EngineEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StepCompleted { .. } => "step_completed",
            Self::ActionApplied { .. } => "action_applied",
            Self::Paused               => "paused",
            Self::Stopped { .. }       => "stopped",
            Self::Finished { .. }      => "finished",
        }
    }
}

/// Fan-out of engine events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        log::trace!("event {} -> {} subscriber(s)", event.type_name(), subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}
