//! Multi-region simulation stepping engine.
//!
//! One opaque simulation model per region, advanced in lock-step on a
//! schedule decoupled from rendering. Players inject actions that are
//! applied at step boundaries; links couple regions every step; captured
//! values land in an append-only output log.

pub mod action;
pub mod capture;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod link;
pub mod model;
pub mod output;
pub mod rng;
pub mod snapshot;
pub mod stock_flow;
pub mod store;
pub mod types;

mod sync;

pub use action::{Action, ActionKind, Budget, Edict, Modifier, Policy};
pub use config::EngineConfig;
pub use engine::{EngineWorker, StepEngine};
pub use error::{SimError, SimResult, StepPhase};
pub use event::EngineEvent;
pub use link::{Link, LinkKind, Method};
pub use model::{Computation, Evaluator, ModelFactory, SimulationModel};
