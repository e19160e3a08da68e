//! Shared primitive types used across the entire simulation.

/// A completed step index. Step 1 is the first step after initialisation.
pub type StepIndex = u64;

/// A stable, unique region identifier. Fixed for the lifetime of a game.
pub type RegionId = String;

/// The name of a model quantity (stock, flow, auxiliary, constant).
pub type Attribute = String;

/// The canonical run identifier used by the persistence layer.
pub type RunId = String;

/// Names every system-dynamics model reports that are time bookkeeping
/// rather than simulated quantities. Never captured by default.
pub const TIME_ELEMENTS: [&str; 5] = ["time", "initial_time", "final_time", "time_step", "saveper"];
