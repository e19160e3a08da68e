//! Snapshot serialization: the minimal engine state needed to resume.
//!
//! Captures the region set, the capture set, the clock, the links with the
//! values they last installed, and each region's opaque model state. Output rows are persisted separately.
//! Player actions are not part of a snapshot; the save/load layer
//! resubmits whatever it wants active after a resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    capture::CaptureSet,
    clock::StepClock,
    link::Link,
    types::RegionId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub saved_at:         DateTime<Utc>,
    pub regions:          Vec<RegionId>,
    pub capture:          CaptureSet,
    pub clock:            StepClock,
    pub steps_per_second: f64,
    pub links:            Vec<Link>,
    /// Per link, the per-region target values of the last completed step.
    #[serde(default)]
    pub link_values:      Vec<Option<Vec<f64>>>,
    /// One entry per region, in region order.
    pub model_states:     Vec<serde_json::Value>,
}
