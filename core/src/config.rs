//! Engine configuration, loaded from JSON.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    error::{SimError, SimResult},
    link::Link,
    types::RegionId,
};

pub const DEFAULT_STEPS_PER_SECOND: f64 = 1.0;

fn default_rate() -> f64 {
    DEFAULT_STEPS_PER_SECOND
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub regions: Vec<RegionId>,
    /// `None` captures every model element except time bookkeeping.
    #[serde(default)]
    pub capture: Option<Vec<String>>,
    #[serde(default = "default_rate")]
    pub steps_per_second: f64,
    #[serde(default)]
    pub links: Vec<Link>,
}

impl EngineConfig {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            regions: regions.into_iter().map(Into::into).collect(),
            capture: None,
            steps_per_second: DEFAULT_STEPS_PER_SECOND,
            links: Vec::new(),
        }
    }

    pub fn with_capture<I, S>(mut self, capture: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capture = Some(capture.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_rate(mut self, steps_per_second: f64) -> Self {
        self.steps_per_second = steps_per_second;
        self
    }

    pub fn with_link(mut self, link: Link) -> Self {
        self.links.push(link);
        self
    }

    /// Load from a JSON file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.regions.is_empty() {
            return Err(SimError::invalid_config("at least one region is required"));
        }
        let mut seen = HashSet::new();
        for region in &self.regions {
            if region.is_empty() {
                return Err(SimError::invalid_config("region ids must not be empty"));
            }
            if !seen.insert(region.as_str()) {
                return Err(SimError::invalid_config(format!("duplicate region '{region}'")));
            }
        }
        validate_rate(self.steps_per_second)?;
        for link in &self.links {
            link.validate()?;
        }
        Ok(())
    }
}

pub(crate) fn validate_rate(steps_per_second: f64) -> SimResult<()> {
    if steps_per_second.is_nan() || steps_per_second < 0.0 {
        return Err(SimError::invalid_config(format!(
            "step rate must be >= 0, got {steps_per_second}"
        )));
    }
    Ok(())
}
