//! The set of quantities recorded for every region at every step.

use serde::{Deserialize, Serialize};

use crate::{
    error::{SimError, SimResult},
    types::{Attribute, TIME_ELEMENTS},
};

/// Ordered, duplicate-free list of attribute names. Fixed once the engine
/// is built and persisted with the game so re-runs capture the same set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaptureSet(Vec<Attribute>);

impl CaptureSet {
    /// Build from a list; later duplicates are dropped, order is kept.
    pub fn new<I, S>(attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<Attribute> = Vec::new();
        for attr in attributes {
            let attr = attr.into();
            if !set.contains(&attr) {
                set.push(attr);
            }
        }
        Self(set)
    }

    /// Every element a model reports, minus the time bookkeeping names.
    pub fn from_elements(elements: &[String]) -> Self {
        Self::new(
            elements
                .iter()
                .filter(|name| !TIME_ELEMENTS.contains(&name.as_str()))
                .cloned(),
        )
    }

    /// Reject attributes the model does not define. A model that cannot
    /// enumerate its elements accepts anything.
    pub fn validate_against(&self, elements: &[String]) -> SimResult<()> {
        if elements.is_empty() {
            return Ok(());
        }
        match self.0.iter().find(|attr| !elements.contains(attr)) {
            Some(unknown) => Err(SimError::invalid_config(format!(
                "capture attribute '{unknown}' is not defined by the model"
            ))),
            None => Ok(()),
        }
    }

    pub fn position(&self, attr: &str) -> Option<usize> {
        self.0.iter().position(|a| a == attr)
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capture_skips_time_elements() {
        let elements: Vec<String> = ["time", "population", "time_step", "food", "saveper"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let set = CaptureSet::from_elements(&elements);
        assert_eq!(set.attributes(), &["population".to_string(), "food".to_string()]);
    }

    #[test]
    fn duplicates_are_dropped_in_order() {
        let set = CaptureSet::new(["b", "a", "b"]);
        assert_eq!(set.attributes(), &["b".to_string(), "a".to_string()]);
        assert_eq!(set.position("a"), Some(1));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let set = CaptureSet::new(["ghost"]);
        assert!(set.validate_against(&["population".to_string()]).is_err());
        assert!(set.validate_against(&[]).is_ok());
    }
}
