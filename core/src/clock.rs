//! Simulation clock: owns step state and the step-rate pacing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::StepIndex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepClock {
    /// Last completed step. 0 before the first step.
    pub current_step: StepIndex,
    pub start_time:   f64,
    pub time_step:    f64,
    pub final_time:   f64,
}

impl StepClock {
    pub fn new(start_time: f64, time_step: f64, final_time: f64) -> Self {
        Self {
            current_step: 0,
            start_time,
            time_step,
            final_time,
        }
    }

    /// Simulation time reached after `step` steps.
    pub fn time_at(&self, step: StepIndex) -> f64 {
        self.start_time + step as f64 * self.time_step
    }

    pub fn current_time(&self) -> f64 {
        self.time_at(self.current_step)
    }

    pub fn next_step(&self) -> StepIndex {
        self.current_step + 1
    }

    /// True when the next step would go past the final time.
    pub fn is_finished(&self) -> bool {
        let eps = self.time_step.abs() * 1e-9;
        self.time_at(self.next_step()) > self.final_time + eps
    }

    /// Record `step` as completed. Steps only ever move forward by one.
    pub fn complete(&mut self, step: StepIndex) {
        debug_assert_eq!(step, self.next_step(), "steps must complete in order");
        self.current_step = step;
    }
}

/// Real time each step should take at `steps_per_second`.
/// A rate of 0 runs unthrottled.
pub fn step_period(steps_per_second: f64) -> Option<Duration> {
    if steps_per_second > 0.0 && steps_per_second.is_finite() {
        Some(Duration::from_secs_f64(1.0 / steps_per_second))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_is_derived_from_step_count() {
        let mut clock = StepClock::new(2.0, 0.5, 10.0);
        assert_eq!(clock.current_time(), 2.0);
        clock.complete(1);
        clock.complete(2);
        assert_eq!(clock.current_time(), 3.0);
    }

    #[test]
    fn finishes_at_final_time() {
        let mut clock = StepClock::new(0.0, 1.0, 2.0);
        assert!(!clock.is_finished());
        clock.complete(1);
        assert!(!clock.is_finished());
        clock.complete(2);
        assert!(clock.is_finished());
    }

    #[test]
    fn zero_rate_is_unthrottled() {
        assert_eq!(step_period(0.0), None);
        assert_eq!(step_period(4.0), Some(Duration::from_millis(250)));
    }
}
