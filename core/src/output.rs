//! Append-only time series of captured values.
//!
//! RULE: Only the stepping thread appends. Rows are never rewritten.
//! Readers take a snapshot under the read lock and may see the log grow
//! between two calls.

use std::ops::RangeBounds;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::{
    capture::CaptureSet,
    error::{SimError, SimResult},
    sync::{read, write},
    types::{RegionId, StepIndex},
};

/// One completed step. `values` is region-major: for region `r` and
/// capture position `a`, the value is at `r * capture.len() + a`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub step:   StepIndex,
    pub time:   f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub step:  StepIndex,
    pub time:  f64,
    pub value: f64,
}

#[derive(Debug)]
pub struct OutputLog {
    regions: Vec<RegionId>,
    capture: CaptureSet,
    rows:    RwLock<Vec<OutputRow>>,
}

impl OutputLog {
    pub fn new(regions: Vec<RegionId>, capture: CaptureSet) -> Self {
        Self { regions, capture, rows: RwLock::new(Vec::new()) }
    }

    /// Rebuild from previously persisted rows.
    pub fn with_rows(regions: Vec<RegionId>, capture: CaptureSet, rows: Vec<OutputRow>) -> SimResult<Self> {
        let log = Self::new(regions, capture);
        for row in rows {
            log.append(row)?;
        }
        Ok(log)
    }

    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    pub fn capture(&self) -> &CaptureSet {
        &self.capture
    }

    pub(crate) fn append(&self, row: OutputRow) -> SimResult<()> {
        let expected = self.regions.len() * self.capture.len();
        if row.values.len() != expected {
            return Err(SimError::Other(anyhow::anyhow!(
                "output row for step {} has {} values, expected {expected}",
                row.step,
                row.values.len()
            )));
        }
        let mut rows = write(&self.rows);
        if let Some(last) = rows.last() {
            if row.step <= last.step {
                return Err(SimError::Other(anyhow::anyhow!(
                    "output row for step {} appended after step {}",
                    row.step,
                    last.step
                )));
            }
        }
        rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        read(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_step(&self) -> Option<StepIndex> {
        read(&self.rows).last().map(|row| row.step)
    }

    /// Copy of every row currently in the log.
    pub fn rows(&self) -> Vec<OutputRow> {
        read(&self.rows).clone()
    }

    /// Copy of the rows with a step strictly after `step`.
    pub fn rows_after(&self, step: StepIndex) -> Vec<OutputRow> {
        read(&self.rows).iter().filter(|row| row.step > step).cloned().collect()
    }

    pub fn time_axis(&self) -> Vec<f64> {
        read(&self.rows).iter().map(|row| row.time).collect()
    }

    fn column(&self, region: &str, attribute: &str) -> SimResult<usize> {
        let r = self
            .regions
            .iter()
            .position(|id| id == region)
            .ok_or_else(|| SimError::InvalidRegion { region: region.to_string() })?;
        let a = self.capture.position(attribute).ok_or_else(|| {
            SimError::invalid_config(format!("attribute '{attribute}' is not captured"))
        })?;
        Ok(r * self.capture.len() + a)
    }

    /// Value of `attribute` in `region` at `step`, if that step is logged.
    pub fn value(&self, step: StepIndex, region: &str, attribute: &str) -> SimResult<Option<f64>> {
        let col = self.column(region, attribute)?;
        let rows = read(&self.rows);
        Ok(rows.iter().find(|row| row.step == step).map(|row| row.values[col]))
    }

    /// The series of `attribute` in `region` over the steps in `steps`.
    pub fn series(
        &self,
        region: &str,
        attribute: &str,
        steps: impl RangeBounds<StepIndex>,
    ) -> SimResult<Vec<SeriesPoint>> {
        let col = self.column(region, attribute)?;
        let rows = read(&self.rows);
        Ok(rows
            .iter()
            .filter(|row| steps.contains(&row.step))
            .map(|row| SeriesPoint { step: row.step, time: row.time, value: row.values[col] })
            .collect())
    }
}
