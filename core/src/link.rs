//! Coupling rules between regions.
//!
//! Links are evaluated once per step, after every region has advanced and
//! before any region commits. They read this step's source values and
//! install this step's target values as overrides, so the coupled value is
//! visible in the same step it was computed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{
    error::{SimError, SimResult},
    model::{Computation, Evaluator, SimulationModel},
    types::Attribute,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    #[serde(flatten)]
    pub kind:             LinkKind,
    pub source_attribute: Attribute,
    pub target_attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkKind {
    /// Sum of the source over all regions, broadcast to every region.
    Sum,
    /// Mean of the source over all regions, broadcast to every region.
    Average,
    /// Exports pooled and split back out as per-region imports.
    ImportExport { method: Method },
}

/// Allocation strategy of an import/export link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Method {
    EquallyDistributed,
    WeightedAverage {
        weight_attribute: Attribute,
    },
    /// Serve regions in preference order, highest first unless `reverse`.
    FulfilImports {
        preference_attribute: Attribute,
        #[serde(default)]
        reverse: bool,
    },
}

impl Link {
    pub fn sum(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { kind: LinkKind::Sum, source_attribute: source.into(), target_attribute: target.into() }
    }

    pub fn average(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self { kind: LinkKind::Average, source_attribute: source.into(), target_attribute: target.into() }
    }

    pub fn import_export(export: impl Into<String>, import: impl Into<String>, method: Method) -> Self {
        Self {
            kind: LinkKind::ImportExport { method },
            source_attribute: export.into(),
            target_attribute: import.into(),
        }
    }

    pub fn validate(&self) -> SimResult<()> {
        if self.source_attribute.is_empty() || self.target_attribute.is_empty() {
            return Err(SimError::invalid_config("link attribute names must not be empty"));
        }
        match &self.kind {
            LinkKind::ImportExport { method: Method::WeightedAverage { weight_attribute } }
                if weight_attribute.is_empty() =>
            {
                Err(SimError::invalid_config("weighted average link needs a weight attribute"))
            }
            LinkKind::ImportExport { method: Method::FulfilImports { preference_attribute, .. } }
                if preference_attribute.is_empty() =>
            {
                Err(SimError::invalid_config("fulfil imports link needs a preference attribute"))
            }
            _ => Ok(()),
        }
    }
}

// ── Allocation methods ─────────────────────────────────────────

/// `import[i] = sum(export) / n`.
pub fn equally_distributed(exports: &[f64]) -> Vec<f64> {
    if exports.is_empty() {
        return Vec::new();
    }
    let share = exports.iter().sum::<f64>() / exports.len() as f64;
    vec![share; exports.len()]
}

/// `import[i] = sum(export) * weight[i] / sum(weight)`.
/// A zero total weight leaves nothing to split on, so every import is 0.
pub fn weighted_average(exports: &[f64], weights: &[f64]) -> Vec<f64> {
    let total_export: f64 = exports.iter().sum();
    let total_weight: f64 = weights.iter().sum();
    if total_weight == 0.0 {
        log::warn!("weighted average link: total weight is zero, imports set to 0");
        return vec![0.0; weights.len()];
    }
    weights.iter().map(|w| total_export * w / total_weight).collect()
}

/// Greedy rationing of the pooled exports.
///
/// Regions are visited by preference, descending (ascending with
/// `reverse`), ties in index order. Each visited region is granted
/// `min(required, pool)` and the pool shrinks by the full `required`.
/// Visiting stops once the pool is no longer positive; leftovers are
/// discarded. `required` is only called for regions actually visited.
pub fn fulfil_imports<E>(
    exports: &[f64],
    preferences: &[f64],
    reverse: bool,
    mut required: impl FnMut(usize) -> Result<f64, E>,
) -> Result<Vec<f64>, E> {
    let mut pool: f64 = exports.iter().sum();
    let mut order: Vec<usize> = (0..preferences.len()).collect();
    order.sort_by(|&a, &b| {
        let ord = preferences[a].total_cmp(&preferences[b]);
        if reverse { ord } else { ord.reverse() }
    });

    let mut imports = vec![0.0; preferences.len()];
    for index in order {
        if pool <= 0.0 {
            break;
        }
        let need = required(index)?;
        imports[index] = need.min(pool);
        pool -= need;
    }
    Ok(imports)
}

// ── Runtime ────────────────────────────────────────────────────

/// A model failure during link evaluation, with the index of the region.
#[derive(Debug)]
pub(crate) struct LinkFailure {
    pub index:  usize,
    pub source: anyhow::Error,
}

/// A configured link plus the state it keeps between steps.
#[derive(Debug)]
pub(crate) struct LinkRuntime {
    pub link:  Link,
    /// Pre-override computation of the target per region, captured on the
    /// first evaluation of a fulfil-imports link.
    originals: Option<Vec<Computation>>,
    /// Per-region target values installed by the last successful apply.
    installed: Option<Vec<f64>>,
}

impl LinkRuntime {
    pub fn new(link: Link) -> Self {
        Self { link, originals: None, installed: None }
    }

    /// Rebuild a link on freshly restored models and put back the target
    /// values it installed before the save.
    pub fn restored(
        link: Link,
        installed: Option<Vec<f64>>,
        models: &mut [Box<dyn SimulationModel>],
    ) -> SimResult<Self> {
        let mut runtime = Self::new(link);
        let Some(values) = installed else {
            return Ok(runtime);
        };
        if values.len() != models.len() {
            return Err(SimError::invalid_config(format!(
                "saved link values cover {} regions, expected {}",
                values.len(),
                models.len()
            )));
        }
        let target = &runtime.link.target_attribute;
        if matches!(
            runtime.link.kind,
            LinkKind::ImportExport { method: Method::FulfilImports { .. } }
        ) {
            runtime.originals = Some(
                models
                    .iter()
                    .map(|model| Computation::current(model.as_ref(), target))
                    .collect(),
            );
        }
        install(models, target, &values);
        runtime.installed = Some(values);
        Ok(runtime)
    }

    pub fn installed(&self) -> Option<&[f64]> {
        self.installed.as_deref()
    }

    pub fn apply(&mut self, models: &mut [Box<dyn SimulationModel>]) -> Result<(), LinkFailure> {
        let source = &self.link.source_attribute;
        let target = &self.link.target_attribute;
        let values = gather(models, source)?;

        let targets = match &self.link.kind {
            LinkKind::Sum => {
                let total: f64 = values.iter().sum();
                vec![total; models.len()]
            }
            LinkKind::Average => {
                let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
                vec![mean; models.len()]
            }
            LinkKind::ImportExport { method } => {
                let imports = match method {
                    Method::EquallyDistributed => equally_distributed(&values),
                    Method::WeightedAverage { weight_attribute } => {
                        let weights = gather(models, weight_attribute)?;
                        weighted_average(&values, &weights)
                    }
                    Method::FulfilImports { preference_attribute, reverse } => {
                        let originals = self.originals.get_or_insert_with(|| {
                            models
                                .iter()
                                .map(|model| Computation::current(model.as_ref(), target))
                                .collect()
                        });
                        let preferences = gather(models, preference_attribute)?;
                        fulfil_imports(&values, &preferences, *reverse, |index| {
                            originals[index]
                                .evaluate(models[index].as_ref(), target)
                                .map_err(|source| LinkFailure { index, source })
                        })?
                    }
                };
                log::trace!("link {source}->{target}: imports={imports:?}");
                imports
            }
        };
        install(models, target, &targets);
        self.installed = Some(targets);
        Ok(())
    }
}

fn gather(models: &[Box<dyn SimulationModel>], attr: &str) -> Result<Vec<f64>, LinkFailure> {
    models
        .iter()
        .enumerate()
        .map(|(index, model)| model.get(attr).map_err(|source| LinkFailure { index, source }))
        .collect()
}

fn install(models: &mut [Box<dyn SimulationModel>], attr: &str, values: &[f64]) {
    for (model, value) in models.iter_mut().zip(values) {
        model.set_override(attr, Evaluator::constant(*value));
    }
}
