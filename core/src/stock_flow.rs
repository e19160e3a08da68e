//! A small system-dynamics model: stocks integrated with Euler steps,
//! flows and auxiliaries defined as expressions over other quantities.
//!
//! Definitions are JSON:
//!
//! ```json
//! {
//!   "initial_time": 0, "final_time": 100, "time_step": 1,
//!   "constants":   { "birth_rate": 0.03 },
//!   "stocks":      { "population": { "initial": 1000, "inflows": ["births"] } },
//!   "auxiliaries": { "births": { "mul": [{ "var": "population" }, { "var": "birth_rate" }] } }
//! }
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};

use crate::{
    model::{Evaluator, ModelFactory, SimulationModel},
    rng::RegionRng,
    types::TIME_ELEMENTS,
};

const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub initial_time: f64,
    pub final_time:   f64,
    pub time_step:    f64,
    #[serde(default)]
    pub constants:    BTreeMap<String, f64>,
    #[serde(default)]
    pub stocks:       BTreeMap<String, StockDefinition>,
    #[serde(default)]
    pub auxiliaries:  BTreeMap<String, Expr>,
    /// Fractional spread applied to initial stocks, per region.
    #[serde(default)]
    pub initial_variation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockDefinition {
    pub initial:  f64,
    #[serde(default)]
    pub inflows:  Vec<String>,
    #[serde(default)]
    pub outflows: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const(f64),
    Var(String),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    /// Division by zero yields 0.
    Div(Box<Expr>, Box<Expr>),
    Min(Vec<Expr>),
    Max(Vec<Expr>),
}

impl ModelDefinition {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("Cannot read {path}: {e}"))?;
        let definition: Self = serde_json::from_str(&content)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.time_step > 0.0) {
            bail!("time_step must be positive, got {}", self.time_step);
        }
        if self.final_time < self.initial_time {
            bail!("final_time {} is before initial_time {}", self.final_time, self.initial_time);
        }
        let mut seen: Vec<&str> = Vec::new();
        let names = self
            .constants
            .keys()
            .chain(self.stocks.keys())
            .chain(self.auxiliaries.keys());
        for name in names {
            if TIME_ELEMENTS.contains(&name.as_str()) || seen.contains(&name.as_str()) {
                bail!("quantity '{name}' is defined twice");
            }
            seen.push(name);
        }
        for (name, stock) in &self.stocks {
            for flow in stock.inflows.iter().chain(&stock.outflows) {
                if !seen.contains(&flow.as_str()) {
                    bail!("stock '{name}' refers to undefined flow '{flow}'");
                }
            }
        }
        Ok(())
    }
}

impl Expr {
    fn eval(&self, model: &dyn SimulationModel) -> anyhow::Result<f64> {
        Ok(match self {
            Self::Const(v) => *v,
            Self::Var(name) => model.get(name)?,
            Self::Add(terms) => terms.iter().map(|t| t.eval(model)).sum::<anyhow::Result<f64>>()?,
            Self::Mul(terms) => terms.iter().map(|t| t.eval(model)).product::<anyhow::Result<f64>>()?,
            Self::Sub(a, b) => a.eval(model)? - b.eval(model)?,
            Self::Div(a, b) => {
                let divisor = b.eval(model)?;
                if divisor == 0.0 { 0.0 } else { a.eval(model)? / divisor }
            }
            Self::Min(terms) => fold(terms, model, f64::min)?,
            Self::Max(terms) => fold(terms, model, f64::max)?,
        })
    }
}

fn fold(terms: &[Expr], model: &dyn SimulationModel, f: fn(f64, f64) -> f64) -> anyhow::Result<f64> {
    let mut values = terms.iter().map(|t| t.eval(model));
    let first = values.next().ok_or_else(|| anyhow!("min/max needs at least one term"))??;
    values.try_fold(first, |acc, v| Ok(f(acc, v?)))
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedState {
    time:   f64,
    stocks: BTreeMap<String, f64>,
}

pub struct StockFlowModel {
    definition: Arc<ModelDefinition>,
    time:       f64,
    stocks:     BTreeMap<String, f64>,
    overrides:  HashMap<String, Evaluator>,
    cache:      RefCell<HashMap<String, f64>>,
    depth:      Cell<usize>,
}

impl StockFlowModel {
    pub fn new(definition: Arc<ModelDefinition>, rng: Option<&mut RegionRng>) -> Self {
        let spread = definition.initial_variation;
        let mut stocks = BTreeMap::new();
        let mut rng = rng;
        for (name, stock) in &definition.stocks {
            let initial = match rng.as_deref_mut() {
                Some(rng) if spread > 0.0 => rng.vary(stock.initial, spread),
                _ => stock.initial,
            };
            stocks.insert(name.clone(), initial);
        }
        Self {
            time: definition.initial_time,
            definition,
            stocks,
            overrides: HashMap::new(),
            cache: RefCell::new(HashMap::new()),
            depth: Cell::new(0),
        }
    }

    pub fn stock(&self, name: &str) -> Option<f64> {
        self.stocks.get(name).copied()
    }

    fn net_flow(&self, stock: &StockDefinition) -> anyhow::Result<f64> {
        let mut net = 0.0;
        for flow in &stock.inflows {
            net += self.get(flow)?;
        }
        for flow in &stock.outflows {
            net -= self.get(flow)?;
        }
        Ok(net)
    }

    fn invalidate(&self) {
        self.cache.borrow_mut().clear();
    }
}

impl SimulationModel for StockFlowModel {
    fn get(&self, attr: &str) -> anyhow::Result<f64> {
        let depth = self.depth.get();
        if depth >= MAX_DEPTH {
            bail!("evaluation of '{attr}' is too deep (circular definition?)");
        }
        self.depth.set(depth + 1);
        let value = match self.overrides.get(attr) {
            Some(evaluator) => evaluator.evaluate(self),
            None => self.evaluate_native(attr),
        };
        self.depth.set(depth);
        value
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn time_step(&self) -> f64 {
        self.definition.time_step
    }

    fn final_time(&self) -> f64 {
        self.definition.final_time
    }

    fn advance(&mut self, dt: f64) -> anyhow::Result<()> {
        let mut next = BTreeMap::new();
        for (name, stock) in &self.definition.stocks {
            let level = self.stocks.get(name).copied().unwrap_or(stock.initial);
            let net = self
                .net_flow(stock)
                .with_context(|| format!("integrating stock '{name}'"))?;
            next.insert(name.clone(), level + net * dt);
        }
        self.stocks = next;
        self.time += dt;
        self.invalidate();
        Ok(())
    }

    fn commit_time(&mut self, t: f64) -> anyhow::Result<()> {
        self.time = t;
        self.invalidate();
        Ok(())
    }

    fn evaluate_native(&self, attr: &str) -> anyhow::Result<f64> {
        let def = &self.definition;
        match attr {
            "time" => return Ok(self.time),
            "initial_time" => return Ok(def.initial_time),
            "final_time" => return Ok(def.final_time),
            "time_step" | "saveper" => return Ok(def.time_step),
            _ => {}
        }
        if let Some(value) = def.constants.get(attr) {
            return Ok(*value);
        }
        if let Some(value) = self.stocks.get(attr) {
            return Ok(*value);
        }
        if let Some(expr) = def.auxiliaries.get(attr) {
            if let Some(value) = self.cache.borrow().get(attr) {
                return Ok(*value);
            }
            let value = expr.eval(self)?;
            self.cache.borrow_mut().insert(attr.to_string(), value);
            return Ok(value);
        }
        bail!("unknown quantity '{attr}'")
    }

    fn set_override(&mut self, attr: &str, evaluator: Evaluator) {
        self.overrides.insert(attr.to_string(), evaluator);
        self.invalidate();
    }

    fn clear_override(&mut self, attr: &str) -> Option<Evaluator> {
        let removed = self.overrides.remove(attr);
        self.invalidate();
        removed
    }

    fn override_for(&self, attr: &str) -> Option<Evaluator> {
        self.overrides.get(attr).cloned()
    }

    fn element_names(&self) -> Vec<String> {
        let def = &self.definition;
        TIME_ELEMENTS
            .iter()
            .map(|s| s.to_string())
            .chain(def.constants.keys().cloned())
            .chain(def.stocks.keys().cloned())
            .chain(def.auxiliaries.keys().cloned())
            .collect()
    }

    fn save_state(&self) -> anyhow::Result<Option<serde_json::Value>> {
        let state = SavedState { time: self.time, stocks: self.stocks.clone() };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn restore_state(&mut self, state: &serde_json::Value) -> anyhow::Result<()> {
        let saved: SavedState = serde_json::from_value(state.clone())?;
        for name in saved.stocks.keys() {
            if !self.definition.stocks.contains_key(name) {
                bail!("saved state has unknown stock '{name}'");
            }
        }
        self.time = saved.time;
        self.stocks.extend(saved.stocks);
        self.invalidate();
        Ok(())
    }
}

/// Builds one `StockFlowModel` per region from a shared definition.
/// Initial stocks vary per region through a seeded stream.
pub struct StockFlowFactory {
    definition: Arc<ModelDefinition>,
    seed:       u64,
}

impl StockFlowFactory {
    pub fn new(definition: ModelDefinition, seed: u64) -> Self {
        Self { definition: Arc::new(definition), seed }
    }
}

impl ModelFactory for StockFlowFactory {
    fn create(&self, region_index: usize, _region: &str) -> anyhow::Result<Box<dyn SimulationModel>> {
        self.definition.validate()?;
        let mut rng = RegionRng::new(self.seed, region_index);
        Ok(Box::new(StockFlowModel::new(Arc::clone(&self.definition), Some(&mut rng))))
    }
}
