//! Scripted model for engine tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regionsim_core::{
    engine::StepEngine, EngineConfig, EngineEvent, Evaluator, SimulationModel,
};

/// Quantities are plain numbers; some grow by a fixed amount every advance.
#[derive(Clone)]
pub struct FakeModel {
    time:        f64,
    dt:          f64,
    final_time:  f64,
    values:      BTreeMap<String, f64>,
    growth:      BTreeMap<String, f64>,
    overrides:   HashMap<String, Evaluator>,
    advances:    usize,
    fail_at:     Option<usize>,
    broken:      Vec<String>,
    bad_commit:  bool,
    snapshots:   bool,
    trace:       Option<Arc<Mutex<Vec<String>>>>,
    name:        String,
}

impl FakeModel {
    pub fn new() -> Self {
        Self {
            time:       0.0,
            dt:         1.0,
            final_time: 1.0e9,
            values:     BTreeMap::new(),
            growth:     BTreeMap::new(),
            overrides:  HashMap::new(),
            advances:   0,
            fail_at:    None,
            broken:     Vec::new(),
            bad_commit: false,
            snapshots:  true,
            trace:      None,
            name:       String::new(),
        }
    }

    pub fn with(mut self, attr: &str, value: f64) -> Self {
        self.values.insert(attr.to_string(), value);
        self
    }

    pub fn growing(mut self, attr: &str, per_step: f64) -> Self {
        self.values.entry(attr.to_string()).or_insert(0.0);
        self.growth.insert(attr.to_string(), per_step);
        self
    }

    pub fn timing(mut self, start: f64, dt: f64, final_time: f64) -> Self {
        self.time = start;
        self.dt = dt;
        self.final_time = final_time;
        self
    }

    /// Fail on the n-th call to `advance` (1-based).
    pub fn failing_at(mut self, advance: usize) -> Self {
        self.fail_at = Some(advance);
        self
    }

    /// `attr` exists but every read of it fails.
    pub fn broken(mut self, attr: &str) -> Self {
        self.values.insert(attr.to_string(), 0.0);
        self.broken.push(attr.to_string());
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.bad_commit = true;
        self
    }

    pub fn without_snapshots(mut self) -> Self {
        self.snapshots = false;
        self
    }

    pub fn traced(mut self, name: &str, trace: Arc<Mutex<Vec<String>>>) -> Self {
        self.name = name.to_string();
        self.trace = Some(trace);
        self
    }

    fn record(&self, what: &str) {
        if let Some(trace) = &self.trace {
            trace.lock().unwrap().push(format!("{what}:{}", self.name));
        }
    }
}

impl SimulationModel for FakeModel {
    fn get(&self, attr: &str) -> anyhow::Result<f64> {
        if self.broken.iter().any(|b| b == attr) {
            anyhow::bail!("'{attr}' cannot be evaluated");
        }
        match self.overrides.get(attr) {
            Some(evaluator) => evaluator.evaluate(self),
            None => self.evaluate_native(attr),
        }
    }

    fn current_time(&self) -> f64 {
        self.time
    }

    fn time_step(&self) -> f64 {
        self.dt
    }

    fn final_time(&self) -> f64 {
        self.final_time
    }

    fn advance(&mut self, dt: f64) -> anyhow::Result<()> {
        self.advances += 1;
        if self.fail_at == Some(self.advances) {
            anyhow::bail!("integrator blew up on advance {}", self.advances);
        }
        for (attr, per_step) in &self.growth {
            *self.values.get_mut(attr).unwrap() += per_step;
        }
        self.time += dt;
        self.record("advance");
        Ok(())
    }

    fn commit_time(&mut self, t: f64) -> anyhow::Result<()> {
        if self.bad_commit {
            anyhow::bail!("commit refused at t={t}");
        }
        self.time = t;
        self.record("commit");
        Ok(())
    }

    fn evaluate_native(&self, attr: &str) -> anyhow::Result<f64> {
        if attr == "time" {
            return Ok(self.time);
        }
        self.values
            .get(attr)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown quantity '{attr}'"))
    }

    fn set_override(&mut self, attr: &str, evaluator: Evaluator) {
        self.overrides.insert(attr.to_string(), evaluator);
    }

    fn clear_override(&mut self, attr: &str) -> Option<Evaluator> {
        self.overrides.remove(attr)
    }

    fn override_for(&self, attr: &str) -> Option<Evaluator> {
        self.overrides.get(attr).cloned()
    }

    fn element_names(&self) -> Vec<String> {
        let mut names = vec!["time".to_string(), "time_step".to_string()];
        names.extend(self.values.keys().cloned());
        names
    }

    fn save_state(&self) -> anyhow::Result<Option<serde_json::Value>> {
        if !self.snapshots {
            return Ok(None);
        }
        Ok(Some(serde_json::json!({ "time": self.time, "values": self.values })))
    }

    fn restore_state(&mut self, state: &serde_json::Value) -> anyhow::Result<()> {
        self.time = state["time"].as_f64().ok_or_else(|| anyhow::anyhow!("missing time"))?;
        self.values = serde_json::from_value(state["values"].clone())?;
        Ok(())
    }
}

pub type FactoryFn = Box<dyn Fn(usize, &str) -> anyhow::Result<Box<dyn SimulationModel>>>;

/// One model per region, built by `build(region_index)`.
pub fn factory(build: impl Fn(usize) -> FakeModel + 'static) -> FactoryFn {
    Box::new(move |index, _region| Ok(Box::new(build(index)) as Box<dyn SimulationModel>))
}

pub fn engine(config: EngineConfig, build: impl Fn(usize) -> FakeModel + 'static) -> StepEngine {
    init_logging();
    StepEngine::new(config, &factory(build)).expect("build engine")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Values of `attr` across every region at `step`, in region order.
pub fn row(engine: &StepEngine, step: u64, attr: &str) -> Vec<f64> {
    let output = engine.output();
    engine
        .regions()
        .iter()
        .map(|region| output.value(step, region, attr).unwrap().expect("step logged"))
        .collect()
}

/// Wait until a `StepCompleted` for at least `step` arrives.
pub fn wait_for_step(events: &crossbeam_channel::Receiver<EngineEvent>, step: u64) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let left = deadline.saturating_duration_since(std::time::Instant::now());
        match events.recv_timeout(left) {
            Ok(EngineEvent::StepCompleted { step: s }) if s >= step => return,
            Ok(_) => continue,
            Err(e) => panic!("no step {step} within 10s: {e}"),
        }
    }
}
