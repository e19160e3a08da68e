//! sim-runner: headless runner for the regional stepping engine.
//!
//! Usage:
//!   sim-runner --scenario data/scenario.json --steps 40
//!   sim-runner --scenario data/scenario.json --steps 40 --seed 7 --db run.db --rate 20

use anyhow::{Context, Result};
use regionsim_core::{
    stock_flow::{ModelDefinition, StockFlowFactory},
    store::SimStore,
    Action, EngineConfig, EngineEvent, StepEngine,
};
use std::env;

/// Engine configuration, model definition and scripted budgets in one file.
#[derive(serde::Deserialize)]
struct Scenario {
    engine:  EngineConfig,
    model:   ModelDefinition,
    #[serde(default)]
    budgets: Vec<ScheduledBudget>,
}

/// A budget submitted just before `at_step` runs.
#[derive(serde::Deserialize)]
struct ScheduledBudget {
    at_step:   u64,
    name:      String,
    #[serde(default)]
    region:    Option<String>,
    attribute: String,
    value:     f64,
    #[serde(default = "default_true")]
    activated: bool,
}

fn default_true() -> bool {
    true
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let steps = parse_arg(&args, "--steps", 20u64);
    let rate = parse_arg(&args, "--rate", 0.0f64);
    let scenario_path = string_arg(&args, "--scenario").unwrap_or("data/scenario.json");
    let db = string_arg(&args, "--db");

    let content = std::fs::read_to_string(scenario_path)
        .with_context(|| format!("Cannot read scenario {scenario_path}"))?;
    let scenario: Scenario = serde_json::from_str(&content)
        .with_context(|| format!("Invalid scenario {scenario_path}"))?;
    scenario.model.validate()?;

    println!("regionsim: sim-runner");
    println!("  scenario:  {scenario_path}");
    println!("  regions:   {}", scenario.engine.regions.join(", "));
    println!("  steps:     {steps}");
    println!("  seed:      {seed}");
    println!("  rate:      {rate}/s");
    println!("  db:        {}", db.unwrap_or("(none)"));
    println!();

    let factory = StockFlowFactory::new(scenario.model, seed);
    let engine = StepEngine::new(scenario.engine, &factory)?;
    engine.set_step_rate(rate)?;
    let events = engine.subscribe();

    let mut budgets = scenario.budgets;
    budgets.sort_by_key(|b| b.at_step);
    let mut budgets = budgets.into_iter().peekable();

    for _ in 0..steps {
        let next = engine.current_step() + 1;
        while let Some(budget) = budgets.next_if(|b| b.at_step <= next) {
            let action = Action::budget(budget.name, budget.region, budget.attribute, budget.value)
                .with_activated(budget.activated);
            engine.submit_action(action)?;
        }
        engine.run_steps(1)?;
        if engine.is_finished() {
            break;
        }
    }

    for event in events.try_iter() {
        match event {
            EngineEvent::ActionApplied { action } => {
                log::info!("action '{}' activated={}", action.name, action.activated)
            }
            EngineEvent::Finished { step, time } => println!("  final time {time} reached at step {step}"),
            _ => {}
        }
    }

    print_summary(&engine);

    if let Some(path) = db {
        let store = SimStore::open(path)?;
        store.migrate()?;
        let run_id = format!("run-{seed}-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"));
        store.insert_run(&run_id, env!("CARGO_PKG_VERSION"))?;
        let step = engine.save(&store, &run_id)?;
        println!();
        println!("  saved {run_id} at step {step}");
    }

    Ok(())
}

fn print_summary(engine: &StepEngine) {
    let output = engine.output();
    println!("=== RUN SUMMARY ===");
    println!("  steps run:  {}", engine.current_step());
    println!("  final time: {}", engine.current_time());
    let Some(last) = output.last_step() else {
        println!("  (No steps completed)");
        return;
    };
    for region in engine.regions() {
        println!();
        println!("  [{region}]");
        for attr in engine.capture().iter() {
            match output.value(last, region, attr) {
                Ok(Some(value)) => println!("    {attr:<20} {value:>14.3}"),
                Ok(None) => println!("    {attr:<20} {:>14}", "-"),
                Err(e) => log::warn!("cannot read {attr} for {region}: {e}"),
            }
        }
    }
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
