//! Action application tests: policies, budgets and edicts at step
//! boundaries, with exact restoration on deactivation.

mod common;

use common::{engine, row, FakeModel};
use regionsim_core::{
    Action, EngineConfig, EngineEvent, Evaluator, Modifier, StepEngine,
};

fn two_regions() -> StepEngine {
    engine(
        EngineConfig::new(["north", "south"]).with_capture(["tax_rate", "food", "pop"]),
        |i| {
            FakeModel::new()
                .with("tax_rate", 0.1 * (i + 1) as f64)
                .with("food", 50.0)
                .growing("pop", 10.0)
        },
    )
}

#[test]
fn budget_applies_in_the_step_it_was_submitted_before() {
    let engine = two_regions();
    engine.run_steps(1).unwrap();

    engine
        .submit_action(Action::budget("taxes", Some("south".into()), "tax_rate", 0.35))
        .unwrap();
    engine.run_steps(1).unwrap();

    assert_eq!(row(&engine, 1, "tax_rate"), vec![0.1, 0.2]);
    assert_eq!(row(&engine, 2, "tax_rate"), vec![0.1, 0.35]);
}

#[test]
fn budget_deactivation_restores_the_original_exactly() {
    let engine = two_regions();
    let budget = Action::budget("taxes", Some("north".into()), "tax_rate", 0.9);

    engine.submit_action(budget.clone()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(engine.current_value("north", "tax_rate").unwrap(), 0.9);

    engine.submit_action(budget.deactivated()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(engine.current_value("north", "tax_rate").unwrap(), 0.1);
    assert!(engine.active_actions("north").unwrap().is_empty());
}

#[test]
fn budget_reapplied_while_active_replaces_instead_of_stacking() {
    let engine = two_regions();

    engine.submit_action(Action::budget("taxes", Some("north".into()), "tax_rate", 0.3)).unwrap();
    engine.run_steps(1).unwrap();
    engine.submit_action(Action::budget("taxes", Some("north".into()), "tax_rate", 0.5)).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 2, "tax_rate")[0], 0.5);

    // Restoration goes back to the model's own value, not the first budget.
    engine
        .submit_action(Action::budget("taxes", Some("north".into()), "tax_rate", 0.5).deactivated())
        .unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 3, "tax_rate")[0], 0.1);
}

#[test]
fn budget_moved_to_another_attribute_restores_both() {
    let engine = two_regions();

    engine.submit_action(Action::budget("levy", Some("north".into()), "tax_rate", 0.6)).unwrap();
    engine.run_steps(1).unwrap();
    engine.submit_action(Action::budget("levy", Some("north".into()), "food", 20.0)).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 2, "tax_rate")[0], 0.1, "old attribute handed back");
    assert_eq!(row(&engine, 2, "food")[0], 20.0);

    engine
        .submit_action(Action::budget("levy", Some("north".into()), "food", 20.0).deactivated())
        .unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 3, "tax_rate")[0], 0.1);
    assert_eq!(row(&engine, 3, "food")[0], 50.0);
    assert!(engine.active_actions("north").unwrap().is_empty());
}

#[test]
fn policy_installs_every_modifier_and_restores_them() {
    let engine = two_regions();
    let rationing = Action::policy(
        "rationing",
        Some("south".into()),
        vec![
            Modifier::new("food", Evaluator::new("half pop", |m| Ok(m.get("pop")? / 2.0))),
            Modifier::new("tax_rate", Evaluator::constant(0.0)),
        ],
    );

    engine.submit_action(rationing.clone()).unwrap();
    engine.run_steps(1).unwrap();
    // pop is 10 after the first advance, so food reads 5 on south only.
    assert_eq!(row(&engine, 1, "food"), vec![50.0, 5.0]);
    assert_eq!(row(&engine, 1, "tax_rate"), vec![0.1, 0.0]);
    assert_eq!(engine.active_actions("south").unwrap(), vec!["rationing".to_string()]);

    engine.submit_action(rationing.deactivated()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 2, "food"), vec![50.0, 50.0]);
    assert_eq!(row(&engine, 2, "tax_rate"), vec![0.1, 0.2]);
}

#[test]
fn reactivating_an_active_policy_is_a_no_op() {
    let engine = two_regions();
    let events = engine.subscribe();
    let policy = Action::policy(
        "subsidy",
        Some("north".into()),
        vec![Modifier::new("food", Evaluator::constant(80.0))],
    );

    engine.submit_action(policy.clone()).unwrap();
    engine.submit_action(policy.clone()).unwrap();
    engine.run_steps(1).unwrap();

    let applied = events
        .try_iter()
        .filter(|e| matches!(e, EngineEvent::ActionApplied { .. }))
        .count();
    assert_eq!(applied, 1, "second activation must not re-apply");

    // One deactivation is enough to restore, proving nothing was stacked.
    engine.submit_action(policy.deactivated()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 2, "food"), vec![50.0, 50.0]);
}

#[test]
fn deactivating_an_inactive_action_changes_nothing() {
    let engine = two_regions();
    engine
        .submit_action(Action::budget("taxes", Some("north".into()), "tax_rate", 0.7).deactivated())
        .unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 1, "tax_rate"), vec![0.1, 0.2]);
}

#[test]
fn layered_actions_unwind_to_the_layer_below() {
    let engine = two_regions();
    let budget = Action::budget("food-budget", Some("north".into()), "food", 70.0);
    let policy = Action::policy(
        "famine-relief",
        Some("north".into()),
        vec![Modifier::new("food", Evaluator::constant(95.0))],
    );

    engine.submit_action(budget.clone()).unwrap();
    engine.submit_action(policy.clone()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 1, "food")[0], 95.0);

    engine.submit_action(policy.deactivated()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 2, "food")[0], 70.0);

    engine.submit_action(budget.deactivated()).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 3, "food")[0], 50.0);
}

#[test]
fn action_without_region_targets_every_region() {
    let engine = two_regions();
    engine.submit_action(Action::budget("global-tax", None, "tax_rate", 0.25)).unwrap();
    engine.run_steps(1).unwrap();
    assert_eq!(row(&engine, 1, "tax_rate"), vec![0.25, 0.25]);
}

#[test]
fn edict_is_recorded_without_touching_the_model() {
    let engine = two_regions();
    let events = engine.subscribe();
    engine
        .submit_action(Action::edict("curfew", Some("north".into()), "everyone home by nine"))
        .unwrap();
    engine.run_steps(1).unwrap();

    assert_eq!(row(&engine, 1, "food"), vec![50.0, 50.0]);
    assert_eq!(engine.active_actions("north").unwrap(), vec!["curfew".to_string()]);
    let applied: Vec<String> = events
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::ActionApplied { action } => Some(action.name),
            _ => None,
        })
        .collect();
    assert_eq!(applied, vec!["curfew".to_string()]);
}
