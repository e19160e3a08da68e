//! Action queue tests: atomic drain under concurrent submission and
//! synchronous region validation.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use regionsim_core::{
    action::ActionQueue,
    Action, EngineConfig, SimError,
};

fn queue() -> ActionQueue {
    let regions: HashSet<String> = ["north", "south"].iter().map(|s| s.to_string()).collect();
    ActionQueue::new(Arc::new(regions))
}

/// Every action submitted concurrently with drains shows up in exactly
/// one drain result.
#[test]
fn concurrent_submits_are_drained_exactly_once() {
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 500;

    let queue = Arc::new(queue());
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let region = if i % 2 == 0 { "north" } else { "south" };
                    queue
                        .submit(Action::edict(format!("edict-{w}-{i}"), Some(region.into()), ""), 0)
                        .unwrap();
                }
            })
        })
        .collect();

    let drainer = {
        let queue = Arc::clone(&queue);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut seen = Vec::new();
            while !done.load(Ordering::SeqCst) {
                seen.extend(queue.drain().into_iter().map(|q| q.action.name));
                thread::yield_now();
            }
            seen.extend(queue.drain().into_iter().map(|q| q.action.name));
            seen
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let seen = drainer.join().unwrap();

    assert_eq!(seen.len(), WRITERS * PER_WRITER, "actions lost or duplicated");
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), seen.len(), "an action was drained twice");
    assert!(queue.is_empty());
}

#[test]
fn drain_preserves_submission_order() {
    let queue = queue();
    for i in 0..5 {
        queue.submit(Action::edict(format!("e{i}"), None, ""), 7).unwrap();
    }
    let drained = queue.drain();
    let names: Vec<&str> = drained.iter().map(|q| q.action.name.as_str()).collect();
    assert_eq!(names, vec!["e0", "e1", "e2", "e3", "e4"]);
    assert!(drained.iter().all(|q| q.queued_at == 7));
    assert!(queue.drain().is_empty(), "drain on an empty queue returns nothing");
}

#[test]
fn queued_actions_get_unique_ids() {
    let queue = queue();
    let a = queue.submit(Action::edict("a", None, ""), 0).unwrap();
    let b = queue.submit(Action::edict("a", None, ""), 0).unwrap();
    assert_ne!(a, b);
}

#[test]
fn unknown_region_is_rejected_and_never_queued() {
    let queue = queue();
    let err = queue
        .submit(Action::budget("tax", Some("atlantis".into()), "tax_rate", 0.2), 0)
        .unwrap_err();
    assert!(matches!(err, SimError::InvalidRegion { ref region } if region == "atlantis"));
    assert!(queue.is_empty());
}

#[test]
fn engine_rejects_unknown_region_at_submission() {
    let engine = common::engine(EngineConfig::new(["north"]).with_capture(["x"]), |_| {
        common::FakeModel::new().with("x", 1.0)
    });
    let err = engine
        .submit_action(Action::budget("tax", Some("south".into()), "x", 3.0))
        .unwrap_err();
    assert!(matches!(err, SimError::InvalidRegion { .. }));

    engine.run_steps(1).unwrap();
    assert_eq!(common::row(&engine, 1, "x"), vec![1.0], "rejected action must not apply");
}
