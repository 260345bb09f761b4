//! Whole-graph tests for the reactive runtime: propagation, batching,
//! memoization, dynamic dependencies, suspension and error isolation.
use crate::{
    ComputedValue, ConfigOptions, ObservableValue, Reaction, autorun, configure, is_observed,
    on_become_unobserved, on_reaction_error, run_in_action, untracked,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn value_computed_reaction_end_to_end() {
    let a = Arc::new(ObservableValue::named("a", 1));
    let b = Arc::new(ObservableValue::named("b", 2));

    let sum = Arc::new(ComputedValue::named("sum", {
        let (a, b) = (a.clone(), b.clone());
        move || a.get() + b.get()
    }));

    let log = Arc::new(Mutex::new(Vec::new()));
    let reaction = Reaction::new("log sum", {
        let (sum, log) = (sum.clone(), log.clone());
        move || log.lock().push(sum.get())
    });
    assert_eq!(*log.lock(), vec![3]);

    // Writing the same value is not a change
    a.set(1);
    assert_eq!(*log.lock(), vec![3]);

    // Batched writes produce one settled notification
    run_in_action(|| {
        a.set(5);
        b.set(10);
    });
    assert_eq!(*log.lock(), vec![3, 15]);

    // Disposed reactions are gone for good, but the computed still answers
    reaction.dispose();
    a.set(0);
    assert_eq!(*log.lock(), vec![3, 15]);
    assert_eq!(sum.get(), 10);
}

#[test]
fn transactions_are_glitch_free() {
    let x = Arc::new(ObservableValue::new(1));
    let y = Arc::new(ObservableValue::new(2));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _reaction = autorun({
        let (x, y, seen) = (x.clone(), y.clone(), seen.clone());
        move || seen.lock().push((x.get(), y.get()))
    });

    run_in_action(|| {
        x.set(5);
        y.set(10);
    });

    // Never (5, 2) or (1, 10): every run sees a settled pair
    assert_eq!(*seen.lock(), vec![(1, 2), (5, 10)]);
}

#[test]
fn diamond_runs_every_node_once_per_write() {
    let base = Arc::new(ObservableValue::new(1));
    let left_evals = Arc::new(AtomicUsize::new(0));
    let right_evals = Arc::new(AtomicUsize::new(0));
    let sum_evals = Arc::new(AtomicUsize::new(0));
    let reaction_runs = Arc::new(AtomicUsize::new(0));

    let left = Arc::new(ComputedValue::named("left", {
        let (base, evals) = (base.clone(), left_evals.clone());
        move || {
            evals.fetch_add(1, Ordering::Relaxed);
            base.get() * 2
        }
    }));
    let right = Arc::new(ComputedValue::named("right", {
        let (base, evals) = (base.clone(), right_evals.clone());
        move || {
            evals.fetch_add(1, Ordering::Relaxed);
            base.get() * 3
        }
    }));
    let sum = Arc::new(ComputedValue::named("sum", {
        let (left, right, evals) = (left.clone(), right.clone(), sum_evals.clone());
        move || {
            evals.fetch_add(1, Ordering::Relaxed);
            left.get() + right.get()
        }
    }));

    let last = Arc::new(AtomicUsize::new(0));
    let _reaction = autorun({
        let (sum, last, runs) = (sum.clone(), last.clone(), reaction_runs.clone());
        move || {
            last.store(sum.get() as usize, Ordering::Relaxed);
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    assert_eq!(last.load(Ordering::Relaxed), 5);

    base.set(2);

    assert_eq!(last.load(Ordering::Relaxed), 10);
    assert_eq!(left_evals.load(Ordering::Relaxed), 2);
    assert_eq!(right_evals.load(Ordering::Relaxed), 2);
    assert_eq!(sum_evals.load(Ordering::Relaxed), 2);
    assert_eq!(reaction_runs.load(Ordering::Relaxed), 2);
}

#[test]
fn stabilized_computed_demotes_instead_of_rerunning_dependents() {
    cov_mark::check!(possibly_stale_demoted);

    let source = Arc::new(ObservableValue::new(2));
    let reaction_runs = Arc::new(AtomicUsize::new(0));

    let parity = Arc::new(ComputedValue::named("parity", {
        let source = source.clone();
        move || source.get() % 2
    }));

    let _reaction = autorun({
        let (parity, runs) = (parity.clone(), reaction_runs.clone());
        move || {
            parity.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    assert_eq!(reaction_runs.load(Ordering::Relaxed), 1);

    // 2 -> 4: parity re-evaluates, compares equal, and the reaction is
    // demoted without running
    source.set(4);
    assert_eq!(reaction_runs.load(Ordering::Relaxed), 1);
}

#[test]
fn conditional_read_subscribes_only_the_taken_branch() {
    let use_first = Arc::new(ObservableValue::new(true));
    let first = Arc::new(ObservableValue::new(10));
    let second = Arc::new(ObservableValue::new(20));
    let runs = Arc::new(AtomicUsize::new(0));

    let _reaction = autorun({
        let (use_first, first, second) = (use_first.clone(), first.clone(), second.clone());
        let runs = runs.clone();
        move || {
            if use_first.get() {
                first.get();
            } else {
                second.get();
            }
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    // The untaken branch is not a dependency
    second.set(21);
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    first.set(11);
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    // Switching the flag re-subscribes: now only `second` matters
    use_first.set(false);
    assert_eq!(runs.load(Ordering::Relaxed), 3);

    first.set(12);
    assert_eq!(runs.load(Ordering::Relaxed), 3);

    second.set(22);
    assert_eq!(runs.load(Ordering::Relaxed), 4);
}

#[test]
fn computed_suspends_when_last_observer_leaves() {
    cov_mark::check!(unobserved_computed_suspended);

    let source = Arc::new(ObservableValue::new(1));
    let evals = Arc::new(AtomicUsize::new(0));

    let doubled = Arc::new(ComputedValue::named("doubled", {
        let (source, evals) = (source.clone(), evals.clone());
        move || {
            evals.fetch_add(1, Ordering::Relaxed);
            source.get() * 2
        }
    }));

    let reaction = autorun({
        let doubled = doubled.clone();
        move || {
            doubled.get();
        }
    });
    assert_eq!(evals.load(Ordering::Relaxed), 1);
    assert!(is_observed(&*doubled));
    assert!(is_observed(&*source));

    reaction.dispose();
    assert!(!is_observed(&*doubled));
    // Suspension released the upstream subscription as well
    assert!(!is_observed(&*source));

    // Unobserved reads re-evaluate every time
    assert_eq!(doubled.get(), 2);
    assert_eq!(doubled.get(), 2);
    assert_eq!(evals.load(Ordering::Relaxed), 3);
}

#[test]
fn unobserved_computed_read_in_batch_caches_until_batch_close() {
    let source = Arc::new(ObservableValue::new(3));
    let evals = Arc::new(AtomicUsize::new(0));

    let squared = Arc::new(ComputedValue::named("squared", {
        let (source, evals) = (source.clone(), evals.clone());
        move || {
            evals.fetch_add(1, Ordering::Relaxed);
            let v = source.get();
            v * v
        }
    }));

    run_in_action(|| {
        assert_eq!(squared.get(), 9);
        assert_eq!(squared.get(), 9);
        // Within the batch the computed stayed subscribed and cached
        assert_eq!(evals.load(Ordering::Relaxed), 1);
    });

    // The batch closed with no observers left, so the subscription was torn
    // down and reads evaluate from scratch again
    assert_eq!(squared.get(), 9);
    assert_eq!(evals.load(Ordering::Relaxed), 2);
}

#[test]
fn reactions_drain_in_first_scheduled_order_exactly_once() {
    let p = Arc::new(ObservableValue::new(0));
    let q = Arc::new(ObservableValue::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let _narrow = Reaction::new("narrow", {
        let (p, order) = (p.clone(), order.clone());
        move || {
            p.get();
            order.lock().push("narrow");
        }
    });
    let _wide = Reaction::new("wide", {
        let (p, q, order) = (p.clone(), q.clone(), order.clone());
        move || {
            p.get();
            q.get();
            order.lock().push("wide");
        }
    });

    order.lock().clear();
    run_in_action(|| {
        q.set(1); // schedules wide
        p.set(1); // schedules narrow, touches wide again
    });

    // wide keeps its first-scheduled position and runs once
    assert_eq!(*order.lock(), vec!["wide", "narrow"]);
}

#[test]
fn reaction_scheduled_during_drain_joins_the_same_drain() {
    let trigger = Arc::new(ObservableValue::new(0));
    let relay = Arc::new(ObservableValue::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let _upstream = Reaction::new("upstream", {
        let (trigger, relay, order) = (trigger.clone(), relay.clone(), order.clone());
        move || {
            let value = trigger.get();
            order.lock().push("upstream");
            relay.set(value);
        }
    });
    let _downstream = Reaction::new("downstream", {
        let (relay, order) = (relay.clone(), order.clone());
        move || {
            relay.get();
            order.lock().push("downstream");
        }
    });

    order.lock().clear();
    trigger.set(7);

    // Both settled before control returned to the writer
    assert_eq!(*order.lock(), vec!["upstream", "downstream"]);
    assert_eq!(relay.get_untracked(), 7);
}

#[test]
fn dispose_inside_transaction_cancels_pending_run() {
    let value = Arc::new(ObservableValue::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let reaction = autorun({
        let (value, runs) = (value.clone(), runs.clone());
        move || {
            value.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    run_in_action(|| {
        value.set(1);
        reaction.dispose();
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);
}

#[test]
fn failing_reaction_is_reported_and_isolated() {
    let value = Arc::new(ObservableValue::new(0));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let survivor_runs = Arc::new(AtomicUsize::new(0));

    let handler = on_reaction_error({
        let failures = failures.clone();
        move |error| failures.lock().push(error.to_string())
    });

    let _fragile = Reaction::new("fragile", {
        let value = value.clone();
        move || {
            if value.get() == 13 {
                panic!("unlucky");
            }
        }
    });
    let _survivor = Reaction::new("survivor", {
        let (value, runs) = (value.clone(), survivor_runs.clone());
        move || {
            value.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });

    value.set(13);

    assert_eq!(survivor_runs.load(Ordering::Relaxed), 2);
    // The handler registry is global, so only look for this test's failure
    let fragile_failures = failures
        .lock()
        .iter()
        .filter(|failure| failure.contains("fragile") && failure.contains("unlucky"))
        .count();
    assert_eq!(fragile_failures, 1);

    handler.dispose();
}

#[test]
fn runaway_feedback_fails_fast() {
    configure(ConfigOptions {
        max_reaction_iterations: Some(25),
        ..ConfigOptions::default()
    });

    let counter = Arc::new(ObservableValue::new(0u64));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _feedback = Reaction::new("feedback", {
            let counter = counter.clone();
            move || {
                let value = counter.get();
                counter.set(value + 1);
            }
        });
    }));
    assert!(result.is_err());

    configure(ConfigOptions {
        max_reaction_iterations: Some(100),
        ..ConfigOptions::default()
    });
}

#[test]
fn custom_scheduler_receives_the_drain() {
    use crate::set_reaction_scheduler;

    let invocations = Arc::new(AtomicUsize::new(0));
    let invocations_in_scheduler = invocations.clone();
    // Pass-through strategy: observable to the test, identical semantics
    set_reaction_scheduler(Some(Arc::new(move |drain: &dyn Fn()| {
        invocations_in_scheduler.fetch_add(1, Ordering::Relaxed);
        drain();
    })));

    let value = Arc::new(ObservableValue::new(0));
    let runs = Arc::new(AtomicUsize::new(0));
    let _reaction = autorun({
        let (value, runs) = (value.clone(), runs.clone());
        move || {
            value.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });

    value.set(1);

    assert_eq!(runs.load(Ordering::Relaxed), 2);
    assert!(invocations.load(Ordering::Relaxed) >= 2);

    set_reaction_scheduler(None);
}

#[test]
fn untracked_section_restores_tracking() {
    let tracked = Arc::new(ObservableValue::new(0));
    let sneaky = Arc::new(ObservableValue::new(0));
    let also_tracked = Arc::new(ObservableValue::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let _reaction = autorun({
        let (tracked, sneaky, also_tracked) =
            (tracked.clone(), sneaky.clone(), also_tracked.clone());
        let runs = runs.clone();
        move || {
            tracked.get();
            untracked(|| sneaky.get());
            // Tracking resumes after the untracked section
            also_tracked.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    sneaky.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    also_tracked.set(1);
    assert_eq!(runs.load(Ordering::Relaxed), 2);
}

#[test]
fn computed_chain_settles_through_intermediate_hooks() {
    // A computed observing a computed observing a value: disposing the only
    // reaction tears the whole chain down through the unobservation queue.
    let source = Arc::new(ObservableValue::new(1));
    let unobserved_fires = Arc::new(AtomicUsize::new(0));

    let inner = Arc::new(ComputedValue::named("inner", {
        let source = source.clone();
        move || source.get() + 1
    }));
    let outer = Arc::new(ComputedValue::named("outer", {
        let inner = inner.clone();
        move || inner.get() + 1
    }));

    let _hook = on_become_unobserved(&*source, {
        let fires = unobserved_fires.clone();
        move || {
            fires.fetch_add(1, Ordering::Relaxed);
        }
    });

    let reaction = autorun({
        let outer = outer.clone();
        move || {
            outer.get();
        }
    });
    assert!(is_observed(&*source));
    assert!(is_observed(&*inner));

    reaction.dispose();

    assert!(!is_observed(&*outer));
    assert!(!is_observed(&*inner));
    assert!(!is_observed(&*source));
    assert_eq!(unobserved_fires.load(Ordering::Relaxed), 1);
}

#[test]
fn batched_writes_to_distinct_graphs_settle_independently() {
    let a = Arc::new(ObservableValue::new(0));
    let b = Arc::new(ObservableValue::new(0));
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_runs = Arc::new(AtomicUsize::new(0));

    let _watch_a = autorun({
        let (a, runs) = (a.clone(), a_runs.clone());
        move || {
            a.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });
    let _watch_b = autorun({
        let (b, runs) = (b.clone(), b_runs.clone());
        move || {
            b.get();
            runs.fetch_add(1, Ordering::Relaxed);
        }
    });

    run_in_action(|| {
        for i in 1..=10 {
            a.set(i);
            b.set(i * 2);
        }
    });

    assert_eq!(a_runs.load(Ordering::Relaxed), 2);
    assert_eq!(b_runs.load(Ordering::Relaxed), 2);
}
