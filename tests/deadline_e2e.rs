//! Deadline expiry suite.
//!
//! The virtual-clock tests pin exact expiry semantics (cascade order, timer
//! release, expired-parent derivation). Two wall-clock tests then run the
//! same machinery end to end through the global scheduler's pump thread.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use taskscope::test_utils::init_test_logging;
use taskscope::{
    ClosingSignal, Scheduler, ScopeError, ScopeHandle, ScopeKey, Time, VirtualClock, background,
};

fn init_test(name: &str) {
    init_test_logging();
    taskscope::test_phase!(name);
}

fn virtual_root(name: &'static str) -> (ScopeHandle, Arc<VirtualClock>, Scheduler) {
    let clock = Arc::new(VirtualClock::new());
    let sched = Scheduler::builder()
        .virtual_clock(Arc::clone(&clock))
        .build();
    (sched.root_scope(name), clock, sched)
}

/// Waits for `signal` off-thread so a hang fails the test instead of
/// wedging the harness.
fn wait_guarded(signal: Arc<ClosingSignal>, guard: Duration) {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        signal.wait_blocking();
        let _ = tx.send(());
    });
    rx.recv_timeout(guard).expect("signal did not close in time");
}

struct JobTag;
impl ScopeKey for JobTag {
    type Value = String;
}

// ============================================================================
// Virtual clock: exact expiry semantics
// ============================================================================

#[test]
fn expiry_cascades_through_mixed_layers() {
    init_test("expiry_cascades_through_mixed_layers");
    let (root, clock, sched) = virtual_root("batch");

    let (timed, _timed_cancel) = root.derive_deadline(Time::from_millis(50));
    let tagged = timed.derive_value::<JobTag>("resize".to_string());
    let (leaf, _leaf_cancel) = tagged.derive_cancel();

    clock.advance_by(Duration::from_millis(49));
    sched.timer().process_timers();
    assert!(leaf.err().is_none(), "nothing fires before the deadline");

    clock.advance_by(Duration::from_millis(1));
    sched.timer().process_timers();
    for scope in [&timed, &tagged, &leaf] {
        assert_eq!(
            scope.err(),
            Some(ScopeError::DeadlineExceeded),
            "expiry must reach {scope}"
        );
    }
    assert_eq!(
        leaf.lookup::<JobTag>().as_deref().map(String::as_str),
        Some("resize"),
        "bindings survive expiry"
    );
    assert_eq!(sched.timer().pending_count(), 0);
    taskscope::test_complete!("expiry_cascades_through_mixed_layers");
}

#[test]
fn nested_deadlines_fire_in_order() {
    init_test("nested_deadlines_fire_in_order");
    let (root, clock, sched) = virtual_root("nested");

    let (outer, _outer_cancel) = root.derive_deadline(Time::from_millis(100));
    let (inner, _inner_cancel) = outer.derive_deadline(Time::from_millis(30));
    let (leaf, _leaf_cancel) = inner.derive_cancel();
    assert_eq!(sched.timer().pending_count(), 2, "both deadlines are armed");

    clock.advance_by(Duration::from_millis(30));
    sched.timer().process_timers();
    assert_eq!(inner.err(), Some(ScopeError::DeadlineExceeded));
    assert_eq!(leaf.err(), Some(ScopeError::DeadlineExceeded));
    assert!(outer.err().is_none(), "the outer deadline is still pending");
    let outer_node = outer.as_cancel_node().expect("native scope");
    assert_eq!(
        outer_node.child_count(),
        0,
        "the expired inner scope must detach from the outer one"
    );

    clock.advance_by(Duration::from_millis(70));
    sched.timer().process_timers();
    assert_eq!(outer.err(), Some(ScopeError::DeadlineExceeded));
    assert_eq!(sched.timer().pending_count(), 0);
    taskscope::test_complete!("nested_deadlines_fire_in_order");
}

#[test]
fn ancestor_cancel_releases_descendant_timers() {
    init_test("ancestor_cancel_releases_descendant_timers");
    let (root, _clock, sched) = virtual_root("release");

    let (parent, parent_cancel) = root.derive_cancel();
    let mut children = Vec::new();
    for hours in 1..=3u64 {
        let (child, child_cancel) = parent.derive_deadline(Time::from_secs(hours * 3600));
        children.push((child, child_cancel));
    }
    assert_eq!(sched.timer().pending_count(), 3);

    parent_cancel.cancel();
    for (child, _cancel) in &children {
        assert_eq!(
            child.err(),
            Some(ScopeError::Cancelled),
            "cascade must outrank the pending deadlines"
        );
    }
    assert_eq!(
        sched.timer().pending_count(),
        0,
        "every descendant timer must be released"
    );
    taskscope::test_complete!("ancestor_cancel_releases_descendant_timers");
}

#[test]
fn derivation_under_an_expired_deadline_is_born_resolved() {
    init_test("derivation_under_an_expired_deadline_is_born_resolved");
    let (root, clock, sched) = virtual_root("expired");

    let (timed, _timed_cancel) = root.derive_deadline(Time::from_millis(10));
    clock.advance_by(Duration::from_millis(50));
    sched.timer().process_timers();
    assert_eq!(timed.err(), Some(ScopeError::DeadlineExceeded));

    let (cancel_child, _cc) = timed.derive_cancel();
    assert_eq!(cancel_child.err(), Some(ScopeError::DeadlineExceeded));

    // A later deadline degrades to plain derivation; an earlier one keeps
    // its own identity. Either way the child is already resolved and no
    // timer is armed.
    let (later, _later_cancel) = timed.derive_deadline(Time::from_millis(80));
    let (earlier, _earlier_cancel) = timed.derive_deadline(Time::from_millis(5));
    assert_eq!(later.err(), Some(ScopeError::DeadlineExceeded));
    assert_eq!(earlier.err(), Some(ScopeError::DeadlineExceeded));
    assert_eq!(sched.timer().pending_count(), 0);
    taskscope::test_complete!("derivation_under_an_expired_deadline_is_born_resolved");
}

// ============================================================================
// Wall clock: the global scheduler end to end
// ============================================================================

#[test]
fn wall_clock_timeout_fires_end_to_end() {
    init_test("wall_clock_timeout_fires_end_to_end");
    let started = Instant::now();
    let (scope, _cancel) = background().derive_timeout(Duration::from_millis(50));

    let signal = scope.done_signal().expect("derived scope has a signal");
    wait_guarded(signal, Duration::from_secs(5));

    assert_eq!(scope.err(), Some(ScopeError::DeadlineExceeded));
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "the deadline must not fire early (elapsed {:?})",
        started.elapsed()
    );
    taskscope::test_complete!("wall_clock_timeout_fires_end_to_end");
}

#[test]
fn wall_clock_cancel_beats_a_distant_deadline() {
    init_test("wall_clock_cancel_beats_a_distant_deadline");
    let (scope, cancel) = background().derive_timeout(Duration::from_secs(600));
    cancel.cancel();

    let signal = scope.done_signal().expect("derived scope has a signal");
    wait_guarded(signal, Duration::from_secs(2));
    assert_eq!(
        scope.err(),
        Some(ScopeError::Cancelled),
        "manual cancel must resolve without waiting on the timer"
    );
    taskscope::test_complete!("wall_clock_cancel_beats_a_distant_deadline");
}

#[test]
fn wall_clock_past_deadline_resolves_at_derivation() {
    init_test("wall_clock_past_deadline_resolves_at_derivation");
    let (scope, _cancel) = background().derive_deadline(Time::ZERO);
    assert_eq!(
        scope.err(),
        Some(ScopeError::DeadlineExceeded),
        "a deadline at the epoch is always already due"
    );
    let signal = scope.done_signal().expect("derived scope has a signal");
    assert!(signal.is_closed());
    taskscope::test_complete!("wall_clock_past_deadline_resolves_at_derivation");
}
