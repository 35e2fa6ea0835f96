//! Scope tree benchmark suite for taskscope.
//!
//! Benchmarks the hot paths of the derivation tree:
//! - Derivation overhead per scope flavor (cancel, value, deadline)
//! - Cancellation fan-out across deep chains and wide sibling sets
//! - Value lookup cost as a function of chain depth
//!
//! Run:
//!   cargo bench --bench scope_bench
//!
//! Deadline benchmarks run on a virtual clock so no timer ever fires;
//! they measure arm/disarm cost only.

#![allow(missing_docs)]
#![allow(clippy::semicolon_if_nothing_returned)]

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use std::sync::Arc;
use std::time::Duration;
use taskscope::{
    CancelHandle, Scheduler, ScopeHandle, ScopeKey, VirtualClock, background,
};

// =============================================================================
// HELPERS
// =============================================================================

struct RootTag;
impl ScopeKey for RootTag {
    type Value = u64;
}
struct FillerA;
impl ScopeKey for FillerA {
    type Value = u64;
}
struct FillerB;
impl ScopeKey for FillerB {
    type Value = u64;
}

fn virtual_root() -> (ScopeHandle, Scheduler) {
    let sched = Scheduler::builder()
        .virtual_clock(Arc::new(VirtualClock::new()))
        .build();
    (sched.root_scope("bench"), sched)
}

/// Chain of `depth` cancellable scopes under a fresh root. Returns the
/// topmost handle, the leaf scope, and the intermediate handles so the
/// tree stays registered until the routine runs.
fn build_chain(depth: usize) -> (CancelHandle, ScopeHandle, Vec<CancelHandle>) {
    let (mut scope, top) = background().derive_cancel();
    let mut handles = Vec::with_capacity(depth.saturating_sub(1));
    for _ in 1..depth {
        let (next, handle) = scope.derive_cancel();
        handles.push(handle);
        scope = next;
    }
    (top, scope, handles)
}

// =============================================================================
// DERIVATION OVERHEAD
// =============================================================================

/// Single-scope derive-then-resolve roundtrips, one per flavor. The
/// registered variant derives under a live native parent so the child
/// goes through adoption and detach; the root variant skips both.
fn bench_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope/derive");

    group.bench_function("cancel_under_root", |b| {
        b.iter(|| {
            let (scope, cancel) = background().derive_cancel();
            cancel.cancel();
            black_box(scope.is_cancelled())
        })
    });

    {
        let (parent, _parent_cancel) = background().derive_cancel();
        group.bench_function("cancel_registered", |b| {
            b.iter(|| {
                let (scope, cancel) = parent.derive_cancel();
                cancel.cancel();
                black_box(scope.is_cancelled())
            })
        });
    }

    group.bench_function("value_binding", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n = n.wrapping_add(1);
            let scope = background().derive_value::<RootTag>(n);
            black_box(scope.lookup::<RootTag>())
        })
    });

    {
        let (root, _sched) = virtual_root();
        group.bench_function("deadline_arm_disarm", |b| {
            b.iter(|| {
                let (scope, cancel) = root.derive_timeout(Duration::from_secs(3600));
                cancel.cancel();
                black_box(scope.is_cancelled())
            })
        });
    }

    group.finish();
}

// =============================================================================
// CANCELLATION FAN-OUT
// =============================================================================

/// Cancels a chain from the top and a sibling set from the parent,
/// measuring propagation cost per resolved scope.
fn bench_cancel_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope/cancel_fanout");
    group.sample_size(50);

    for &depth in &[16usize, 64, 256] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("deep_chain", depth), &depth, |b, &depth| {
            b.iter_batched(
                || build_chain(depth),
                |(top, leaf, _handles)| {
                    top.cancel();
                    black_box(leaf.err())
                },
                BatchSize::SmallInput,
            )
        });
    }

    for &width in &[16usize, 64, 256] {
        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(BenchmarkId::new("wide_fanout", width), &width, |b, &width| {
            b.iter_batched(
                || {
                    let (parent, parent_cancel) = background().derive_cancel();
                    let mut children = Vec::with_capacity(width);
                    let mut handles = Vec::with_capacity(width);
                    for _ in 0..width {
                        let (child, handle) = parent.derive_cancel();
                        children.push(child);
                        handles.push(handle);
                    }
                    (parent_cancel, children, handles)
                },
                |(parent_cancel, children, _handles)| {
                    parent_cancel.cancel();
                    black_box(children.last().map(ScopeHandle::err))
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// =============================================================================
// VALUE LOOKUP
// =============================================================================

/// Lookup cost as a function of how far above the caller the binding
/// sits. The miss variant walks the full chain and falls off the root.
fn bench_value_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("scope/lookup");

    for &depth in &[4usize, 16, 64] {
        let mut scope = background().derive_value::<RootTag>(7);
        for layer in 0..depth {
            scope = if layer % 2 == 0 {
                scope.derive_value::<FillerA>(layer as u64)
            } else {
                scope.derive_value::<FillerB>(layer as u64)
            };
        }

        group.bench_with_input(BenchmarkId::new("hit_at_depth", depth), &scope, |b, scope| {
            b.iter(|| black_box(scope.lookup::<RootTag>()))
        });
    }

    {
        let mut scope = background();
        for layer in 0..64u64 {
            scope = scope.derive_value::<FillerA>(layer);
        }
        group.bench_function("miss_at_depth_64", |b| {
            b.iter(|| black_box(scope.lookup::<RootTag>()))
        });
    }

    group.finish();
}

// =============================================================================
// MAIN
// =============================================================================

criterion_group!(
    benches,
    bench_derivation,
    bench_cancel_fanout,
    bench_value_lookup,
);

criterion_main!(benches);
