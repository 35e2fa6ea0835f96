//! Taskscope: cancellation scopes with deadlines, values, and explicit propagation.
//!
//! # Overview
//!
//! Taskscope carries deadlines, a cancellation signal, and request-local
//! values across the call tree of an operation. Scopes form a tree: each
//! derivation layers one capability (cancellation, a deadline, one value
//! binding) over its parent, and cancelling a scope resolves every scope
//! below it, in a fixed order, exactly once.
//!
//! # Core Guarantees
//!
//! - **Error before signal**: a resolved scope's error is readable by the
//!   time its done signal closes; observers never see a closed signal with
//!   no recorded error.
//! - **Idempotent cancel**: the first cancellation wins; later cancels and
//!   racing deadline expiries are no-ops.
//! - **No lock across fan-out**: cancellation drains a node's children
//!   under its lock but cancels them after release, so deep trees cannot
//!   deadlock or hold a hot lock while cascading.
//! - **Detach on resolve**: a cancelled scope removes itself from its
//!   parent, so long-lived parents do not accumulate dead children.
//! - **Deterministic testing**: deadlines run on a pluggable scheduler
//!   clock; the virtual clock makes expiry tests exact and instant.
//!
//! # Module Structure
//!
//! - [`types`]: Core types (scope ids, the timeline, `ScopeError`)
//! - [`signal`]: The one-shot [`ClosingSignal`](signal::ClosingSignal) scopes resolve through
//! - [`time`]: Timer driver and the wall/virtual clock sources
//! - [`runtime`]: The [`Scheduler`](runtime::Scheduler) bundle (timers plus watcher spawning)
//! - [`scope`]: The scope tree itself and the `derive_*` operations
//! - [`tracing_compat`]: Optional tracing integration (requires `tracing-integration` feature)
//!
//! # API Stability
//!
//! Taskscope is currently in the 0.x series; public items should be treated
//! as **unstable** and subject to change. The derivation methods on
//! [`ScopeHandle`] and the [`ScopeError`] variants are intended to
//! stabilize first.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod runtime;
pub mod scope;
pub mod signal;
pub mod time;
pub mod tracing_compat;
pub mod types;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

// Re-exports for convenient access to core types
pub use runtime::{Scheduler, SchedulerBuilder, Spawn, SpawnHandle, SpawnTask, ThreadSpawner};
pub use scope::{
    CancelHandle, NativeCancel, Scope, ScopeHandle, ScopeKey, ScopeValue, background, todo,
};
pub use signal::{Closed, ClosingSignal};
pub use time::{
    TimeSource, TimerCallback, TimerDriver, TimerDriverApi, TimerDriverHandle, TimerHandle,
    VirtualClock, WallClock,
};
pub use types::{ScopeError, ScopeId, Time};

#[cfg(any(test, feature = "test-internals"))]
pub use scope::watchers_spawned;
