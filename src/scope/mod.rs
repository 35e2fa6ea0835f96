//! Cancellation scopes.
//!
//! A scope is a node in a cancellation tree. Deriving from a scope yields a
//! child whose done signal closes when the child itself is cancelled, when
//! an armed deadline expires, or when any ancestor resolves first. Roots
//! ([`background`](crate::background) and [`todo`](crate::todo)) are never
//! cancelled.
//!
//! The [`Scope`] trait is the seam foreign implementations plug into: any
//! type that reports a deadline, a done signal, an error, and value lookups
//! can sit in a chain. Derivation through a foreign scope still propagates
//! cancellation; the tree parks a watcher thread on the foreign signal
//! instead of registering the child directly.
//!
//! # Propagation
//!
//! Deriving a cancellable child walks one of three paths:
//!
//! 1. The parent can never be cancelled (no done signal): the child is a
//!    detached root of its own subtree.
//! 2. The nearest cancellable ancestor is native: the child is inserted
//!    into that ancestor's child registry, or cancelled on the spot if the
//!    ancestor has already resolved.
//! 3. A foreign scope is interposed: a watcher thread waits on whichever
//!    of the two signals (ancestor's, child's) closes first and forwards
//!    the ancestor's error if it won.

mod cancel;
mod deadline;
mod root;
mod value;

pub use cancel::CancelHandle;
pub use root::{background, todo};
pub use value::ScopeKey;

use crate::runtime::Scheduler;
use crate::signal::ClosingSignal;
use crate::tracing_compat::debug;
use crate::types::{ScopeError, ScopeId, Time};
use cancel::CancelCore;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

#[cfg(any(test, feature = "test-internals"))]
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(any(test, feature = "test-internals"))]
static WATCHERS_SPAWNED: AtomicU64 = AtomicU64::new(0);

/// Total watcher threads spawned for foreign-scope propagation.
///
/// Native derivation chains never spawn one; the counter exists so tests
/// can assert that.
#[cfg(any(test, feature = "test-internals"))]
#[must_use]
pub fn watchers_spawned() -> u64 {
    WATCHERS_SPAWNED.load(Ordering::SeqCst)
}

/// An erased value carried by a value scope.
pub type ScopeValue = Arc<dyn std::any::Any + Send + Sync>;

/// A node in a cancellation tree.
///
/// Implementations must uphold three contracts:
///
/// - **Signal identity**: `done_signal` returns the same allocation for the
///   scope's whole life (or always `None`), and the signal closes at most
///   once.
/// - **Ordering**: by the time the done signal reads closed, `err` returns
///   the error that closed it, forever.
/// - **Deadline honesty**: `deadline` returns the earliest deadline that
///   will cancel the scope, if one is set anywhere above it.
pub trait Scope: Send + Sync + fmt::Debug {
    /// The earliest deadline binding this scope, if any.
    ///
    /// A scope that enforces no deadline of its own still reports an
    /// ancestor's, because the ancestor's expiry will cascade to it.
    fn deadline(&self) -> Option<Time>;

    /// The scope's done signal, or `None` if it can never be cancelled.
    fn done_signal(&self) -> Option<Arc<ClosingSignal>>;

    /// Why the scope was cancelled, or `None` while it is live.
    fn err(&self) -> Option<ScopeError>;

    /// The value stored for `key` by this scope or an ancestor.
    fn value_at(&self, key: TypeId) -> Option<ScopeValue>;

    /// The native cancellation node behind this scope, if there is one and
    /// this scope exposes it.
    ///
    /// The default declines, which routes derivation through the watcher
    /// path. Wrappers that delegate `done_signal` unchanged should delegate
    /// this too so their children keep direct registration.
    fn as_cancel_node(&self) -> Option<NativeCancel> {
        None
    }

    /// The scheduler children of this scope derive against.
    fn scheduler(&self) -> Scheduler {
        Scheduler::global()
    }

    /// Writes this scope's derivation-chain name.
    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope")
    }
}

/// Capability token granting access to a scope's native cancellation node.
///
/// Returned by [`Scope::as_cancel_node`]; holders can be registered as
/// children of the node. The token is deliberately opaque.
#[derive(Clone)]
pub struct NativeCancel {
    pub(crate) core: Arc<CancelCore>,
}

impl fmt::Debug for NativeCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeCancel").field(&self.core.id()).finish()
    }
}

/// Shared handle to a scope.
///
/// All derivation runs through handles: [`derive_cancel`], [`derive_deadline`],
/// [`derive_timeout`] and [`derive_value`] each return a handle to the new
/// child. Clones refer to the same scope.
///
/// [`derive_cancel`]: ScopeHandle::derive_cancel
/// [`derive_deadline`]: ScopeHandle::derive_deadline
/// [`derive_timeout`]: ScopeHandle::derive_timeout
/// [`derive_value`]: ScopeHandle::derive_value
#[derive(Clone)]
pub struct ScopeHandle {
    pub(crate) inner: Arc<dyn Scope>,
}

impl ScopeHandle {
    /// Wraps a scope implementation in a handle.
    #[must_use]
    pub fn new(inner: Arc<dyn Scope>) -> Self {
        Self { inner }
    }

    /// The earliest deadline binding this scope, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Time> {
        self.inner.deadline()
    }

    /// The scope's done signal, or `None` if it can never be cancelled.
    ///
    /// Callers wait on the signal (`wait` / `wait_blocking`) and then read
    /// [`err`](Self::err) for the cause.
    #[must_use]
    pub fn done_signal(&self) -> Option<Arc<ClosingSignal>> {
        self.inner.done_signal()
    }

    /// Why the scope was cancelled, or `None` while it is live.
    #[must_use]
    pub fn err(&self) -> Option<ScopeError> {
        self.inner.err()
    }

    /// Returns true once the scope has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.err().is_some()
    }

    /// The scheduler this scope's children derive against.
    #[must_use]
    pub fn scheduler(&self) -> Scheduler {
        self.inner.scheduler()
    }

    /// The native cancellation node behind this scope, if it exposes one.
    ///
    /// Foreign [`Scope`] implementations return `None` here, which routes
    /// their children through the watcher path instead of direct
    /// registration.
    #[must_use]
    pub fn as_cancel_node(&self) -> Option<NativeCancel> {
        self.inner.as_cancel_node()
    }
}

impl fmt::Display for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.describe(f)
    }
}

impl fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeHandle({self})")
    }
}

// =============================================================================
// Propagation protocol
// =============================================================================

/// A native node's view of its registered children.
pub(crate) trait CancelNode: Send + Sync {
    /// The node's identity in its parent's registry.
    fn scope_id(&self) -> ScopeId;

    /// Cancels the node with `err`.
    ///
    /// `remove_from_parent` detaches the node from its parent's registry
    /// afterwards; cascaded cancellation passes `false` because the parent
    /// is already draining its registry.
    fn cancel(&self, remove_from_parent: bool, err: ScopeError);

    /// The node's done signal, allocating it if necessary.
    fn done(&self) -> Arc<ClosingSignal>;
}

fn resolved_parent_err(parent: &ScopeHandle) -> ScopeError {
    match parent.err() {
        Some(err) => err,
        // A closed done signal must carry an error; anything else is a
        // broken Scope implementation.
        None => panic!("scope {parent} reported a closed done signal without an error"),
    }
}

/// Attaches `child` to the nearest cancellable ancestor of `parent`.
pub(crate) fn propagate_cancel(parent: &ScopeHandle, child: &Arc<dyn CancelNode>) {
    let Some(parent_signal) = parent.done_signal() else {
        return;
    };

    if parent_signal.is_closed() {
        child.cancel(false, resolved_parent_err(parent));
        return;
    }

    if let Some(native) = parent.as_cancel_node() {
        if native.core.owns_signal(&parent_signal) {
            if let Err(err) = native.core.try_adopt(Arc::clone(child)) {
                child.cancel(false, err);
            }
            return;
        }
    }

    spawn_watcher(parent, parent_signal, Arc::clone(child));
}

/// Detaches the child with `id` from the nearest native ancestor of `parent`.
pub(crate) fn remove_child(parent: &ScopeHandle, id: ScopeId) {
    let Some(parent_signal) = parent.done_signal() else {
        return;
    };
    if let Some(native) = parent.as_cancel_node() {
        if native.core.owns_signal(&parent_signal) {
            native.core.remove_child(id);
        }
    }
}

/// Parks a thread on the parent's signal to forward its cancellation.
///
/// The watcher races the two signals and exits as soon as either side
/// resolves, so a child cancelled directly does not strand a thread on a
/// long-lived parent.
fn spawn_watcher(
    parent: &ScopeHandle,
    parent_signal: Arc<ClosingSignal>,
    child: Arc<dyn CancelNode>,
) {
    #[cfg(any(test, feature = "test-internals"))]
    WATCHERS_SPAWNED.fetch_add(1, Ordering::SeqCst);

    debug!(parent = %parent, child = %child.scope_id(), "spawning cancellation watcher");

    let parent = parent.clone();
    let sched = parent.scheduler();
    sched.spawn(Box::new(move || {
        let child_signal = child.done();
        futures_lite::future::block_on(futures_lite::future::or(
            parent_signal.wait(),
            child_signal.wait(),
        ));
        if parent_signal.is_closed() {
            child.cancel(false, resolved_parent_err(&parent));
        }
    }));
}
