//! Explicitly cancellable scopes.
//!
//! `derive_cancel` attaches a new cancellable node under a parent and hands
//! back the node plus the capability to cancel it. Cancellation is
//! idempotent and runs in a fixed order: record the error, close the done
//! signal, cascade to registered children, detach from the parent.
//!
//! # Locking
//!
//! Each node has one state lock guarding its error and child registry.
//! Cancellation drains the registry under the lock but closes the signal
//! and cancels the drained children only after releasing it, so no lock is
//! ever held across a call into another node.

use super::{
    CancelNode, NativeCancel, Scope, ScopeHandle, ScopeValue, propagate_cancel, remove_child,
};
use crate::runtime::Scheduler;
use crate::signal::ClosingSignal;
use crate::tracing_compat::trace;
use crate::types::{ScopeError, ScopeId, Time};
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Mutable state of a native cancellation node.
struct CoreState {
    /// Set once by the first cancellation; never cleared.
    err: Option<ScopeError>,
    /// Registered children, keyed by scope id for deterministic fan-out.
    /// Allocated on first adoption; a cancelled node's registry stays
    /// `None` forever, which is what makes adoption-after-cancel
    /// impossible to miss.
    children: Option<BTreeMap<ScopeId, Arc<dyn CancelNode>>>,
}

/// The native cancellation node behind cancel and deadline scopes.
pub(crate) struct CancelCore {
    id: ScopeId,
    parent: ScopeHandle,
    sched: Scheduler,
    /// Lazily allocated done signal. Writes happen only while `state` is
    /// locked, so cancellation and first-request agree on whether the
    /// scope was already resolved.
    done: OnceLock<Arc<ClosingSignal>>,
    state: Mutex<CoreState>,
}

impl fmt::Debug for CancelCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelCore")
            .field("id", &self.id)
            .field("err", &self.err())
            .finish_non_exhaustive()
    }
}

impl CancelCore {
    pub(crate) fn new(parent: ScopeHandle, sched: Scheduler) -> Self {
        Self {
            id: ScopeId::next(),
            parent,
            sched,
            done: OnceLock::new(),
            state: Mutex::new(CoreState {
                err: None,
                children: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn parent(&self) -> &ScopeHandle {
        &self.parent
    }

    pub(crate) fn sched(&self) -> &Scheduler {
        &self.sched
    }

    pub(crate) fn err(&self) -> Option<ScopeError> {
        self.state.lock().err
    }

    /// True if `signal` is this node's own done signal.
    ///
    /// A wrapper that forwards the native node but substitutes its own
    /// signal fails this check and is routed through the watcher path.
    pub(crate) fn owns_signal(&self, signal: &Arc<ClosingSignal>) -> bool {
        self.done.get().is_some_and(|own| Arc::ptr_eq(own, signal))
    }

    /// Returns the node's done signal, allocating it on first request.
    ///
    /// A node cancelled before anyone asked hands out the shared
    /// pre-closed signal instead of allocating.
    pub(crate) fn done_signal(&self) -> Arc<ClosingSignal> {
        if let Some(signal) = self.done.get() {
            return Arc::clone(signal);
        }
        let state = self.state.lock();
        let signal = self.done.get_or_init(|| {
            if state.err.is_some() {
                ClosingSignal::pre_closed()
            } else {
                Arc::new(ClosingSignal::new())
            }
        });
        Arc::clone(signal)
    }

    /// Registers `child` to be cancelled when this node is.
    ///
    /// Fails with this node's error if it has already resolved; the caller
    /// cancels the child itself, outside our lock.
    pub(crate) fn try_adopt(&self, child: Arc<dyn CancelNode>) -> Result<(), ScopeError> {
        let mut state = self.state.lock();
        if let Some(err) = state.err {
            return Err(err);
        }
        state
            .children
            .get_or_insert_with(BTreeMap::new)
            .insert(child.scope_id(), child);
        Ok(())
    }

    /// Drops the registration of the child with `id`, if present.
    pub(crate) fn remove_child(&self, id: ScopeId) {
        let mut state = self.state.lock();
        if let Some(children) = state.children.as_mut() {
            children.remove(&id);
        }
    }

    /// Cancels this node with `err`.
    ///
    /// First call wins; the error never changes afterwards. Registered
    /// children are drained under the state lock and cancelled after it is
    /// released, each with the same error and without detaching (this
    /// registry is already gone).
    pub(crate) fn cancel(&self, remove_from_parent: bool, err: ScopeError) {
        let (signal, children) = {
            let mut state = self.state.lock();
            if state.err.is_some() {
                return;
            }
            state.err = Some(err);
            let signal = match self.done.get() {
                Some(signal) => Some(Arc::clone(signal)),
                None => {
                    // Nobody holds the signal; future requests get the
                    // shared pre-closed one.
                    let _ = self.done.set(ClosingSignal::pre_closed());
                    None
                }
            };
            (signal, state.children.take())
        };

        trace!(scope = %self.id, %err, "scope cancelled");

        if let Some(signal) = signal {
            signal.close();
        }
        if let Some(children) = children {
            for child in children.into_values() {
                child.cancel(false, err);
            }
        }
        if remove_from_parent {
            remove_child(&self.parent, self.id);
        }
    }

    /// Runs `f` under the state lock if the node has not resolved.
    ///
    /// Deadline scopes arm their timer through this so arming cannot race
    /// a concurrent cancel into leaving a live timer on a dead scope.
    pub(crate) fn while_live<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.lock();
        if state.err.is_some() {
            return None;
        }
        let result = f();
        drop(state);
        Some(result)
    }

    /// Number of currently registered children.
    #[cfg(any(test, feature = "test-internals"))]
    pub(crate) fn child_count(&self) -> usize {
        self.state
            .lock()
            .children
            .as_ref()
            .map_or(0, BTreeMap::len)
    }
}

impl CancelNode for CancelCore {
    fn scope_id(&self) -> ScopeId {
        self.id
    }

    fn cancel(&self, remove_from_parent: bool, err: ScopeError) {
        Self::cancel(self, remove_from_parent, err);
    }

    fn done(&self) -> Arc<ClosingSignal> {
        self.done_signal()
    }
}

#[cfg(any(test, feature = "test-internals"))]
impl NativeCancel {
    /// Number of children currently registered on this node.
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.core.child_count()
    }
}

/// The scope face of a cancellable node.
struct CancelScope {
    core: Arc<CancelCore>,
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("id", &self.core.id())
            .field("err", &self.core.err())
            .finish()
    }
}

impl Scope for CancelScope {
    fn deadline(&self) -> Option<Time> {
        self.core.parent().deadline()
    }

    fn done_signal(&self) -> Option<Arc<ClosingSignal>> {
        Some(self.core.done_signal())
    }

    fn err(&self) -> Option<ScopeError> {
        self.core.err()
    }

    fn value_at(&self, key: TypeId) -> Option<ScopeValue> {
        self.core.parent().inner.value_at(key)
    }

    fn as_cancel_node(&self) -> Option<NativeCancel> {
        Some(NativeCancel {
            core: Arc::clone(&self.core),
        })
    }

    fn scheduler(&self) -> Scheduler {
        self.core.sched().clone()
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.parent().inner.describe(f)?;
        write!(f, ".derive_cancel")
    }
}

/// Capability to cancel one scope.
///
/// Cloning shares the capability. Dropping every clone without calling
/// [`cancel`](Self::cancel) does not cancel the scope; it stays registered
/// on its parent until the parent resolves.
#[must_use = "a scope stays registered on its parent until cancelled"]
#[derive(Clone)]
pub struct CancelHandle {
    node: Arc<dyn CancelNode>,
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelHandle")
            .field(&self.node.scope_id())
            .finish()
    }
}

impl CancelHandle {
    pub(crate) fn new(node: Arc<dyn CancelNode>) -> Self {
        Self { node }
    }

    /// Cancels the scope with [`ScopeError::Cancelled`].
    ///
    /// Idempotent; later calls (and cancels racing an expiring deadline)
    /// leave the first recorded error in place.
    pub fn cancel(&self) {
        self.node.cancel(true, ScopeError::Cancelled);
    }
}

impl ScopeHandle {
    /// Derives a cancellable child scope.
    ///
    /// Returns the child and the capability to cancel it. Cancelling the
    /// child cascades to its descendants and detaches it from this scope;
    /// when this scope resolves first, the child is cancelled with the
    /// ancestor's error.
    ///
    /// The child holds a registration on its nearest cancellable ancestor
    /// until one of the two sides resolves. Call `cancel` as soon as the
    /// work the scope guards is finished.
    #[must_use]
    pub fn derive_cancel(&self) -> (Self, CancelHandle) {
        let core = Arc::new(CancelCore::new(self.clone(), self.scheduler()));
        let node: Arc<dyn CancelNode> = Arc::clone(&core) as Arc<dyn CancelNode>;
        propagate_cancel(self, &node);
        let scope = Self::new(Arc::new(CancelScope { core }));
        (scope, CancelHandle::new(node))
    }
}
