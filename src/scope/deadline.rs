//! Deadline scopes: cancellation driven by the scheduler clock.
//!
//! A deadline scope is a cancellable node plus one armed timer. When the
//! timer fires the node cancels itself with
//! [`ScopeError::DeadlineExceeded`]; when the node is cancelled by any
//! other route the timer is stopped first so the driver never carries a
//! callback for a resolved scope.
//!
//! Arming happens under the node's state lock (see
//! [`CancelCore::while_live`]), which closes the race where a parent
//! cascade lands between registering on the parent and starting the timer.

use super::cancel::{CancelCore, CancelHandle};
use super::{CancelNode, NativeCancel, Scope, ScopeHandle, ScopeValue, propagate_cancel};
use crate::runtime::Scheduler;
use crate::signal::ClosingSignal;
use crate::time::TimerHandle;
use crate::tracing_compat::trace;
use crate::types::{ScopeError, ScopeId, Time};
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A cancellable node that also owns a timer registration.
///
/// The timer callback holds only a [`Weak`](std::sync::Weak) reference;
/// once every scope, handle, and parent registration is gone a late tick
/// finds nothing to cancel.
pub(crate) struct DeadlineCore {
    core: Arc<CancelCore>,
    deadline: Time,
    /// Slot for the armed timer. Taken exactly once, by whoever cancels
    /// first; the callback itself also goes through here, so a fired
    /// timer is never "stopped" twice.
    timer: Mutex<Option<TimerHandle>>,
}

impl fmt::Debug for DeadlineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineCore")
            .field("id", &self.core.id())
            .field("deadline", &self.deadline)
            .field("err", &self.core.err())
            .finish_non_exhaustive()
    }
}

impl DeadlineCore {
    fn new(parent: ScopeHandle, deadline: Time) -> Self {
        let sched = parent.scheduler();
        Self {
            core: Arc::new(CancelCore::new(parent, sched)),
            deadline,
            timer: Mutex::new(None),
        }
    }

    /// Registers the expiry timer unless the node has already resolved.
    ///
    /// Runs under the state lock so a concurrent cancel either sees the
    /// armed timer and stops it, or wins outright and arming is skipped.
    fn arm(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let deadline = self.deadline;
        let sched = self.core.sched().clone();
        let armed = self.core.while_live(|| {
            let handle = sched.schedule_at(
                deadline,
                Box::new(move || {
                    if let Some(node) = weak.upgrade() {
                        trace!(scope = %node.core.id(), "deadline expired");
                        node.cancel(true, ScopeError::DeadlineExceeded);
                    }
                }),
            );
            *self.timer.lock() = Some(handle);
        });
        if armed.is_none() {
            trace!(scope = %self.core.id(), "scope resolved before its timer was armed");
        }
    }

    /// Stops the pending timer, if any is still armed.
    fn stop_timer(&self) {
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            self.core.sched().cancel_timer(&handle);
        }
    }

    fn cancel(&self, remove_from_parent: bool, err: ScopeError) {
        // Timer first: once `core.cancel` runs, nothing else will come
        // back to collect the registration.
        self.stop_timer();
        self.core.cancel(remove_from_parent, err);
    }
}

impl CancelNode for DeadlineCore {
    fn scope_id(&self) -> ScopeId {
        self.core.id()
    }

    fn cancel(&self, remove_from_parent: bool, err: ScopeError) {
        Self::cancel(self, remove_from_parent, err);
    }

    fn done(&self) -> Arc<ClosingSignal> {
        self.core.done_signal()
    }
}

/// The scope face of a deadline node.
struct DeadlineScope {
    node: Arc<DeadlineCore>,
}

impl fmt::Debug for DeadlineScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineScope")
            .field("id", &self.node.core.id())
            .field("deadline", &self.node.deadline)
            .field("err", &self.node.core.err())
            .finish()
    }
}

impl Scope for DeadlineScope {
    fn deadline(&self) -> Option<Time> {
        // Derivation already degraded to a plain cancel scope when an
        // ancestor's deadline was earlier, so ours is the binding one.
        Some(self.node.deadline)
    }

    fn done_signal(&self) -> Option<Arc<ClosingSignal>> {
        Some(self.node.core.done_signal())
    }

    fn err(&self) -> Option<ScopeError> {
        self.node.core.err()
    }

    fn value_at(&self, key: TypeId) -> Option<ScopeValue> {
        self.node.core.parent().inner.value_at(key)
    }

    fn as_cancel_node(&self) -> Option<NativeCancel> {
        Some(NativeCancel {
            core: Arc::clone(&self.node.core),
        })
    }

    fn scheduler(&self) -> Scheduler {
        self.node.core.sched().clone()
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.node.core.parent().inner.describe(f)?;
        write!(f, ".derive_deadline({}", self.node.deadline)?;
        let now = self.node.core.sched().now();
        if now < self.node.deadline {
            write!(
                f,
                " [{}])",
                Time::from_nanos(self.node.deadline.duration_since(now))
            )
        } else {
            write!(f, " [expired])")
        }
    }
}

impl ScopeHandle {
    /// Derives a child scope that is cancelled automatically at `deadline`.
    ///
    /// The deadline is an absolute instant on this scope's scheduler
    /// clock. If an ancestor already carries an earlier deadline the
    /// child needs no timer of its own and behaves exactly like
    /// [`derive_cancel`](Self::derive_cancel), reporting the inherited
    /// deadline. If the deadline has already passed the child comes back
    /// resolved with [`ScopeError::DeadlineExceeded`]; the pair is
    /// returned either way so callers release it uniformly.
    #[must_use]
    pub fn derive_deadline(&self, deadline: Time) -> (Self, CancelHandle) {
        if let Some(cur) = self.deadline() {
            if cur < deadline {
                return self.derive_cancel();
            }
        }
        let node = Arc::new(DeadlineCore::new(self.clone(), deadline));
        let dyn_node: Arc<dyn CancelNode> = Arc::clone(&node) as Arc<dyn CancelNode>;
        propagate_cancel(self, &dyn_node);

        if deadline <= node.core.sched().now() {
            dyn_node.cancel(true, ScopeError::DeadlineExceeded);
        } else {
            node.arm();
        }
        let scope = Self::new(Arc::new(DeadlineScope {
            node: Arc::clone(&node),
        }));
        (scope, CancelHandle::new(dyn_node))
    }

    /// Derives a child scope cancelled after `timeout` elapses.
    ///
    /// Shorthand for [`derive_deadline`](Self::derive_deadline) at
    /// now-plus-`timeout` on this scope's scheduler clock.
    #[must_use]
    pub fn derive_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        let now = self.scheduler().now();
        self.derive_deadline(now + timeout)
    }
}
