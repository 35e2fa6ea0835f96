//! Root scopes.
//!
//! Roots are never cancelled: no deadline, no done signal, no error, no
//! values. Every derivation chain bottoms out in one.

use super::{Scope, ScopeHandle, ScopeValue};
use crate::runtime::Scheduler;
use crate::signal::ClosingSignal;
use crate::types::{ScopeError, Time};
use std::any::TypeId;
use std::fmt;
use std::sync::{Arc, LazyLock};

static BACKGROUND: LazyLock<ScopeHandle> = LazyLock::new(|| root("background", None));
static TODO: LazyLock<ScopeHandle> = LazyLock::new(|| root("todo", None));

#[derive(Debug)]
struct RootScope {
    name: &'static str,
    /// `None` defers to the global scheduler on first use.
    sched: Option<Scheduler>,
}

impl Scope for RootScope {
    fn deadline(&self) -> Option<Time> {
        None
    }

    fn done_signal(&self) -> Option<Arc<ClosingSignal>> {
        None
    }

    fn err(&self) -> Option<ScopeError> {
        None
    }

    fn value_at(&self, _key: TypeId) -> Option<ScopeValue> {
        None
    }

    fn scheduler(&self) -> Scheduler {
        self.sched.clone().unwrap_or_else(Scheduler::global)
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn root(name: &'static str, sched: Option<Scheduler>) -> ScopeHandle {
    ScopeHandle::new(Arc::new(RootScope { name, sched }))
}

/// The root scope for derivations that live as long as the process.
#[must_use]
pub fn background() -> ScopeHandle {
    BACKGROUND.clone()
}

/// The placeholder root for call sites that do not yet know which scope
/// they will be handed.
///
/// Behaves exactly like [`background`]; the distinct name marks the call
/// site as unfinished plumbing.
#[must_use]
pub fn todo() -> ScopeHandle {
    TODO.clone()
}

impl Scheduler {
    /// Creates a root scope whose descendants derive against this
    /// scheduler instead of the global one.
    ///
    /// This is how a tree is pinned to a virtual clock: deadlines derived
    /// under the root arm timers on this scheduler's driver.
    #[must_use]
    pub fn root_scope(&self, name: &'static str) -> ScopeHandle {
        root(name, Some(self.clone()))
    }
}
