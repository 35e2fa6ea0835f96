//! Value scopes: immutable key-value pairs layered over a parent.
//!
//! Each derivation carries exactly one binding. Lookup walks the chain
//! toward the root and the nearest binding wins, so shadowing is just
//! deriving again with the same key. Value scopes are transparent to
//! cancellation: they forward deadlines, signals, errors, and the native
//! node capability to their parent unchanged.

use super::{NativeCancel, Scope, ScopeHandle, ScopeValue};
use crate::runtime::Scheduler;
use crate::signal::ClosingSignal;
use crate::tracing_compat::trace;
use crate::types::{ScopeError, Time};
use std::any::{TypeId, type_name};
use std::fmt;
use std::sync::Arc;

/// Marker type binding a lookup key to its value type.
///
/// Keys are types, not runtime values, so key equality is [`TypeId`]
/// equality and a lookup can never yield a value of the wrong type.
///
/// ```
/// use taskscope::{ScopeKey, background};
///
/// struct RequestId;
/// impl ScopeKey for RequestId {
///     type Value = u64;
/// }
///
/// let scope = background().derive_value::<RequestId>(7);
/// assert_eq!(scope.lookup::<RequestId>().as_deref(), Some(&7));
/// ```
pub trait ScopeKey: 'static {
    /// The value carried under this key.
    type Value: Send + Sync + 'static;
}

/// One key-value binding over a parent scope.
struct ValueScope {
    parent: ScopeHandle,
    key: TypeId,
    /// Key type name, kept for derivation-chain display.
    key_name: &'static str,
    value: ScopeValue,
}

impl fmt::Debug for ValueScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueScope")
            .field("key", &self.key_name)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

impl Scope for ValueScope {
    fn deadline(&self) -> Option<Time> {
        self.parent.deadline()
    }

    fn done_signal(&self) -> Option<Arc<ClosingSignal>> {
        self.parent.done_signal()
    }

    fn err(&self) -> Option<ScopeError> {
        self.parent.err()
    }

    fn value_at(&self, key: TypeId) -> Option<ScopeValue> {
        if key == self.key {
            return Some(Arc::clone(&self.value));
        }
        self.parent.inner.value_at(key)
    }

    fn as_cancel_node(&self) -> Option<NativeCancel> {
        // Transparent: children register on the nearest real node.
        self.parent.inner.as_cancel_node()
    }

    fn scheduler(&self) -> Scheduler {
        self.parent.scheduler()
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.parent.inner.describe(f)?;
        write!(f, ".derive_value({})", self.key_name)
    }
}

impl ScopeHandle {
    /// Derives a child scope carrying one key-value binding.
    ///
    /// The binding shadows any ancestor binding for the same key and is
    /// visible to every scope derived below, across cancellation
    /// boundaries. Cancellation state is untouched; the child reports its
    /// parent's deadline, signal, and error.
    #[must_use]
    pub fn derive_value<K: ScopeKey>(&self, value: K::Value) -> Self {
        trace!(key = type_name::<K>(), "binding scope value");
        Self::new(Arc::new(ValueScope {
            parent: self.clone(),
            key: TypeId::of::<K>(),
            key_name: type_name::<K>(),
            value: Arc::new(value),
        }))
    }

    /// Looks up the nearest binding for `K` on the chain toward the root.
    #[must_use]
    pub fn lookup<K: ScopeKey>(&self) -> Option<Arc<K::Value>> {
        self.inner
            .value_at(TypeId::of::<K>())
            .and_then(|value| value.downcast::<K::Value>().ok())
    }

    /// Raw chain lookup by key identity.
    ///
    /// Most callers want the typed [`lookup`](Self::lookup); this is the
    /// untyped form wrappers delegate through.
    #[must_use]
    pub fn value_at(&self, key: TypeId) -> Option<ScopeValue> {
        self.inner.value_at(key)
    }
}
