//! Cancellation error taxonomy.
//!
//! A scope that will never be cancelled reports no error. Once cancellation
//! fires, exactly one of two causes is recorded and never changes: an
//! explicit cancel request, or an elapsed deadline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reason a scope's done signal closed.
///
/// This is a closed world on purpose. Callers branch on the variant to
/// distinguish "someone upstream gave up" from "we ran out of time", and a
/// scope reports the same variant forever once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ScopeError {
    /// The scope (or an ancestor) was cancelled explicitly.
    #[error("scope cancelled")]
    Cancelled,
    /// The scope's deadline elapsed before any explicit cancel.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl ScopeError {
    /// Returns true if this error records an elapsed deadline.
    #[must_use]
    pub const fn is_deadline_exceeded(self) -> bool {
        matches!(self, Self::DeadlineExceeded)
    }

    /// Returns true if this error records an explicit cancellation.
    #[must_use]
    pub const fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
