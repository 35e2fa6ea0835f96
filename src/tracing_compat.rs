//! Structured-logging shim over the optional `tracing` dependency.
//!
//! Scope derivation, cancellation fan-out, and timer expiry emit trace
//! events through this module. With the `tracing-integration` feature the
//! macros are the real ones from the `tracing` crate; without it they
//! expand to nothing, so the hot paths carry no logging cost.
//!
//! ```rust,ignore
//! use taskscope::tracing_compat::{debug, trace};
//!
//! trace!(scope = %id, "scope cancelled");
//! debug!(parent = %name, "spawning cancellation watcher");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op stand-ins compiled when tracing is disabled.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
