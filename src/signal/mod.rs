//! Cancellation signalling primitives.

mod closing;

pub use closing::{Closed, ClosingSignal};
