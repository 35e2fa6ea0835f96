//! Time sources and deadline timers.
//!
//! Deadline scopes arm callbacks against a [`TimerDriver`]; the driver reads
//! its clock through [`TimeSource`], so the same scope code runs against the
//! wall clock in production and a [`VirtualClock`] in tests.

mod driver;
mod queue;

pub use driver::{
    TimeSource, TimerCallback, TimerDriver, TimerDriverApi, TimerDriverHandle, TimerHandle,
    VirtualClock, WallClock,
};
