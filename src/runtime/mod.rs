//! Scheduler and watcher-thread services.

mod scheduler;
mod spawn;

pub use scheduler::{Scheduler, SchedulerBuilder};
pub use spawn::{Spawn, SpawnHandle, SpawnTask, ThreadSpawner};
