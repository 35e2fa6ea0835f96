//! Watcher thread spawning.
//!
//! Propagation through a foreign scope needs a thread parked on the
//! ancestor's done signal. The spawner seam keeps that concern pluggable:
//! production uses detached OS threads, and anything implementing [`Spawn`]
//! (a pool, a test harness) can stand in.

use std::fmt;
use std::sync::Arc;
use std::thread;

/// A unit of work handed to a spawner.
pub type SpawnTask = Box<dyn FnOnce() + Send>;

/// Spawns background watcher work.
pub trait Spawn: Send + Sync + fmt::Debug {
    /// Runs `task` on some other thread.
    ///
    /// The task blocks until an ancestor scope resolves, so implementations
    /// must not run it inline on the caller.
    fn spawn(&self, task: SpawnTask);
}

/// Spawns each task on a fresh detached OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl ThreadSpawner {
    /// Creates a new thread spawner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Spawn for ThreadSpawner {
    fn spawn(&self, task: SpawnTask) {
        // A lost watcher would sever cancellation through a foreign scope,
        // so spawn failure is fatal.
        thread::Builder::new()
            .name("taskscope-watcher".to_string())
            .spawn(task)
            .expect("failed to spawn watcher thread");
    }
}

/// Shared handle to a spawner.
#[derive(Clone)]
pub struct SpawnHandle {
    inner: Arc<dyn Spawn>,
}

impl fmt::Debug for SpawnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnHandle").finish_non_exhaustive()
    }
}

impl SpawnHandle {
    /// Creates a new handle wrapping the given spawner.
    #[inline]
    pub fn new<S: Spawn + 'static>(spawner: Arc<S>) -> Self {
        Self { inner: spawner }
    }

    /// Creates a handle spawning detached OS threads.
    #[must_use]
    pub fn os_threads() -> Self {
        Self::new(Arc::new(ThreadSpawner::new()))
    }

    /// Runs `task` on the wrapped spawner.
    #[inline]
    pub fn spawn(&self, task: SpawnTask) {
        self.inner.spawn(task);
    }
}
