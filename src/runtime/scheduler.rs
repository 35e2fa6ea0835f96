//! Scheduler: the ambient services a scope tree runs against.
//!
//! A [`Scheduler`] bundles the two things scopes need from their
//! environment: a timer driver for deadlines and a spawner for watcher
//! threads. [`Scheduler::global`] lazily starts a wall-clock scheduler whose
//! timers are fired by a dedicated pump thread; [`SchedulerBuilder`] builds
//! isolated schedulers, typically over a [`VirtualClock`] so tests control
//! when deadlines fire.

use crate::runtime::spawn::{SpawnHandle, SpawnTask};
use crate::time::{
    TimerCallback, TimerDriver, TimerDriverApi, TimerDriverHandle, TimerHandle, VirtualClock,
    WallClock,
};
use crate::types::Time;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;

static GLOBAL: LazyLock<Scheduler> = LazyLock::new(|| SchedulerBuilder::new().build());

/// Timer and spawner services shared by a scope tree.
///
/// Cloning is cheap; clones refer to the same underlying services. Scopes
/// derived from a root carry the root's scheduler, so one tree never mixes
/// clocks.
#[derive(Clone)]
pub struct Scheduler {
    timer: TimerDriverHandle,
    spawner: SpawnHandle,
    /// Keeps the pump thread of a wall-clock scheduler alive; the thread
    /// exits when the last clone (including every scope in the tree) drops.
    _pump: Option<Arc<PumpGuard>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("timer", &self.timer)
            .field("pumped", &self._pump.is_some())
            .finish()
    }
}

impl Scheduler {
    /// Returns the process-wide wall-clock scheduler.
    ///
    /// Created on first use; its pump thread lives for the rest of the
    /// process.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Starts building a custom scheduler.
    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Returns the current time from the scheduler's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.timer.now()
    }

    /// Returns the scheduler's timer driver handle.
    ///
    /// Virtual-clock schedulers fire deadlines only when the caller pumps
    /// this driver via `process_timers`.
    #[must_use]
    pub fn timer(&self) -> &TimerDriverHandle {
        &self.timer
    }

    /// Arms a callback at `deadline`.
    pub(crate) fn schedule_at(&self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        self.timer.register(deadline, callback)
    }

    /// Cancels an armed callback.
    pub(crate) fn cancel_timer(&self, handle: &TimerHandle) -> bool {
        self.timer.cancel(handle)
    }

    /// Runs a watcher task in the background.
    pub(crate) fn spawn(&self, task: SpawnTask) {
        self.spawner.spawn(task);
    }
}

/// Builder for [`Scheduler`].
///
/// Defaults to a fresh wall-clock driver with its own pump thread and
/// detached OS threads for watchers.
#[derive(Debug, Default)]
pub struct SchedulerBuilder {
    timer: Option<TimerDriverHandle>,
    spawner: Option<SpawnHandle>,
}

impl SchedulerBuilder {
    /// Creates a builder with no services chosen yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given timer driver.
    ///
    /// The caller is responsible for pumping it; no pump thread is started.
    #[must_use]
    pub fn timer(mut self, timer: TimerDriverHandle) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Uses a virtual clock.
    ///
    /// Deadlines fire when the test advances the clock and pumps the
    /// scheduler's timer driver.
    #[must_use]
    pub fn virtual_clock(self, clock: Arc<VirtualClock>) -> Self {
        self.timer(TimerDriverHandle::with_virtual_clock(clock))
    }

    /// Uses the given watcher spawner.
    #[must_use]
    pub fn spawner(mut self, spawner: SpawnHandle) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Builds the scheduler.
    #[must_use]
    pub fn build(self) -> Scheduler {
        let (timer, pump) = match self.timer {
            Some(timer) => (timer, None),
            None => {
                let driver = Arc::new(PumpedDriver::new());
                PumpedDriver::start(&driver);
                let guard = Arc::new(PumpGuard {
                    driver: Arc::clone(&driver),
                });
                (TimerDriverHandle::from_api(driver), Some(guard))
            }
        };
        let spawner = self.spawner.unwrap_or_else(SpawnHandle::os_threads);
        Scheduler {
            timer,
            spawner,
            _pump: pump,
        }
    }
}

// =============================================================================
// Wall-clock pump
// =============================================================================

#[derive(Debug)]
struct PumpState {
    /// Set by `register` so the pump re-evaluates its sleep instead of
    /// waiting out a deadline that is no longer the earliest.
    flagged: bool,
    shutdown: bool,
}

/// Wall-clock driver whose registrations nudge a pump thread.
#[derive(Debug)]
struct PumpedDriver {
    inner: TimerDriver<WallClock>,
    state: Mutex<PumpState>,
    cv: Condvar,
}

impl PumpedDriver {
    fn new() -> Self {
        Self {
            inner: TimerDriver::with_clock(Arc::new(WallClock::new())),
            state: Mutex::new(PumpState {
                flagged: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn start(driver: &Arc<Self>) {
        let pump = Arc::clone(driver);
        thread::Builder::new()
            .name("taskscope-timer".to_string())
            .spawn(move || pump_loop(&pump))
            .expect("failed to spawn timer pump thread");
    }
}

impl TimerDriverApi for PumpedDriver {
    fn now(&self) -> Time {
        self.inner.now()
    }

    fn register(&self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        let handle = self.inner.register(deadline, callback);
        let mut state = self.state.lock();
        state.flagged = true;
        self.cv.notify_one();
        drop(state);
        handle
    }

    fn cancel(&self, handle: &TimerHandle) -> bool {
        // No nudge: the pump waking at a stale deadline just finds nothing
        // expired and re-evaluates.
        self.inner.cancel(handle)
    }

    fn next_deadline(&self) -> Option<Time> {
        self.inner.next_deadline()
    }

    fn process_timers(&self) -> usize {
        self.inner.process_timers()
    }

    fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }

    fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn pump_loop(driver: &PumpedDriver) {
    loop {
        let _ = driver.inner.process_timers();
        let mut state = driver.state.lock();
        if state.shutdown {
            break;
        }
        if state.flagged {
            // A registration landed while we were firing; re-evaluate
            // before sleeping.
            state.flagged = false;
            continue;
        }
        match driver.inner.next_deadline() {
            Some(deadline) => {
                let wait = Duration::from_nanos(deadline.duration_since(driver.inner.now()));
                if wait.is_zero() {
                    continue;
                }
                let _ = driver.cv.wait_for(&mut state, wait);
            }
            None => driver.cv.wait(&mut state),
        }
        state.flagged = false;
    }
}

/// Shuts the pump thread down when the last scheduler clone drops.
struct PumpGuard {
    driver: Arc<PumpedDriver>,
}

impl Drop for PumpGuard {
    fn drop(&mut self) {
        let mut state = self.driver.state.lock();
        state.shutdown = true;
        drop(state);
        self.driver.cv.notify_one();
    }
}
