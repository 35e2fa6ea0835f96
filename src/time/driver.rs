//! Timer driver for deadline callback registration.
//!
//! The timer driver owns the time source and a deadline-ordered callback
//! queue. It supports both production (wall clock) and virtual time, so
//! deadline behavior is testable without sleeping.

use crate::types::Time;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::queue::{CallbackBatch, TimerQueue};

pub use super::queue::{TimerCallback, TimerHandle};

#[inline]
fn duration_to_nanos_saturating(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}

/// Time source abstraction for getting the current time.
///
/// This trait allows the timer driver to work with both wall clock time
/// (production) and virtual time (deterministic testing).
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source for production use.
///
/// Uses `std::time::Instant` internally, converting to our `Time` type.
/// The epoch is the time when this source was created.
#[derive(Debug)]
pub struct WallClock {
    /// The instant when this clock was created.
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        let elapsed = self.epoch.elapsed();
        Time::from_nanos(duration_to_nanos_saturating(elapsed))
    }
}

/// Virtual time source for deterministic testing.
///
/// Time only advances when explicitly told to do so, enabling
/// deterministic testing of time-dependent code.
///
/// # Example
///
/// ```
/// use taskscope::time::{TimeSource, VirtualClock};
/// use taskscope::types::Time;
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000_000_000); // 1 second
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug)]
pub struct VirtualClock {
    /// Current time in nanoseconds.
    now: AtomicU64,
    /// When true, `now()` returns the frozen time and `advance`/`advance_to`
    /// are no-ops. The frozen time is captured at the moment `pause()` is called.
    paused: AtomicBool,
    /// Frozen time snapshot captured when the clock is paused.
    frozen_at: AtomicU64,
}

impl VirtualClock {
    /// Creates a new virtual clock starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            frozen_at: AtomicU64::new(0),
        }
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now: AtomicU64::new(time.as_nanos()),
            paused: AtomicBool::new(false),
            frozen_at: AtomicU64::new(time.as_nanos()),
        }
    }

    /// Advances time by the given number of nanoseconds.
    ///
    /// No-op when the clock is paused.
    pub fn advance(&self, nanos: u64) {
        if !self.paused.load(Ordering::Acquire) {
            self.now.fetch_add(nanos, Ordering::Release);
        }
    }

    /// Advances time by a `Duration`.
    ///
    /// No-op when the clock is paused.
    pub fn advance_by(&self, duration: Duration) {
        self.advance(duration_to_nanos_saturating(duration));
    }

    /// Advances time to the given absolute time.
    ///
    /// If the target time is in the past, or the clock is paused, this is a no-op.
    pub fn advance_to(&self, time: Time) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let target = time.as_nanos();
        let mut current = self.now.load(Ordering::Acquire);
        while current < target {
            match self.now.compare_exchange_weak(
                current,
                target,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Sets the current time (for testing).
    pub fn set(&self, time: Time) {
        self.now.store(time.as_nanos(), Ordering::Release);
    }

    /// Pauses the clock, freezing `now()` at the current time.
    ///
    /// While paused, `advance()` and `advance_to()` are no-ops.
    /// Call `resume()` to unfreeze.
    pub fn pause(&self) {
        let current = self.now.load(Ordering::Acquire);
        self.frozen_at.store(current, Ordering::Release);
        self.paused.store(true, Ordering::Release);
    }

    /// Resumes a paused clock.
    ///
    /// The clock continues from the time it was paused at (no jump).
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Returns true if the clock is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        if self.paused.load(Ordering::Acquire) {
            Time::from_nanos(self.frozen_at.load(Ordering::Acquire))
        } else {
            Time::from_nanos(self.now.load(Ordering::Acquire))
        }
    }
}

/// Timer driver that manages deadline callbacks and fires them.
///
/// The driver maintains a deadline-ordered queue. When `process_timers` is
/// called, every expired callback runs, after the queue lock is released.
///
/// # Thread Safety
///
/// The driver is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```
/// use taskscope::time::{TimerDriver, VirtualClock};
/// use taskscope::types::Time;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// let clock = Arc::new(VirtualClock::new());
/// let driver = TimerDriver::with_clock(Arc::clone(&clock));
///
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&fired);
/// let _handle = driver.register(
///     Time::from_millis(5),
///     Box::new(move || flag.store(true, Ordering::SeqCst)),
/// );
///
/// clock.advance_to(Time::from_millis(5));
/// assert_eq!(driver.process_timers(), 1);
/// assert!(fired.load(Ordering::SeqCst));
/// ```
#[derive(Debug)]
pub struct TimerDriver<T: TimeSource = VirtualClock> {
    /// The time source.
    clock: Arc<T>,
    /// Deadline queue (protected by mutex for thread safety).
    queue: Mutex<TimerQueue>,
}

impl<T: TimeSource> TimerDriver<T> {
    /// Creates a new timer driver with the given time source.
    #[must_use]
    pub fn with_clock(clock: Arc<T>) -> Self {
        Self {
            clock,
            queue: Mutex::new(TimerQueue::new()),
        }
    }

    /// Returns the current time from the underlying clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Registers a callback to run at the given deadline.
    ///
    /// Returns a handle that can be used to cancel the timer. The callback
    /// runs during a later `process_timers` call once the deadline has
    /// passed.
    #[must_use]
    pub fn register(&self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        self.queue.lock().register(deadline, callback)
    }

    /// Cancels an existing timer registration.
    ///
    /// Returns true if the timer was pending and is now cancelled; its
    /// callback will never run.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        self.queue.lock().cancel(handle)
    }

    /// Returns the next deadline that will fire, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.queue.lock().next_deadline()
    }

    /// Runs all expired callbacks.
    ///
    /// Returns the number of timers fired. Callbacks run after the queue
    /// lock is released, so a callback is free to register or cancel
    /// timers on this same driver.
    pub fn process_timers(&self) -> usize {
        let now = self.clock.now();
        let expired = self.collect_expired(now);
        let fired = expired.len();
        for callback in expired {
            callback();
        }
        fired
    }

    /// Helper to collect expired callbacks while holding the lock.
    #[allow(clippy::significant_drop_tightening)]
    fn collect_expired(&self, now: Time) -> CallbackBatch {
        self.queue.lock().collect_expired(now)
    }

    /// Returns the number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns true if there are no pending timers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Clears all pending timers without firing them.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

impl TimerDriver<VirtualClock> {
    /// Creates a new timer driver with a virtual clock.
    ///
    /// This is the default for testing use.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(VirtualClock::new()))
    }
}

impl Default for TimerDriver<VirtualClock> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TimerDriverHandle - Shared handle for timer driver access
// =============================================================================

/// Trait abstracting timer driver operations for use with trait objects.
///
/// This allows callers to create either wall-clock or virtual-clock based
/// drivers while consumers use a unified handle type.
pub trait TimerDriverApi: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> Time;

    /// Registers a callback to run at the given deadline.
    fn register(&self, deadline: Time, callback: TimerCallback) -> TimerHandle;

    /// Cancels an existing timer.
    fn cancel(&self, handle: &TimerHandle) -> bool;

    /// Returns the next deadline that will fire.
    fn next_deadline(&self) -> Option<Time>;

    /// Runs expired callbacks.
    fn process_timers(&self) -> usize;

    /// Returns the number of pending timers.
    fn pending_count(&self) -> usize;

    /// Returns true if no timers are pending.
    fn is_empty(&self) -> bool;
}

impl<T: TimeSource + std::fmt::Debug + 'static> TimerDriverApi for TimerDriver<T> {
    fn now(&self) -> Time {
        Self::now(self)
    }

    fn register(&self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        Self::register(self, deadline, callback)
    }

    fn cancel(&self, handle: &TimerHandle) -> bool {
        Self::cancel(self, handle)
    }

    fn next_deadline(&self) -> Option<Time> {
        Self::next_deadline(self)
    }

    fn process_timers(&self) -> usize {
        Self::process_timers(self)
    }

    fn pending_count(&self) -> usize {
        Self::pending_count(self)
    }

    fn is_empty(&self) -> bool {
        Self::is_empty(self)
    }
}

/// Shared handle to a timer driver.
///
/// This wrapper provides cloneable access to a timer driver. It abstracts
/// over the concrete time source (wall clock vs virtual clock) using a
/// trait object, so deadline scopes arm timers without knowing which clock
/// drives them.
#[derive(Clone)]
pub struct TimerDriverHandle {
    inner: Arc<dyn TimerDriverApi>,
}

impl std::fmt::Debug for TimerDriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerDriverHandle")
            .field("pending_count", &self.inner.pending_count())
            .finish()
    }
}

impl TimerDriverHandle {
    /// Creates a new handle wrapping the given timer driver.
    #[inline]
    pub fn new<T: TimeSource + std::fmt::Debug + 'static>(driver: Arc<TimerDriver<T>>) -> Self {
        Self { inner: driver }
    }

    /// Creates a handle from any timer driver implementation.
    #[inline]
    #[must_use]
    pub fn from_api(inner: Arc<dyn TimerDriverApi>) -> Self {
        Self { inner }
    }

    /// Creates a handle with a wall clock timer driver for production use.
    #[must_use]
    pub fn with_wall_clock() -> Self {
        let clock = Arc::new(WallClock::new());
        let driver = Arc::new(TimerDriver::with_clock(clock));
        Self::new(driver)
    }

    /// Creates a handle with a virtual clock timer driver for testing.
    #[must_use]
    pub fn with_virtual_clock(clock: Arc<VirtualClock>) -> Self {
        let driver = Arc::new(TimerDriver::with_clock(clock));
        Self::new(driver)
    }

    /// Returns the current time from the timer driver.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Time {
        self.inner.now()
    }

    /// Registers a callback to run at the given deadline.
    ///
    /// Returns a handle that can be used to cancel the timer.
    #[inline]
    #[must_use]
    pub fn register(&self, deadline: Time, callback: TimerCallback) -> TimerHandle {
        self.inner.register(deadline, callback)
    }

    /// Cancels an existing timer.
    ///
    /// Returns true if the timer was pending and is now cancelled.
    #[inline]
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        self.inner.cancel(handle)
    }

    /// Returns the next deadline that will fire, if any.
    #[inline]
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.inner.next_deadline()
    }

    /// Runs all expired callbacks.
    ///
    /// Returns the number of timers fired.
    #[inline]
    pub fn process_timers(&self) -> usize {
        self.inner.process_timers()
    }

    /// Returns the number of pending timers.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count()
    }

    /// Returns true if no timers are pending.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    // ---- VirtualClock ----

    #[test]
    fn virtual_clock_starts_at_zero() {
        init_test("virtual_clock_starts_at_zero");
        let clock = VirtualClock::new();
        crate::assert_with_log!(
            clock.now() == Time::ZERO,
            "fresh virtual clock should read zero",
            Time::ZERO,
            clock.now()
        );
        crate::test_complete!("virtual_clock_starts_at_zero");
    }

    #[test]
    fn virtual_clock_advances() {
        init_test("virtual_clock_advances");
        let clock = VirtualClock::new();
        clock.advance(500);
        clock.advance(250);
        crate::assert_with_log!(
            clock.now() == Time::from_nanos(750),
            "advances should accumulate",
            Time::from_nanos(750),
            clock.now()
        );
        crate::test_complete!("virtual_clock_advances");
    }

    #[test]
    fn virtual_clock_advance_to_is_monotonic() {
        init_test("virtual_clock_advance_to_is_monotonic");
        let clock = VirtualClock::starting_at(Time::from_secs(10));
        clock.advance_to(Time::from_secs(5));
        crate::assert_with_log!(
            clock.now() == Time::from_secs(10),
            "advance_to into the past should be a no-op",
            Time::from_secs(10),
            clock.now()
        );
        clock.advance_to(Time::from_secs(20));
        crate::assert_with_log!(
            clock.now() == Time::from_secs(20),
            "advance_to into the future should jump",
            Time::from_secs(20),
            clock.now()
        );
        crate::test_complete!("virtual_clock_advance_to_is_monotonic");
    }

    #[test]
    fn virtual_clock_pause_freezes_time() {
        init_test("virtual_clock_pause_freezes_time");
        let clock = VirtualClock::new();
        clock.advance(100);
        clock.pause();
        clock.advance(900);
        crate::assert_with_log!(
            clock.now() == Time::from_nanos(100),
            "paused clock should not advance",
            Time::from_nanos(100),
            clock.now()
        );
        clock.resume();
        clock.advance(900);
        crate::assert_with_log!(
            clock.now() == Time::from_nanos(1000),
            "resumed clock should advance again",
            Time::from_nanos(1000),
            clock.now()
        );
        crate::test_complete!("virtual_clock_pause_freezes_time");
    }

    #[test]
    fn wall_clock_moves_forward() {
        init_test("wall_clock_moves_forward");
        let clock = WallClock::new();
        let first = clock.now();
        std::thread::sleep(Duration::from_millis(5));
        let second = clock.now();
        crate::assert_with_log!(
            second > first,
            "wall clock should advance across a sleep",
            true,
            second > first
        );
        crate::test_complete!("wall_clock_moves_forward");
    }

    // ---- TimerDriver ----

    #[test]
    fn driver_fires_expired_callbacks() {
        init_test("driver_fires_expired_callbacks");
        let clock = Arc::new(VirtualClock::new());
        let driver = TimerDriver::with_clock(Arc::clone(&clock));
        let fired = Arc::new(AtomicUsize::new(0));

        let _a = driver.register(Time::from_millis(10), counting_callback(&fired));
        let _b = driver.register(Time::from_millis(20), counting_callback(&fired));

        let early = driver.process_timers();
        crate::assert_with_log!(early == 0, "nothing should fire before the deadline", 0, early);

        clock.advance_to(Time::from_millis(15));
        let count = driver.process_timers();
        crate::assert_with_log!(count == 1, "first deadline should fire", 1, count);
        crate::assert_with_log!(
            fired.load(Ordering::SeqCst) == 1,
            "one callback should have run",
            1,
            fired.load(Ordering::SeqCst)
        );
        crate::assert_with_log!(
            driver.pending_count() == 1,
            "one timer should remain",
            1,
            driver.pending_count()
        );
        crate::test_complete!("driver_fires_expired_callbacks");
    }

    #[test]
    fn driver_cancel_prevents_fire() {
        init_test("driver_cancel_prevents_fire");
        let clock = Arc::new(VirtualClock::new());
        let driver = TimerDriver::with_clock(Arc::clone(&clock));
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = driver.register(Time::from_millis(10), counting_callback(&fired));
        let cancelled = driver.cancel(&handle);
        crate::assert_with_log!(cancelled, "cancel should report live timer", true, cancelled);

        clock.advance_to(Time::from_millis(20));
        let count = driver.process_timers();
        crate::assert_with_log!(count == 0, "cancelled timer should not fire", 0, count);
        crate::assert_with_log!(
            fired.load(Ordering::SeqCst) == 0,
            "callback should never run",
            0,
            fired.load(Ordering::SeqCst)
        );
        crate::test_complete!("driver_cancel_prevents_fire");
    }

    #[test]
    fn driver_next_deadline_tracks_earliest_live() {
        init_test("driver_next_deadline_tracks_earliest_live");
        let driver = TimerDriver::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let early = driver.register(Time::from_millis(5), counting_callback(&fired));
        let _late = driver.register(Time::from_millis(50), counting_callback(&fired));

        crate::assert_with_log!(
            driver.next_deadline() == Some(Time::from_millis(5)),
            "earliest deadline should be reported",
            Some(Time::from_millis(5)),
            driver.next_deadline()
        );
        let _ = driver.cancel(&early);
        crate::assert_with_log!(
            driver.next_deadline() == Some(Time::from_millis(50)),
            "cancelled head should be skipped",
            Some(Time::from_millis(50)),
            driver.next_deadline()
        );
        crate::test_complete!("driver_next_deadline_tracks_earliest_live");
    }

    #[test]
    fn callbacks_may_reenter_the_driver() {
        init_test("callbacks_may_reenter_the_driver");
        let clock = Arc::new(VirtualClock::new());
        let driver = Arc::new(TimerDriver::with_clock(Arc::clone(&clock)));
        let fired = Arc::new(AtomicUsize::new(0));

        let reentrant = {
            let driver = Arc::clone(&driver);
            let fired = Arc::clone(&fired);
            Box::new(move || {
                // Registering from inside a callback must not deadlock.
                let _ = driver.register(Time::from_millis(100), counting_callback(&fired));
            })
        };
        let _handle = driver.register(Time::from_millis(1), reentrant);

        clock.advance_to(Time::from_millis(1));
        let count = driver.process_timers();
        crate::assert_with_log!(count == 1, "reentrant callback should fire", 1, count);
        crate::assert_with_log!(
            driver.pending_count() == 1,
            "nested registration should be pending",
            1,
            driver.pending_count()
        );
        crate::test_complete!("callbacks_may_reenter_the_driver");
    }

    #[test]
    fn handle_shares_one_driver() {
        init_test("handle_shares_one_driver");
        let clock = Arc::new(VirtualClock::new());
        let handle = TimerDriverHandle::with_virtual_clock(Arc::clone(&clock));
        let clone = handle.clone();
        let fired = Arc::new(AtomicUsize::new(0));

        let _t = handle.register(Time::from_millis(3), counting_callback(&fired));
        crate::assert_with_log!(
            clone.pending_count() == 1,
            "clone should see the registration",
            1,
            clone.pending_count()
        );

        clock.advance_to(Time::from_millis(3));
        let count = clone.process_timers();
        crate::assert_with_log!(count == 1, "clone should fire the timer", 1, count);
        crate::test_complete!("handle_shares_one_driver");
    }
}
