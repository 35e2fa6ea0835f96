//! Close-once broadcast signal.
//!
//! A `ClosingSignal` is the observable half of cancellation: it starts open,
//! closes exactly once, and never reopens. Any number of observers may hold a
//! reference and wait for the close, either as a future or by blocking the
//! current thread.
//!
//! # Identity
//!
//! A scope hands out the *same* signal allocation for its entire life, so
//! observers may compare signals by pointer to decide whether two handles
//! view the same scope. Scopes that can never be cancelled return no signal
//! at all, and scopes that are born already cancelled share one static
//! pre-closed allocation.
//!
//! # Ordering
//!
//! `close` publishes with release semantics and `is_closed` reads with
//! acquire semantics, so state written before a close (the scope's error) is
//! visible to any observer that sees the signal closed.

use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::task::{Context, Poll, Waker};

static PRE_CLOSED: LazyLock<Arc<ClosingSignal>> =
    LazyLock::new(|| Arc::new(ClosingSignal::new_closed()));

/// A one-shot broadcast flag with registered wakers.
#[derive(Debug)]
pub struct ClosingSignal {
    /// Set once by `close`; never cleared.
    closed: AtomicBool,
    /// Wakers parked until the close. Keys are stable while the waiter
    /// holds them; a waiter removes its own key, or the close drains all.
    waiters: Mutex<Slab<Waker>>,
}

impl ClosingSignal {
    /// Creates a new open signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            waiters: Mutex::new(Slab::new()),
        }
    }

    /// Creates a signal that is already closed.
    #[must_use]
    fn new_closed() -> Self {
        Self {
            closed: AtomicBool::new(true),
            waiters: Mutex::new(Slab::new()),
        }
    }

    /// Returns the shared signal that has been closed since process start.
    ///
    /// Scopes born past their deadline, and scopes whose done signal is
    /// first requested after cancellation, all hand out this allocation.
    #[must_use]
    pub fn pre_closed() -> Arc<Self> {
        Arc::clone(&PRE_CLOSED)
    }

    /// Returns true once the signal has closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the signal and wakes every registered waiter.
    ///
    /// Later calls are no-ops. Wakers run after the waiter lock is
    /// released, so a waker is free to take it again.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let woken: SmallVec<[Waker; 4]> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().collect()
        };
        for waker in woken {
            waker.wake();
        }
    }

    /// Returns a future that resolves once the signal closes.
    ///
    /// Resolves immediately if the signal is already closed. Dropping the
    /// future before completion deregisters its waker.
    #[must_use]
    pub fn wait(&self) -> Closed<'_> {
        Closed {
            signal: self,
            key: None,
        }
    }

    /// Blocks the current thread until the signal closes.
    pub fn wait_blocking(&self) {
        futures_lite::future::block_on(self.wait());
    }

    /// Number of currently parked waiters.
    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for ClosingSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`ClosingSignal::wait`].
#[derive(Debug)]
pub struct Closed<'a> {
    signal: &'a ClosingSignal,
    key: Option<usize>,
}

impl Future for Closed<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_closed() {
            self.key = None;
            return Poll::Ready(());
        }

        let mut waiters = self.signal.waiters.lock();
        // Re-check under the lock: `close` drains the slab while holding
        // it, so a registration here either lands before the drain or
        // observes the closed flag.
        if self.signal.closed.load(Ordering::Acquire) {
            drop(waiters);
            self.key = None;
            return Poll::Ready(());
        }

        match self.key {
            Some(key) => {
                if let Some(slot) = waiters.get_mut(key) {
                    slot.clone_from(cx.waker());
                } else {
                    // Close drains the slab only after setting the flag,
                    // so a live key survives the check above. Re-register
                    // anyway rather than assume the slot.
                    self.key = Some(waiters.insert(cx.waker().clone()));
                }
            }
            None => {
                self.key = Some(waiters.insert(cx.waker().clone()));
            }
        }
        Poll::Pending
    }
}

impl Drop for Closed<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut waiters = self.signal.waiters.lock();
            if waiters.contains(key) {
                waiters.remove(key);
            }
        }
    }
}
