//! A fair asynchronous counting semaphore.

use crate::waiters::{Waiter, WaiterQueue};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// An asynchronous counting semaphore with strictly fair, multi-permit
/// acquisition.
///
/// The semaphore maintains a ledger of available permits. [`acquire`]
/// reserves a number of permits, returning a future that resolves once the
/// reservation is complete; [`release`] returns permits to the ledger.
/// Acquisitions are all-or-nothing: a request for `n` permits never consumes
/// fewer than `n`, and a request that cannot be satisfied immediately joins a
/// FIFO queue of waiters.
///
/// Fairness is strict: while any waiter is queued, no later request is
/// granted before it, regardless of how many permits either wants. A single
/// queued request for many permits therefore holds up later small requests
/// until enough permits accumulate, which is what makes large acquisitions
/// possible at all under contention.
///
/// Handles are cheap to clone and all clones operate on the same ledger.
///
/// An [`AcquireFut`] takes its place in line when it is created, but permits
/// are only deducted when the future completes. Dropping the future before
/// that cancels the request: it leaves the queue without having consumed
/// anything, and the next waiter in line is notified. Like the queue futures
/// in this crate, an `AcquireFut` must either be polled to completion or
/// dropped; a future that is neither polled nor dropped can stall the
/// waiters behind it.
///
/// [`acquire`]: Self::acquire
/// [`release`]: Self::release
pub struct AsyncSemaphore(Arc<Shared>);

struct Shared {
    lockable: Mutex<Lockable>,
}

struct Lockable {
    // permits currently available for granting.
    available: usize,
    // fifo of pending acquisitions.
    waiters: WaiterQueue,
}

impl AsyncSemaphore {
    /// Create a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        AsyncSemaphore(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                available: permits,
                waiters: WaiterQueue::new(),
            }),
        }))
    }

    /// Reserve `permits` permits, waiting until they are available.
    ///
    /// If no waiter is queued and enough permits are available, they are
    /// deducted immediately and the returned future resolves on its first
    /// poll. Otherwise the request joins the waiter queue; its position is
    /// fixed now, by this call, not by when the future is first polled.
    ///
    /// `permits` may be zero; a zero-permit acquisition still respects queue
    /// order.
    pub fn acquire(&self, permits: usize) -> AcquireFut {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        let progress = if state.waiters.is_empty() && state.available >= permits {
            state.available -= permits;
            Progress::Granted
        } else {
            Progress::Waiting(state.waiters.push_back())
        };
        drop(lock);
        AcquireFut {
            sem: self.clone(),
            permits,
            progress,
        }
    }

    /// Reserve `permits` permits only if that is possible without waiting.
    ///
    /// Fails whenever any waiter is queued, even if enough permits are
    /// available, since granting them would bypass the queue.
    pub fn try_acquire(&self, permits: usize) -> bool {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        if state.waiters.is_empty() && state.available >= permits {
            state.available -= permits;
            true
        } else {
            false
        }
    }

    /// Return `permits` permits to the ledger and notify the front waiter.
    ///
    /// Releasing more permits than were ever acquired is allowed and simply
    /// grows the ledger; the ledger saturates at `usize::MAX` rather than
    /// wrapping.
    pub fn release(&self, permits: usize) {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        state.available = state.available.saturating_add(permits);
        state.waiters.wake_front();
    }

    /// Take every currently available permit, returning how many were taken.
    ///
    /// Never waits and never joins the queue. Intended for shutdown paths
    /// that want to stop further grants.
    pub fn drain_permits(&self) -> usize {
        let mut lock = self.0.lockable.lock().unwrap();
        let drained = mem::replace(&mut lock.available, 0);
        trace!(drained, "semaphore permits drained");
        drained
    }

    /// The number of permits currently available.
    pub fn available_permits(&self) -> usize {
        self.0.lockable.lock().unwrap().available
    }

    /// The number of acquisitions currently waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.0.lockable.lock().unwrap().waiters.len()
    }

    // whether no acquisition is queued and at least `permits` permits are
    // home. used by the bounded queue to detect that it has drained.
    pub(crate) fn is_idle(&self, permits: usize) -> bool {
        let lock = self.0.lockable.lock().unwrap();
        lock.waiters.is_empty() && lock.available >= permits
    }
}

impl Clone for AsyncSemaphore {
    fn clone(&self) -> Self {
        AsyncSemaphore(Arc::clone(&self.0))
    }
}

/// Future for [`AsyncSemaphore::acquire`].
///
/// Resolves to `()` once the requested permits have been deducted from the
/// ledger. Dropping the future before it resolves cancels the request
/// without consuming any permits.
///
/// Panics if polled again after resolving.
pub struct AcquireFut {
    sem: AsyncSemaphore,
    permits: usize,
    progress: Progress,
}

enum Progress {
    // permits were deducted eagerly when the future was created.
    Granted,
    // queued; permits are claimed during poll once this waiter is at the
    // front and the ledger suffices.
    Waiting(Waiter),
    Done,
}

impl Future for AcquireFut {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        match &mut this.progress {
            Progress::Granted => {}
            Progress::Waiting(waiter) => {
                let mut lock = this.sem.0.lockable.lock().unwrap();
                let state = &mut *lock;
                unsafe {
                    if !state.waiters.is_front(waiter) || state.available < this.permits {
                        state.waiters.record_waker(waiter, cx.waker());
                        return Poll::Pending;
                    }
                    state.available -= this.permits;
                    // unlinking hands the turn (and any leftover permits) to
                    // the next waiter in line.
                    state.waiters.unlink(waiter);
                }
            }
            Progress::Done => panic!("AcquireFut polled after completion"),
        }
        this.progress = Progress::Done;
        Poll::Ready(())
    }
}

impl Drop for AcquireFut {
    fn drop(&mut self) {
        match &mut self.progress {
            Progress::Granted => {
                // the grant was never observed; put the permits back.
                self.sem.release(self.permits);
            }
            Progress::Waiting(waiter) => {
                let mut lock = self.sem.0.lockable.lock().unwrap();
                unsafe { lock.waiters.unlink(waiter) };
            }
            Progress::Done => {}
        }
    }
}
