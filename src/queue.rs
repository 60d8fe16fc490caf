//! The unbounded mpsc value queue.
//!
//! Architecture: a handle wraps `Arc<Mutex<shared state>>`. The shared state
//! holds the buffered elements in a segment queue and a waiter queue of
//! pending receive futures. Senders push under the lock and wake the front
//! receive waiter when the buffer becomes non-empty; a receive future claims
//! an element only once it is at the front of the waiter queue, which is what
//! makes delivery strictly FIFO among receive futures. Termination is a
//! sticky flag: it rejects further sends immediately, while elements buffered
//! before the flag was set remain consumable.

use crate::seg_buf::SegBuf;
use crate::waiters::{Waiter, WaiterQueue};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// An unbounded multi-producer single-consumer queue with an asynchronous
/// consumer side.
///
/// Any number of senders may [`send`] concurrently; sends are synchronous and
/// never wait. The consuming side, [`recv`] and [`try_recv`], is meant to
/// be driven by a single consumer. Because the queue is unbounded, senders
/// that outpace the consumer grow the buffer without limit; use
/// [`BoundedAsyncQueue`](crate::BoundedAsyncQueue) where that matters.
///
/// The queue is ended by [`terminate`], callable from either side and
/// idempotent. After termination every `send` returns `false`, and once the
/// values sent before termination have been consumed, `recv` resolves to
/// `None`.
///
/// Handles are cheap to clone and all clones refer to the same queue.
///
/// [`send`]: Self::send
/// [`recv`]: Self::recv
/// [`try_recv`]: Self::try_recv
/// [`terminate`]: Self::terminate
pub struct AsyncQueue<T>(Arc<Shared<T>>);

struct Shared<T> {
    lockable: Mutex<Lockable<T>>,
}

struct Lockable<T> {
    // buffered elements.
    elems: SegBuf<T>,
    // fifo of pending receive futures.
    recv_waiters: WaiterQueue,
    // sticky; set once, never cleared.
    terminated: bool,
}

impl<T> AsyncQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        AsyncQueue(Arc::new(Shared {
            lockable: Mutex::new(Lockable {
                elems: SegBuf::new(),
                recv_waiters: WaiterQueue::new(),
                terminated: false,
            }),
        }))
    }

    /// Send a value into the queue.
    ///
    /// Always completes immediately. Returns `true` if the value was
    /// accepted, `false` if the queue has been terminated (in which case the
    /// value is dropped).
    pub fn send(&self, item: T) -> bool {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        if state.terminated {
            return false;
        }
        state.elems.push(item);
        if state.elems.len() == 1 {
            state.recv_waiters.wake_front();
        }
        true
    }

    /// Receive the next value, waiting until one is available.
    ///
    /// The returned future resolves to `Some(value)`, or to `None` once the
    /// queue has been terminated and drained. Receive futures are served in
    /// the order they were created by this call; dropping one before it
    /// resolves gives its place up to the next.
    pub fn recv(&self) -> RecvFut<T> {
        let waiter = self.0.lockable.lock().unwrap().recv_waiters.push_back();
        RecvFut {
            queue: self.clone(),
            waiter,
        }
    }

    /// Take the next value if one is ready right now.
    ///
    /// Returns `None` both when the queue is transiently empty and when it
    /// has been terminated and drained; use [`recv`](Self::recv) to tell the
    /// two apart. While any receive future is pending this also returns
    /// `None`, since buffered values belong to those futures in creation
    /// order. Like all consuming operations, this is intended for a single
    /// consumer.
    pub fn try_recv(&self) -> Option<T> {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        if !state.recv_waiters.is_empty() {
            return None;
        }
        state.elems.pop()
    }

    /// Terminate the queue, disabling [`send`](Self::send).
    ///
    /// Values sent before termination remain consumable; pending and future
    /// receives observe `None` once the buffer is drained. Calling this more
    /// than once has no further effect.
    pub fn terminate(&self) {
        let mut lock = self.0.lockable.lock().unwrap();
        let state = &mut *lock;
        if !state.terminated {
            state.terminated = true;
            trace!(
                buffered = state.elems.len(),
                waiting = state.recv_waiters.len(),
                "queue terminated"
            );
            state.recv_waiters.wake_all();
        }
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.0.lockable.lock().unwrap().terminated
    }
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        AsyncQueue(Arc::clone(&self.0))
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future for [`AsyncQueue::recv`].
///
/// Resolves to `None` if the queue was terminated and all values sent before
/// that have been taken.
///
/// Panics if polled again after resolving.
pub struct RecvFut<T> {
    queue: AsyncQueue<T>,
    waiter: Waiter,
}

impl<T> Future for RecvFut<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
        let this = self.get_mut();
        assert!(
            !this.waiter.is_removed(),
            "RecvFut polled after completion"
        );
        let mut lock = this.queue.0.lockable.lock().unwrap();
        let state = &mut *lock;
        unsafe {
            if !state.recv_waiters.is_front(&this.waiter) {
                state.recv_waiters.record_waker(&mut this.waiter, cx.waker());
                return Poll::Pending;
            }
            if let Some(item) = state.elems.pop() {
                // unlinking wakes the next receive future, which either
                // claims the next element or re-registers.
                state.recv_waiters.unlink(&mut this.waiter);
                Poll::Ready(Some(item))
            } else if state.terminated {
                state.recv_waiters.unlink(&mut this.waiter);
                Poll::Ready(None)
            } else {
                state.recv_waiters.record_waker(&mut this.waiter, cx.waker());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for RecvFut<T> {
    fn drop(&mut self) {
        if !self.waiter.is_removed() {
            let mut lock = self.queue.0.lockable.lock().unwrap();
            unsafe { lock.recv_waiters.unlink(&mut self.waiter) };
        }
    }
}
