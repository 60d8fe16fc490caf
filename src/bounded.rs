//! The bounded mpsc queue with backpressure.
//!
//! A bounded queue is the composition of two other primitives in this crate:
//! an unbounded [`AsyncQueue`] carrying the values and an [`AsyncSemaphore`]
//! holding one permit per unit of capacity. A send reserves a permit before
//! pushing, and the consumer returns the permit after taking a value, so at
//! most `capacity` accepted values are in flight at any time and senders are
//! admitted in strict FIFO order.
//!
//! Termination rides on the same permit ledger: once the sticky terminated
//! flag is set, no new reservation can be queued, so the moment the semaphore
//! is idle again (no queued sends, every permit back home) every accepted
//! value has been consumed. That is when the inner queue is terminated (so
//! the consumer observes the end of iteration) and the termination futures
//! resolve.

use crate::queue::{self, AsyncQueue};
use crate::semaphore::{AcquireFut, AsyncSemaphore};
use smallvec::SmallVec;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A bounded multi-producer single-consumer queue which applies backpressure
/// to senders.
///
/// Up to `capacity` accepted-but-unconsumed values may exist at a time. A
/// [`send`] resolves to `true` once the value has been accepted and the queue
/// is willing to take another message from this sender; respecting
/// backpressure means awaiting that future before sending again. Sends whose
/// futures are pending keep their place in line, so admission is fair.
///
/// [`terminate`] closes the queue for new sends at once, but sends already
/// waiting for capacity still go through; the future it returns resolves
/// after every accepted value has been consumed, at which point the consumer
/// observes the end of iteration.
///
/// Handles are cheap to clone and all clones refer to the same queue.
///
/// [`send`]: Self::send
/// [`terminate`]: Self::terminate
pub struct BoundedAsyncQueue<T>(Arc<Shared<T>>);

struct Shared<T> {
    // value channel; unbounded on its own, bounded here by the gate.
    inner: AsyncQueue<T>,
    // send-side gate, one permit per unit of capacity.
    gate: AsyncSemaphore,
    capacity: usize,
    shutdown: Mutex<Shutdown>,
}

struct Shutdown {
    // sticky; new sends are rejected once set.
    terminated: bool,
    // sticky; set once the queue is terminated and fully drained.
    finished: bool,
    // wakers of termination futures awaiting the drain, keyed per future so
    // that a future dropped while pending can unregister exactly its own
    // entry.
    drain_wakers: SmallVec<[(u64, Waker); 2]>,
    // id source for drain_wakers entries.
    next_drain_id: u64,
}

impl<T> BoundedAsyncQueue<T> {
    /// Create a queue admitting up to `capacity` unconsumed values.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");
        BoundedAsyncQueue(Arc::new(Shared {
            inner: AsyncQueue::new(),
            gate: AsyncSemaphore::new(capacity),
            capacity,
            shutdown: Mutex::new(Shutdown {
                terminated: false,
                finished: false,
                drain_wakers: SmallVec::new(),
                next_drain_id: 0,
            }),
        }))
    }

    /// The maximum number of accepted-but-unconsumed values.
    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Send a value, waiting for capacity.
    ///
    /// The returned future resolves to `true` once the value has been
    /// accepted, or to `false` if the queue was terminated before this call.
    /// A send that is already waiting for capacity when the queue is
    /// terminated is still accepted once capacity frees up.
    pub fn send(&self, item: T) -> SendFut<T> {
        let rejected = self.0.shutdown.lock().unwrap().terminated;
        let progress = if rejected {
            Progress::Rejected
        } else {
            // the reservation takes its place in the gate's queue now, which
            // is what keeps it ahead of a later terminate
            Progress::Acquiring(self.0.gate.acquire(1))
        };
        SendFut {
            shared: Arc::clone(&self.0),
            item: Some(item),
            progress,
        }
    }

    /// Receive the next value, waiting until one is available.
    ///
    /// Resolves to `None` once the queue has been terminated and drained.
    /// Consuming a value frees one unit of capacity for senders.
    pub fn recv(&self) -> RecvFut<T> {
        RecvFut {
            shared: Arc::clone(&self.0),
            inner: self.0.inner.recv(),
        }
    }

    /// Take the next value if one is ready right now.
    ///
    /// Returns `None` both when the queue is transiently empty and when it
    /// has been terminated and drained; use [`recv`](Self::recv) to tell the
    /// two apart.
    pub fn try_recv(&self) -> Option<T> {
        let item = self.0.inner.try_recv();
        if item.is_some() {
            self.0.gate.release(1);
            self.0.maybe_finish();
        }
        item
    }

    /// Terminate the queue, rejecting all subsequent sends.
    ///
    /// Sends already waiting for capacity are unaffected and will still be
    /// accepted. The returned future resolves once every accepted value has
    /// been consumed; at that point the consumer observes the end of
    /// iteration. Termination is idempotent, and every call returns a future
    /// observing the same drain.
    pub fn terminate(&self) -> TerminateFut<T> {
        {
            let mut shutdown = self.0.shutdown.lock().unwrap();
            if !shutdown.terminated {
                shutdown.terminated = true;
                trace!("bounded queue terminated");
            }
        }
        self.0.maybe_finish();
        TerminateFut {
            shared: Arc::clone(&self.0),
            slot: None,
        }
    }
}

impl<T> Shared<T> {
    // terminate the inner queue and settle the termination futures if the
    // queue is terminated and every accepted value has been consumed.
    //
    // called after every event that could complete the drain: a permit
    // release, a cancelled send, the terminate call itself.
    fn maybe_finish(&self) {
        {
            let shutdown = self.shutdown.lock().unwrap();
            if !shutdown.terminated || shutdown.finished {
                return;
            }
        }
        if !self.gate.is_idle(self.capacity) {
            return;
        }
        self.inner.terminate();
        let wakers = {
            let mut shutdown = self.shutdown.lock().unwrap();
            if shutdown.finished {
                return;
            }
            shutdown.finished = true;
            mem::take(&mut shutdown.drain_wakers)
        };
        debug!("bounded queue drained");
        for (_, waker) in wakers {
            waker.wake();
        }
    }
}

impl<T> Clone for BoundedAsyncQueue<T> {
    fn clone(&self) -> Self {
        BoundedAsyncQueue(Arc::clone(&self.0))
    }
}

/// Future for [`BoundedAsyncQueue::send`].
///
/// Resolves to `true` once the value has been accepted, `false` if the queue
/// was already terminated. Until it resolves, the value can be taken back
/// with [`cancel`](Self::cancel); dropping the future has the same effect,
/// except the value is dropped with it.
///
/// Panics if polled again after resolving.
pub struct SendFut<T> {
    shared: Arc<Shared<T>>,
    item: Option<T>,
    progress: Progress,
}

enum Progress {
    // the queue was already terminated when the send was created.
    Rejected,
    // waiting on the gate for one permit.
    Acquiring(AcquireFut),
    Done,
}

impl<T> SendFut<T> {
    /// Abort this send if it has not resolved yet, giving back the value.
    ///
    /// Returns `Some` if and only if the future has not resolved; the send
    /// then has no effect on the queue. Attempting to poll the future
    /// afterwards panics.
    pub fn cancel(&mut self) -> Option<T> {
        match mem::replace(&mut self.progress, Progress::Done) {
            Progress::Acquiring(acquire) => {
                // dropping the reservation unlinks it (or returns an
                // already-deducted permit); that can be the drain's last
                // obstacle
                drop(acquire);
                self.shared.maybe_finish();
                self.item.take()
            }
            Progress::Rejected => self.item.take(),
            Progress::Done => None,
        }
    }
}

impl<T> Future for SendFut<T> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<bool> {
        let this = unsafe { self.get_unchecked_mut() };
        match &mut this.progress {
            Progress::Rejected => {}
            Progress::Acquiring(acquire) => {
                match Pin::new(acquire).poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        let item = this.item.take().expect("SendFut polled after completion");
                        if this.shared.inner.send(item) {
                            this.progress = Progress::Done;
                            return Poll::Ready(true);
                        }
                        // the inner queue terminated while we held the
                        // permit; give it back
                        this.shared.gate.release(1);
                        this.shared.maybe_finish();
                    }
                }
            }
            Progress::Done => panic!("SendFut polled after completion"),
        }
        this.item = None;
        this.progress = Progress::Done;
        Poll::Ready(false)
    }
}

impl<T> Drop for SendFut<T> {
    fn drop(&mut self) {
        if !matches!(self.progress, Progress::Done) {
            self.cancel();
        }
    }
}

/// Future for [`BoundedAsyncQueue::recv`].
///
/// Resolves to `None` once the queue has been terminated and drained.
///
/// Panics if polled again after resolving.
pub struct RecvFut<T> {
    shared: Arc<Shared<T>>,
    inner: queue::RecvFut<T>,
}

impl<T> Future for RecvFut<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<T>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll(cx) {
            Poll::Ready(Some(item)) => {
                // the value is out; hand its permit back to the senders
                this.shared.gate.release(1);
                this.shared.maybe_finish();
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future for [`BoundedAsyncQueue::terminate`].
///
/// Resolves once every value accepted before termination has been consumed.
/// All termination futures for one queue observe the same event, and the
/// drain completes whether or not any of them is polled; dropping one while
/// pending only stops it observing.
pub struct TerminateFut<T> {
    shared: Arc<Shared<T>>,
    // id of this future's drain_wakers entry, once it has registered one.
    slot: Option<u64>,
}

impl<T> Future for TerminateFut<T> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = self.get_mut();
        let mut shutdown = this.shared.shutdown.lock().unwrap();
        if shutdown.finished {
            return Poll::Ready(());
        }
        if let Some(id) = this.slot {
            if let Some((_, waker)) = shutdown
                .drain_wakers
                .iter_mut()
                .find(|(slot, _)| *slot == id)
            {
                *waker = cx.waker().clone();
                return Poll::Pending;
            }
        }
        let id = shutdown.next_drain_id;
        shutdown.next_drain_id += 1;
        this.slot = Some(id);
        shutdown.drain_wakers.push((id, cx.waker().clone()));
        Poll::Pending
    }
}

impl<T> Drop for TerminateFut<T> {
    fn drop(&mut self) {
        // a future dropped while pending takes its registration with it; the
        // drain itself is unaffected.
        if let Some(id) = self.slot {
            let mut shutdown = self.shared.shutdown.lock().unwrap();
            if let Some(pos) = shutdown
                .drain_wakers
                .iter()
                .position(|(slot, _)| *slot == id)
            {
                shutdown.drain_wakers.swap_remove(pos);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{assert_ready, poll_once, WakeCounter};

    #[test]
    #[should_panic(expected = "capacity must be positive")]
    fn zero_capacity_is_rejected() {
        let _ = BoundedAsyncQueue::<i32>::new(0);
    }

    #[test]
    fn sends_beyond_capacity_wait_for_the_consumer() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(5);

        let mut sends: Vec<_> = (0..10).map(|i| queue.send(i)).collect();
        for send in &mut sends[..5] {
            assert!(assert_ready(send, &waker));
        }
        for send in &mut sends[5..] {
            assert!(poll_once(send, &waker).is_pending());
        }

        // each consumed value admits exactly the next waiting send
        for i in 0..5 {
            let mut recv = queue.recv();
            assert_eq!(assert_ready(&mut recv, &waker), Some(i));
            assert!(assert_ready(&mut sends[5 + i as usize], &waker));
            for send in &mut sends[6 + i as usize..] {
                assert!(poll_once(send, &waker).is_pending());
            }
        }
        for i in 5..10 {
            let mut recv = queue.recv();
            assert_eq!(assert_ready(&mut recv, &waker), Some(i));
        }
    }

    #[test]
    fn terminate_settles_after_the_queue_drains() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(5);

        let mut sends: Vec<_> = (0..10).map(|i| queue.send(i)).collect();
        for send in &mut sends[..5] {
            assert!(assert_ready(send, &waker));
        }
        for send in &mut sends[5..] {
            assert!(poll_once(send, &waker).is_pending());
        }

        let mut terminate = queue.terminate();
        assert!(poll_once(&mut terminate, &waker).is_pending());

        // a send after terminate is rejected outright
        let mut late = queue.send(99);
        assert!(!assert_ready(&mut late, &waker));

        // sends that were already waiting still complete as capacity frees up
        for i in 0..10 {
            let mut recv = queue.recv();
            assert_eq!(assert_ready(&mut recv, &waker), Some(i));
            if i < 5 {
                assert!(assert_ready(&mut sends[5 + i as usize], &waker));
            }
            if i < 9 {
                assert!(poll_once(&mut terminate, &waker).is_pending());
            }
        }

        let mut recv = queue.recv();
        assert_eq!(assert_ready(&mut recv, &waker), None);
        assert_ready(&mut terminate, &waker);

        // later terminations observe the same settled drain
        let mut again = queue.terminate();
        assert_ready(&mut again, &waker);
    }

    #[test]
    fn terminate_on_an_idle_queue_settles_immediately() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::<i32>::new(3);

        let mut terminate = queue.terminate();
        assert_ready(&mut terminate, &waker);

        let mut recv = queue.recv();
        assert_eq!(assert_ready(&mut recv, &waker), None);
        let mut send = queue.send(1);
        assert!(!assert_ready(&mut send, &waker));
    }

    #[test]
    fn cancelled_send_returns_the_value_and_frees_its_place() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(1);

        let mut accepted = queue.send(10);
        assert!(assert_ready(&mut accepted, &waker));
        let mut blocked = queue.send(20);
        assert!(poll_once(&mut blocked, &waker).is_pending());

        assert_eq!(blocked.cancel(), Some(20));
        assert_eq!(blocked.cancel(), None);

        assert_eq!(queue.try_recv(), Some(10));
        // with the cancelled send out of the line, capacity is free again
        let mut next = queue.send(30);
        assert!(assert_ready(&mut next, &waker));
    }

    #[test]
    fn dropping_a_waiting_send_can_complete_the_drain() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(1);

        let mut accepted = queue.send(1);
        assert!(assert_ready(&mut accepted, &waker));
        let mut blocked = queue.send(2);
        assert!(poll_once(&mut blocked, &waker).is_pending());

        let mut terminate = queue.terminate();
        assert!(poll_once(&mut terminate, &waker).is_pending());

        // the waiting send gives up; one accepted value still in flight
        drop(blocked);
        assert!(poll_once(&mut terminate, &waker).is_pending());

        let mut recv = queue.recv();
        assert_eq!(assert_ready(&mut recv, &waker), Some(1));
        assert_ready(&mut terminate, &waker);

        let mut recv = queue.recv();
        assert_eq!(assert_ready(&mut recv, &waker), None);
    }

    #[test]
    fn dropping_a_pending_terminate_future_unregisters_it() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(1);

        let mut accepted = queue.send(1);
        assert!(assert_ready(&mut accepted, &waker));

        // two observers of the same drain, polled with the same waker
        let mut abandoned = queue.terminate();
        let mut kept = queue.terminate();
        assert!(poll_once(&mut abandoned, &waker).is_pending());
        assert!(poll_once(&mut kept, &waker).is_pending());

        drop(abandoned);

        // the kept future still observes the drain
        let woken_before = counter.count();
        assert_eq!(queue.try_recv(), Some(1));
        assert_eq!(counter.count(), woken_before + 1);
        assert_ready(&mut kept, &waker);

        let mut recv = queue.recv();
        assert_eq!(assert_ready(&mut recv, &waker), None);
    }

    #[test]
    fn at_most_capacity_values_are_in_flight() {
        let counter = WakeCounter::new();
        let waker = counter.waker();
        let queue = BoundedAsyncQueue::new(3);

        let mut sends: Vec<_> = (0..8).map(|i| queue.send(i)).collect();
        let mut accepted = 0;
        for send in &mut sends {
            if poll_once(send, &waker).is_ready() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);

        assert_eq!(queue.try_recv(), Some(0));
        assert_eq!(queue.try_recv(), Some(1));
        // consuming two values admits exactly two more sends
        let mut newly_accepted = 0;
        for send in &mut sends[3..] {
            if poll_once(send, &waker).is_ready() {
                newly_accepted += 1;
            }
        }
        assert_eq!(newly_accepted, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn backpressured_stress_delivers_everything() {
        const SENDERS: u64 = 4;
        const PER_SENDER: u64 = 500;

        let queue = BoundedAsyncQueue::new(4);

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut last: [Option<u64>; SENDERS as usize] = [None; SENDERS as usize];
                let mut received = 0u64;
                while let Some((sender, i)) = queue.recv().await {
                    let prev = &mut last[sender as usize];
                    assert!(prev.map_or(true, |p| p < i));
                    *prev = Some(i);
                    received += 1;
                }
                received
            })
        };

        let mut senders = Vec::new();
        for sender in 0..SENDERS {
            let queue = queue.clone();
            senders.push(tokio::spawn(async move {
                for i in 0..PER_SENDER {
                    assert!(queue.send((sender, i)).await);
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        queue.terminate().await;
        assert_eq!(consumer.await.unwrap(), SENDERS * PER_SENDER);
    }
}
