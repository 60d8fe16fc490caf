#![allow(unsafe_op_in_unsafe_fn)]

//! Asynchronous coordination primitives for multi-producer single-consumer
//! pipelines.
//!
//! The crate provides three building blocks which share one waiter-queue
//! core:
//!
//! - [`AsyncSemaphore`], a fair counting semaphore whose acquisitions are
//!   futures. Waiters may request multiple permits at once and are served in
//!   strict FIFO order regardless of request size.
//! - [`AsyncQueue`], an unbounded mpsc value queue. Sends always complete
//!   immediately; the consumer side is asynchronous and observes a graceful
//!   end of iteration after the queue is terminated and drained.
//! - [`BoundedAsyncQueue`], a bounded variant which applies backpressure by
//!   gating sends through a semaphore, and whose termination is itself a
//!   future that settles once every accepted item has been consumed.
//!
//! None of the primitives block a thread and none of them own threads or
//! tasks. Wakeups happen inline on whatever thread performs the operation
//! that makes progress possible, such as a send or a permit release. The
//! futures are lazy in the usual Rust sense: an operation takes its place in
//! line when the future is created, but its effect on the queue state happens
//! when the future is polled to completion. Dropping a future before it
//! resolves cancels the operation and can never lose a value or leak a
//! permit.
//!
//! Timeouts are deliberately not built in; race any returned future against a
//! timer of your choice and drop it on loss.

#[allow(unused_imports)]
#[macro_use]
extern crate tracing;

mod bounded;
mod queue;
mod seg_buf;
mod semaphore;
mod waiters;

#[cfg(test)]
mod test_util;

pub use crate::bounded::BoundedAsyncQueue;
pub use crate::queue::AsyncQueue;
pub use crate::semaphore::AsyncSemaphore;

/// Future types
pub mod future {
    pub use crate::bounded::{RecvFut as BoundedRecvFut, SendFut, TerminateFut};
    pub use crate::queue::RecvFut;
    pub use crate::semaphore::AcquireFut;
}
