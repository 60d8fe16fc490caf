// segmented fifo buffer backing the value queues.
//
// elements live in fixed-capacity ring segments that are allocated and freed
// as the queue grows and shrinks, so memory usage tracks the number of queued
// elements in both directions. one empty segment is kept as a spare, which
// prevents repeated allocation when the length fluctuates around a segment
// boundary.

use std::collections::VecDeque;
use std::mem::{size_of, MaybeUninit};

// target byte size of one segment's element array.
const SEG_BYTES: usize = 1024;

// elements per segment for an element type of the given size.
const fn seg_cap(elem_size: usize) -> usize {
    if elem_size == 0 {
        // ZSTs occupy no storage; the capacity only bounds per-segment
        // bookkeeping.
        SEG_BYTES
    } else if elem_size >= SEG_BYTES {
        1
    } else {
        SEG_BYTES / elem_size
    }
}

pub(crate) struct SegBuf<T> {
    len: usize,
    // invariant: no linked segment is empty
    segs: VecDeque<Seg<T>>,
    spare: Option<Seg<T>>,
}

struct Seg<T> {
    slots: Box<[MaybeUninit<T>]>,
    // if len > 0, the front element is slots[start]; start < slots.len()
    start: usize,
    // initialized elements starting at start, wrapping around
    len: usize,
}

impl<T> Seg<T> {
    fn new() -> Self {
        let cap = seg_cap(size_of::<T>());
        Seg {
            slots: (0..cap).map(|_| MaybeUninit::uninit()).collect(),
            start: 0,
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn push(&mut self, item: T) {
        debug_assert!(!self.is_full());
        let idx = (self.start + self.len) % self.slots.len();
        self.slots[idx].write(item);
        self.len += 1;
    }

    fn pop(&mut self) -> T {
        debug_assert!(!self.is_empty());
        // safety: slots[start] holds the front element while len > 0, and the
        // slot is vacated before start moves past it.
        let item = unsafe { self.slots[self.start].assume_init_read() };
        self.start = (self.start + 1) % self.slots.len();
        self.len -= 1;
        item
    }
}

impl<T> SegBuf<T> {
    pub(crate) fn new() -> Self {
        SegBuf {
            len: 0,
            segs: VecDeque::new(),
            spare: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn push(&mut self, item: T) {
        if self.segs.back().map_or(true, Seg::is_full) {
            let seg = self.spare.take().unwrap_or_else(Seg::new);
            debug_assert!(seg.is_empty());
            self.segs.push_back(seg);
        }
        self.segs.back_mut().unwrap().push(item);
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        let front = self.segs.front_mut()?;
        let item = front.pop();
        self.len -= 1;
        if front.is_empty() {
            let seg = self.segs.pop_front().unwrap();
            if self.spare.is_none() {
                self.spare = Some(seg);
            }
        }
        Some(item)
    }
}

impl<T> Drop for SegBuf<T> {
    fn drop(&mut self) {
        // pop everything so the elements are dropped; the segment boxes
        // themselves hold only MaybeUninit slots afterwards.
        while self.pop().is_some() {}
    }
}
