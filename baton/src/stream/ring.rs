//! Bounded multi-producer single-consumer ring for stream submissions.
//!
//! Sequence-numbered slots (Vyukov's bounded queue, single consumer):
//!
//! - slot `i` starts with `seq = i`
//! - a producer owns position `pos` once `seq == pos` and it wins the CAS on
//!   `head`; it publishes with `seq = pos + 1`
//! - the consumer reads position `tail` when `seq == tail + 1` and frees the
//!   slot for the next lap with `seq = tail + N`
//!
//! Positions are claimed in CAS order, so items pop in the order their
//! producers reserved them.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct Slot<T> {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new(seq: usize) -> Self {
        Self {
            seq: AtomicUsize::new(seq),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

#[repr(align(64))]
struct Cursor(AtomicUsize);

pub(crate) struct Ring<T, const N: usize> {
    head: Cursor,
    tail: Cursor,
    slots: Box<[Slot<T>]>,
}

// SAFETY: a slot's value is touched by at most one side at a time, handed
// over through its seq number with Release/Acquire.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    const NON_EMPTY: () = assert!(N > 0, "ring capacity must be greater than 0");

    pub(crate) fn new() -> Self {
        let () = Self::NON_EMPTY;
        Self {
            head: Cursor(AtomicUsize::new(0)),
            tail: Cursor(AtomicUsize::new(0)),
            slots: (0..N).map(Slot::new).collect(),
        }
    }

    /// Enqueues `item`, or hands it back if every slot is occupied.
    ///
    /// Safe to call from any number of threads.
    pub(crate) fn push(&self, item: T) -> Result<(), T> {
        let mut pos = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos % N];
            let seq = slot.seq.load(Ordering::Acquire);
            let lag = seq.wrapping_sub(pos) as isize;

            if lag == 0 {
                match self.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS at seq == pos gives this
                        // producer sole ownership of the slot until it
                        // publishes below.
                        unsafe { (*slot.value.get()).write(item) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if lag < 0 {
                // The consumer has not freed this slot from the previous lap.
                return Err(item);
            } else {
                pos = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest item.
    ///
    /// # Safety
    ///
    /// At most one thread may pop at a time.
    pub(crate) unsafe fn pop(&self) -> Option<T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail % N];

        if slot.seq.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: seq == tail + 1 means the producer finished writing and,
        // per the caller contract, no other consumer is reading this slot.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq.store(tail.wrapping_add(N), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Relaxed);
        Some(item)
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // SAFETY: &mut self rules out every other consumer.
        while let Some(item) = unsafe { self.pop() } {
            drop(item);
        }
    }
}
