//! Bounded single-producer/single-consumer ring.
//!
//! Both cursors run freely and are reduced with `& mask` on access, so
//! `put - get` is always the number of unread records, even across wraparound.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Shared<T> {
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next position the producer writes. Only the producer stores it.
    put: AtomicUsize,
    /// Next position the consumer reads. Only the consumer stores it.
    get: AtomicUsize,
}

// SAFETY: a cell is written only by the producer while it lies in
// `[put, get + capacity)` and read only by the consumer while it lies in
// `[get, put)`. The release-store of `put` after a write, paired with the
// consumer's acquire-load, orders the write before the read (and likewise
// for `get` in the other direction), so no cell is ever accessed from both
// sides at once.
unsafe impl<T: Send> Sync for Shared<T> {}
unsafe impl<T: Send> Send for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let put = *self.put.get_mut();
        let mut get = *self.get.get_mut();
        while get != put {
            // SAFETY: cells in [get, put) hold initialized, unread values and
            // no half of the ring is left to touch them.
            unsafe { (*self.buffer[get & self.mask].get()).assume_init_drop() };
            get = get.wrapping_add(1);
        }
    }
}

/// Writing half. Owned by the thread that encodes.
pub struct RingProducer<T> {
    shared: Arc<Shared<T>>,
    put: usize,
}

/// Reading half. Owned by the render thread.
pub struct RingConsumer<T> {
    shared: Arc<Shared<T>>,
    get: usize,
}

/// Creates a ring holding up to `capacity` records. `capacity` must be a
/// power of two.
pub fn ring<T>(capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    assert!(
        capacity >= 2 && capacity.is_power_of_two(),
        "ring capacity must be a power of two, got {capacity}"
    );
    let buffer = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        buffer,
        mask: capacity - 1,
        put: AtomicUsize::new(0),
        get: AtomicUsize::new(0),
    });
    (
        RingProducer {
            shared: shared.clone(),
            put: 0,
        },
        RingConsumer { shared, get: 0 },
    )
}

impl<T> RingProducer<T> {
    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    /// Records written but not yet consumed.
    pub fn len(&self) -> usize {
        self.put.wrapping_sub(self.shared.get.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> usize {
        self.put
    }

    /// Appends `value`, or hands it back if the ring is full. The
    /// release-store of `put` is the last thing this does.
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        if self.len() == self.capacity() {
            return Err(value);
        }
        let cell = &self.shared.buffer[self.put & self.shared.mask];
        // SAFETY: `put - get < capacity`, so the consumer is not reading this
        // cell, and the acquire-load of `get` in `len` ordered its last read
        // of it before this write. The cell's previous value was moved out.
        unsafe { (*cell.get()).write(value) };
        self.put = self.put.wrapping_add(1);
        self.shared.put.store(self.put, Ordering::Release);
        Ok(())
    }
}

impl<T> RingConsumer<T> {
    pub fn capacity(&self) -> usize {
        self.shared.mask + 1
    }

    pub fn position(&self) -> usize {
        self.get
    }

    /// Current write position. Everything before it is readable.
    pub fn snapshot(&self) -> usize {
        self.shared.put.load(Ordering::Acquire)
    }

    /// Takes the next record if it lies before `end`, a value previously
    /// returned by [`snapshot`](Self::snapshot).
    pub fn pop_until(&mut self, end: usize) -> Option<T> {
        if self.get == end {
            return None;
        }
        debug_assert!(end.wrapping_sub(self.get) <= self.capacity());
        let cell = &self.shared.buffer[self.get & self.shared.mask];
        // SAFETY: `get` is before a published `put`, so the producer finished
        // writing this cell and will not touch it again until `get` moves
        // past it. The value is moved out exactly once.
        let value = unsafe { (*cell.get()).assume_init_read() };
        self.get = self.get.wrapping_add(1);
        self.shared.get.store(self.get, Ordering::Release);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fifo_across_wraparound() {
        let (mut tx, mut rx) = ring::<u32>(4);
        let mut next = 0;
        let mut seen = Vec::new();
        for _ in 0..10 {
            for _ in 0..3 {
                tx.try_push(next).unwrap();
                next += 1;
            }
            let end = rx.snapshot();
            while let Some(v) = rx.pop_until(end) {
                seen.push(v);
            }
        }
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
        assert!(tx.is_empty());
    }

    #[test]
    fn full_ring_rejects_push() {
        let (mut tx, mut rx) = ring::<u8>(2);
        tx.try_push(1).unwrap();
        tx.try_push(2).unwrap();
        assert_eq!(tx.try_push(3), Err(3));
        let end = rx.snapshot();
        assert_eq!(rx.pop_until(end), Some(1));
        tx.try_push(3).unwrap();
    }

    #[test]
    fn pop_stops_at_snapshot() {
        let (mut tx, mut rx) = ring::<u8>(8);
        tx.try_push(1).unwrap();
        let end = rx.snapshot();
        tx.try_push(2).unwrap();
        assert_eq!(rx.pop_until(end), Some(1));
        assert_eq!(rx.pop_until(end), None);
        assert_eq!(rx.position(), end);
    }

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unread_values_dropped_with_ring() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let (mut tx, mut rx) = ring(4);
            for _ in 0..3 {
                assert!(tx.try_push(Counted(drops.clone())).is_ok());
            }
            let end = rx.snapshot();
            drop(rx.pop_until(end));
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn threads_observe_every_value_in_order() {
        let (mut tx, mut rx) = ring::<u64>(64);
        let consumer = std::thread::spawn(move || {
            let mut expected = 0u64;
            while expected < 10_000 {
                let end = rx.snapshot();
                while let Some(v) = rx.pop_until(end) {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                std::thread::yield_now();
            }
        });
        let mut i = 0u64;
        while i < 10_000 {
            if tx.try_push(i).is_ok() {
                i += 1;
            } else {
                std::thread::yield_now();
            }
        }
        consumer.join().unwrap();
    }
}
