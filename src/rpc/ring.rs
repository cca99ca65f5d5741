//! A bounded, wait-free multi-producer multi-consumer ring buffer.
//!
//! Holds `Copy` elements (in practice raw context pointers). Two
//! cache-line-padded handles, each with an atomic `head`/`tail` pair: the
//! producer handle tracks free-slot claims, the consumer handle tracks
//! filled-slot claims. `push`/`pop` never block on a mutex; a full or empty
//! ring fails fast, and contending pushers/poppers only spin briefly while
//! racing the CAS on their own handle.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

const CACHE_LINE_SIZE: usize = 64;

#[repr(align(64))]
struct Handle {
    head: AtomicU32,
    tail: AtomicU32,
}

impl Handle {
    const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

#[inline]
fn pause() {
    std::hint::spin_loop();
}

fn align_up_pow2(n: u32) -> u32 {
    if n.is_power_of_two() {
        n
    } else {
        n.next_power_of_two()
    }
}

/// A bounded MPMC ring of capacity `next_power_of_two(requested)`.
///
/// `T` must be `Copy`: the ring stores raw values (pointers, indices) and
/// never runs a destructor on the slots, matching its use as a free-list of
/// non-owning context references.
pub struct Ring<T: Copy> {
    producer: Handle,
    consumer: Handle,
    size: u32,
    mask: u32,
    capacity: u32,
    elems: Box<[UnsafeCell<Option<T>>]>,
}

// SAFETY: access to `elems` is only ever performed by the thread that won
// the corresponding CAS on `producer.head`/`consumer.head`, so no two
// threads ever touch the same slot concurrently.
unsafe impl<T: Copy + Send> Send for Ring<T> {}
unsafe impl<T: Copy + Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Create a ring able to hold at least `capacity` elements.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        let size = align_up_pow2(capacity);
        let elems = (0..size).map(|_| UnsafeCell::new(None)).collect();
        Self {
            producer: Handle::new(),
            consumer: Handle::new(),
            size,
            mask: size - 1,
            capacity,
            elems,
        }
    }

    /// Declared/usable capacity (before rounding up to a power of two).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of elements currently queued. Racy if concurrent
    /// pushers/poppers are active; intended for diagnostics/tests.
    pub fn len(&self) -> u32 {
        self.producer
            .tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.consumer.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attempt to push `value`. Returns `false` if the ring is full.
    pub fn try_push(&self, value: T) -> bool {
        let mut producer_old_head = self.producer.head.load(Ordering::Acquire);
        loop {
            let consumer_tail = self.consumer.tail.load(Ordering::Acquire);
            let n_free = self.capacity.wrapping_add(consumer_tail).wrapping_sub(producer_old_head);
            if (n_free as i32) < 1 {
                return false;
            }
            let producer_new_head = producer_old_head.wrapping_add(1);
            match self.producer.head.compare_exchange_weak(
                producer_old_head,
                producer_new_head,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let idx = (producer_old_head & self.mask) as usize;
                    // SAFETY: this thread alone owns slot `idx` until the
                    // tail catch-up store below makes it visible to a
                    // consumer.
                    unsafe {
                        *self.elems[idx].get() = Some(value);
                    }
                    while self.producer.tail.load(Ordering::Relaxed) != producer_old_head {
                        pause();
                    }
                    self.producer.tail.store(producer_new_head, Ordering::Release);
                    return true;
                }
                Err(cur) => producer_old_head = cur,
            }
        }
    }

    /// Attempt to pop an element. Returns `None` if the ring is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut consumer_old_head = self.consumer.head.load(Ordering::Acquire);
        loop {
            let producer_tail = self.producer.tail.load(Ordering::Acquire);
            let n_remain = producer_tail.wrapping_sub(consumer_old_head);
            if (n_remain as i32) < 1 {
                return None;
            }
            let consumer_new_head = consumer_old_head.wrapping_add(1);
            match self.consumer.head.compare_exchange_weak(
                consumer_old_head,
                consumer_new_head,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let idx = (consumer_old_head & self.mask) as usize;
                    // SAFETY: this thread alone owns slot `idx` until the
                    // tail catch-up store below lets a producer reuse it.
                    let value = unsafe { (*self.elems[idx].get()).take() };
                    while self.consumer.tail.load(Ordering::Relaxed) != consumer_old_head {
                        pause();
                    }
                    self.consumer.tail.store(consumer_new_head, Ordering::Release);
                    return value;
                }
                Err(cur) => consumer_old_head = cur,
            }
        }
    }

    /// Blocking push: spin-pauses until `try_push` succeeds.
    pub fn push(&self, value: T) {
        while !self.try_push(value) {
            pause();
        }
    }

    /// Blocking pop: spin-pauses until `try_pop` succeeds.
    pub fn pop(&self) -> T {
        loop {
            if let Some(v) = self.try_pop() {
                return v;
            }
            pause();
        }
    }
}

const _: () = assert!(CACHE_LINE_SIZE == 64);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rounds_capacity_up_to_power_of_two() {
        let ring: Ring<u32> = Ring::new(5);
        assert_eq!(ring.capacity(), 5);
        // internal size is 8, but declared capacity is still 5: exactly 5
        // pushes should succeed before the ring reports full.
        for i in 0..5 {
            assert!(ring.try_push(i));
        }
        assert!(!ring.try_push(99));
    }

    #[test]
    fn push_pop_is_fifo() {
        let ring: Ring<u32> = Ring::new(4);
        for i in 0..4 {
            assert!(ring.try_push(i));
        }
        assert!(!ring.try_push(4));
        for i in 0..4 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn pop_from_empty_returns_none() {
        let ring: Ring<u32> = Ring::new(4);
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn push_into_full_returns_false() {
        let ring: Ring<u32> = Ring::new(2);
        assert!(ring.try_push(1));
        assert!(ring.try_push(2));
        assert!(!ring.try_push(3));
    }

    #[test]
    fn concurrent_push_pop_conserves_all_elements() {
        const N_CTX: u32 = 8;
        const PER_PRODUCER: u32 = 2000;

        let ring = Arc::new(Ring::<u32>::new(N_CTX));
        for i in 0..N_CTX {
            assert!(ring.try_push(i));
        }

        let producers: Vec<_> = (0..N_CTX)
            .map(|_| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let v = ring.pop();
                        ring.push(v);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(ring.len(), N_CTX);
    }
}
