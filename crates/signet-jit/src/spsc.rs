//! Bounded wait-free single-producer/single-consumer queue.
//!
//! Carries the hot-swap protocol messages between the compile and audio
//! threads. Both operations are wait-free: `push` drops the message and
//! reports failure when the ring is full, `pop` reports emptiness. Payloads
//! are `Copy` so neither side ever runs destructors on shared slots.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot to read; owned by the consumer, observed by the producer.
    head: AtomicUsize,
    /// Next slot to write; owned by the producer, observed by the consumer.
    tail: AtomicUsize,
}

// The ring hands each slot to exactly one side at a time: the producer
// writes `buf[tail]` strictly before the release store of `tail`, and the
// consumer reads `buf[head]` strictly after the acquire load of `tail`.
unsafe impl<T: Copy + Send> Send for Inner<T> {}
unsafe impl<T: Copy + Send> Sync for Inner<T> {}

/// Producing end. Owned by exactly one thread.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consuming end. Owned by exactly one thread.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a queue holding up to `capacity` messages.
pub fn channel<T: Copy + Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity >= 2, "queue capacity must be at least 2");
    let buf = (0..capacity + 1)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        buf,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer { inner: inner.clone() },
        Consumer { inner },
    )
}

impl<T: Copy + Send> Producer<T> {
    /// Enqueue a message. Returns `false` (dropping the message) when full.
    pub fn push(&mut self, value: T) -> bool {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let next = (tail + 1) % inner.buf.len();
        if next == inner.head.load(Ordering::Acquire) {
            return false;
        }
        unsafe { (*inner.buf[tail].get()).write(value) };
        inner.tail.store(next, Ordering::Release);
        true
    }
}

impl<T: Copy + Send> Consumer<T> {
    /// Dequeue the oldest message, if any.
    pub fn pop(&mut self) -> Option<T> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        if head == inner.tail.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*inner.buf[head].get()).assume_init() };
        inner.head.store((head + 1) % inner.buf.len(), Ordering::Release);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = channel::<u32>(8);
        for i in 0..5 {
            assert!(tx.push(i));
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn drops_on_full() {
        let (mut tx, mut rx) = channel::<u32>(2);
        assert!(tx.push(1));
        assert!(tx.push(2));
        assert!(!tx.push(3));
        assert_eq!(rx.pop(), Some(1));
        assert!(tx.push(3));
        assert_eq!(rx.pop(), Some(2));
        assert_eq!(rx.pop(), Some(3));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn payload_visible_across_threads() {
        #[derive(Clone, Copy, PartialEq, Debug)]
        struct Msg {
            seq: u32,
            payload: [u64; 3],
        }

        let (mut tx, mut rx) = channel::<Msg>(16);
        let producer = std::thread::spawn(move || {
            for seq in 0..10_000u32 {
                let msg = Msg {
                    seq,
                    payload: [seq as u64; 3],
                };
                while !tx.push(msg) {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some(msg) = rx.pop() {
                assert_eq!(msg.seq, expected);
                assert_eq!(msg.payload, [expected as u64; 3]);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
