// Wait-free SPSC ring queues: the only transport between the audio and
// control domains. Fixed power-of-two capacity, drop-on-full with a drop
// counter, Release/Acquire index protocol:
//
//   producer: write payload, then advance write_idx with Release
//   consumer: load write_idx with Acquire, then read payload
//
// Exactly one producer and one consumer per queue, enforced by handing out
// a single Producer / Consumer pair per channel.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    drops: AtomicU32,
}

// Payloads are plain-old-data (`T: Copy`); the index protocol guarantees a
// slot is never read while it is being written.
unsafe impl<T: Send + Copy> Send for Shared<T> {}
unsafe impl<T: Send + Copy> Sync for Shared<T> {}

pub struct Producer<T: Copy> {
    shared: Arc<Shared<T>>,
}

pub struct Consumer<T: Copy> {
    shared: Arc<Shared<T>>,
}

/// Build an SPSC queue of the given capacity (power of two, ≥ 2).
/// One slot is sacrificed to distinguish full from empty, so a queue of
/// capacity N holds at most N−1 items.
pub fn channel<T: Copy>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity.is_power_of_two() && capacity >= 2);
    let buf: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        buf,
        write_idx: AtomicUsize::new(0),
        read_idx: AtomicUsize::new(0),
        drops: AtomicU32::new(0),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

impl<T: Copy> Producer<T> {
    /// Enqueue one payload. Returns false (and counts a drop) when full;
    /// never blocks.
    pub fn post(&self, item: T) -> bool {
        let s = &self.shared;
        let mask = s.buf.len() - 1;
        let w = s.write_idx.load(Ordering::Relaxed);
        let next = (w + 1) & mask;
        if next == s.read_idx.load(Ordering::Acquire) {
            s.drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            (*s.buf[w].get()).write(item);
        }
        s.write_idx.store(next, Ordering::Release);
        true
    }

    /// Advisory fill level as seen from the producer.
    pub fn depth(&self) -> usize {
        depth_of(&self.shared)
    }

    /// Payloads dropped so far because the queue was full.
    pub fn drops(&self) -> u32 {
        self.shared.drops.load(Ordering::Relaxed)
    }

    /// Free slots as seen from the producer.
    pub fn space(&self) -> usize {
        self.shared.buf.len() - 1 - self.depth()
    }
}

impl<T: Copy> Consumer<T> {
    /// Dequeue one payload, or None when empty. Never blocks.
    pub fn get(&self) -> Option<T> {
        let s = &self.shared;
        let mask = s.buf.len() - 1;
        let r = s.read_idx.load(Ordering::Relaxed);
        if r == s.write_idx.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*s.buf[r].get()).assume_init() };
        s.read_idx.store((r + 1) & mask, Ordering::Release);
        Some(item)
    }

    /// Advisory fill level as seen from the consumer.
    pub fn depth(&self) -> usize {
        depth_of(&self.shared)
    }

    pub fn drops(&self) -> u32 {
        self.shared.drops.load(Ordering::Relaxed)
    }

    /// Discard everything currently queued.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.get().is_some() {
            n += 1;
        }
        n
    }
}

fn depth_of<T>(s: &Shared<T>) -> usize {
    let w = s.write_idx.load(Ordering::Relaxed);
    let r = s.read_idx.load(Ordering::Relaxed);
    (w.wrapping_sub(r)) & (s.buf.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let (tx, rx) = channel::<u32>(8);
        for i in 0..5 {
            assert!(tx.post(i));
        }
        for i in 0..5 {
            assert_eq!(rx.get(), Some(i));
        }
        assert_eq!(rx.get(), None);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let (tx, rx) = channel::<u8>(4);
        // Capacity 4 holds 3 items.
        assert!(tx.post(1));
        assert!(tx.post(2));
        assert!(tx.post(3));
        assert!(!tx.post(4));
        assert_eq!(tx.drops(), 1);
        assert_eq!(rx.depth(), 3);
        // Dequeued sequence is a prefix of the enqueued sequence.
        assert_eq!(rx.get(), Some(1));
        assert!(tx.post(4));
        assert_eq!(rx.get(), Some(2));
        assert_eq!(rx.get(), Some(3));
        assert_eq!(rx.get(), Some(4));
    }

    #[test]
    fn cross_thread_transfer() {
        let (tx, rx) = channel::<u64>(64);
        let producer = std::thread::spawn(move || {
            let mut sent = 0u64;
            for i in 0..10_000u64 {
                while !tx.post(i) {
                    std::hint::spin_loop();
                }
                sent += 1;
            }
            sent
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.get() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        assert_eq!(producer.join().unwrap(), 10_000);
    }

    #[test]
    fn drain_empties_queue() {
        let (tx, rx) = channel::<u8>(8);
        for i in 0..6 {
            tx.post(i);
        }
        assert_eq!(rx.drain(), 6);
        assert_eq!(rx.depth(), 0);
    }
}
