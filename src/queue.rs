//! Lock-free bounded MPMC queue.
//!
//! Producers and consumers reserve monotonic tickets with a `fetch_add` on
//! the shared head/tail counters; `ticket & mask` is the ring slot. Each
//! side publishes its in-flight ticket in a per-client reservation slot so
//! the opposite side can compute the lowest position still in use before
//! reusing a slot. Insertions are totally ordered by ticket acquisition
//! (likewise removals), but the queue is not strictly FIFO across
//! producers.
//!
//! Progress: operations are lock-free while the ring has room (or data);
//! a producer facing a full ring, or a consumer facing an empty one, waits
//! on a semaphore (or spins, when `wait_duration` is zero) for a peer.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::config::MpmcQueueParams;

/// Reservation value for "not in the game".
const IDLE: usize = usize::MAX;

#[repr(align(128))]
struct PaddedCounter(AtomicUsize);

impl PaddedCounter {
    const fn new(value: usize) -> Self {
        PaddedCounter(AtomicUsize::new(value))
    }
}

/// A minimal counting semaphore: `signal` wakes one `timed_wait`er.
struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.permits.lock() += 1;
        self.cv.notify_one();
    }

    fn timed_wait(&self, timeout: Duration) {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            self.cv.wait_for(&mut permits, timeout);
        }
        if *permits > 0 {
            *permits -= 1;
        }
    }
}

/// Lock-free bounded multi-producer / multi-consumer queue.
///
/// `producer_id` / `consumer_id` arguments must be below the configured
/// counts, and two threads must not share an id concurrently — the
/// reservation protocol depends on it.
pub struct MpmcQueue<T> {
    size: usize,
    mask: usize,
    producers: usize,
    consumers: usize,
    wait_duration: Duration,

    ring: Box<[UnsafeCell<MaybeUninit<T>>]>,

    /// Next ticket to insert.
    head: PaddedCounter,
    /// Next ticket to pop.
    tail: PaddedCounter,
    /// Cached lowest producer position not yet published.
    last_head: PaddedCounter,
    /// Cached lowest consumer position not yet released.
    last_tail: PaddedCounter,

    producer_pos: Box<[PaddedCounter]>,
    consumer_pos: Box<[PaddedCounter]>,

    /// Waited on by producers when the ring is full, signaled by consumers.
    space_sem: Semaphore,
    /// Waited on by consumers when the ring is empty, signaled by producers.
    data_sem: Semaphore,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T: Send> MpmcQueue<T> {
    pub fn new(params: MpmcQueueParams) -> Self {
        assert!(params.capacity > 0, "queue capacity must be positive");
        assert!(params.producers > 0, "queue needs at least one producer");
        assert!(params.consumers > 0, "queue needs at least one consumer");
        let size = params.capacity.next_power_of_two();
        let ring = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let reservations = |n: usize| {
            (0..n)
                .map(|_| PaddedCounter::new(IDLE))
                .collect::<Vec<_>>()
                .into_boxed_slice()
        };
        MpmcQueue {
            size,
            mask: size - 1,
            producers: params.producers,
            consumers: params.consumers,
            wait_duration: params.wait_duration,
            ring,
            head: PaddedCounter::new(0),
            tail: PaddedCounter::new(0),
            last_head: PaddedCounter::new(0),
            last_tail: PaddedCounter::new(0),
            producer_pos: reservations(params.producers),
            consumer_pos: reservations(params.consumers),
            space_sem: Semaphore::new(),
            data_sem: Semaphore::new(),
        }
    }

    /// Ring capacity after power-of-two rounding.
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.head
            .0
            .load(Ordering::Relaxed)
            .saturating_sub(self.tail.0.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn back_off(&self, sem: &Semaphore) {
        if self.wait_duration > Duration::ZERO {
            sem.timed_wait(self.wait_duration);
        } else {
            std::hint::spin_loop();
        }
    }

    /// Lowest position any consumer may still read from.
    fn min_consumer_pos(&self) -> usize {
        let mut pos_min = self.tail.0.load(Ordering::Acquire);
        for c in self.consumer_pos.iter() {
            let reserved = c.0.load(Ordering::Acquire);
            if reserved < pos_min {
                pos_min = reserved;
            }
        }
        self.last_tail.0.store(pos_min, Ordering::Release);
        pos_min
    }

    /// Lowest position any producer may still be writing.
    fn min_producer_pos(&self) -> usize {
        let mut pos_min = self.head.0.load(Ordering::Acquire);
        for p in self.producer_pos.iter() {
            let reserved = p.0.load(Ordering::Acquire);
            if reserved < pos_min {
                pos_min = reserved;
            }
        }
        self.last_head.0.store(pos_min, Ordering::Release);
        pos_min
    }

    /// Insert `value`, waiting as long as needed for ring space.
    pub fn put(&self, value: T, producer_id: usize) {
        assert!(producer_id < self.producers, "producer id out of range");
        let reservation = &self.producer_pos[producer_id].0;

        // Enter the game before taking a ticket so consumers never compute
        // a minimum that skips over us.
        reservation.store(self.head.0.load(Ordering::Acquire), Ordering::Release);
        let ticket = self.head.0.fetch_add(1, Ordering::AcqRel);
        reservation.store(ticket, Ordering::Release);

        let mut pos_min = self.last_tail.0.load(Ordering::Acquire);
        while ticket >= pos_min + self.size {
            pos_min = self.min_consumer_pos();
            if ticket < pos_min + self.size {
                break;
            }
            self.back_off(&self.space_sem);
        }

        unsafe {
            (*self.ring[ticket & self.mask].get()).write(value);
        }
        reservation.store(IDLE, Ordering::Release);

        if self.wait_duration > Duration::ZERO
            && self.last_head.0.load(Ordering::Acquire) <= ticket
        {
            self.data_sem.signal();
        }
    }

    /// Insert `value` unless ring space fails to appear within `timeout`.
    /// On timeout the value is handed back and no ticket was consumed.
    pub fn put_timeout(
        &self,
        value: T,
        producer_id: usize,
        timeout: Duration,
    ) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        loop {
            let head_now = self.head.0.load(Ordering::Acquire);
            if head_now < self.min_consumer_pos() + self.size {
                break;
            }
            if Instant::now() >= deadline {
                return Err(value);
            }
            self.back_off(&self.space_sem);
        }
        // Space can be stolen between the check and the ticket, in which
        // case put() waits for a consumer like any full-ring put.
        self.put(value, producer_id);
        Ok(())
    }

    /// Remove the element at the next ticket, waiting as long as needed
    /// for one to be published.
    pub fn get(&self, consumer_id: usize) -> T {
        assert!(consumer_id < self.consumers, "consumer id out of range");
        let reservation = &self.consumer_pos[consumer_id].0;

        reservation.store(self.tail.0.load(Ordering::Acquire), Ordering::Release);
        let ticket = self.tail.0.fetch_add(1, Ordering::AcqRel);
        reservation.store(ticket, Ordering::Release);

        let mut pos_min = self.last_head.0.load(Ordering::Acquire);
        while ticket >= pos_min {
            pos_min = self.min_producer_pos();
            if ticket < pos_min {
                break;
            }
            self.back_off(&self.data_sem);
        }

        let value = unsafe { (*self.ring[ticket & self.mask].get()).assume_init_read() };
        reservation.store(IDLE, Ordering::Release);

        if self.wait_duration > Duration::ZERO
            && self.last_tail.0.load(Ordering::Acquire) <= ticket
        {
            self.space_sem.signal();
        }
        value
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // No concurrent access at this point; drop whatever never got
        // consumed.
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        for ticket in tail..head {
            unsafe {
                (*self.ring[ticket & self.mask].get()).assume_init_drop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn params(capacity: usize, producers: usize, consumers: usize) -> MpmcQueueParams {
        MpmcQueueParams::default()
            .set_capacity(capacity)
            .set_producers(producers)
            .set_consumers(consumers)
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let queue: MpmcQueue<u64> = MpmcQueue::new(params(100, 1, 1));
        assert_eq!(queue.capacity(), 128);
    }

    #[test]
    fn spsc_preserves_order() {
        let queue: MpmcQueue<u64> = MpmcQueue::new(params(8, 1, 1));
        let queue = Arc::new(queue);
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    queue.put(i, 0);
                }
            })
        };
        for i in 0..1000u64 {
            assert_eq!(queue.get(0), i);
        }
        producer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn mpmc_preserves_multiset() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 10_000;

        let queue: Arc<MpmcQueue<u64>> =
            Arc::new(MpmcQueue::new(params(64, PRODUCERS, CONSUMERS)));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        queue.put(i, id);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|id| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let per_consumer = PER_PRODUCER as usize * PRODUCERS / CONSUMERS;
                    let mut seen = Vec::with_capacity(per_consumer);
                    for _ in 0..per_consumer {
                        seen.push(queue.get(id));
                    }
                    seen
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let mut histogram: HashMap<u64, usize> = HashMap::new();
        for c in consumers {
            for value in c.join().unwrap() {
                *histogram.entry(value).or_default() += 1;
            }
        }
        assert_eq!(histogram.len(), PER_PRODUCER as usize);
        for i in 0..PER_PRODUCER {
            assert_eq!(histogram[&i], PRODUCERS, "multiplicity of {i}");
        }
    }

    #[test]
    fn put_timeout_full_queue_returns_value() {
        let queue: MpmcQueue<String> = MpmcQueue::new(params(2, 1, 1));
        queue.put("a".to_string(), 0);
        queue.put("b".to_string(), 0);
        let rejected = queue.put_timeout("c".to_string(), 0, Duration::from_millis(5));
        assert_eq!(rejected, Err("c".to_string()));
        // The rejected put left the queue intact.
        assert_eq!(queue.get(0), "a");
        assert_eq!(queue.get(0), "b");
    }

    #[test]
    fn put_timeout_succeeds_with_space() {
        let queue: MpmcQueue<u32> = MpmcQueue::new(params(2, 1, 1));
        assert_eq!(queue.put_timeout(7, 0, Duration::from_millis(5)), Ok(()));
        assert_eq!(queue.get(0), 7);
    }

    #[test]
    fn spin_mode_works() {
        let queue: Arc<MpmcQueue<u64>> = Arc::new(MpmcQueue::new(
            params(4, 1, 1).set_wait_duration(Duration::ZERO),
        ));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..100u64 {
                    queue.put(i, 0);
                }
            })
        };
        let sum: u64 = (0..100).map(|_| queue.get(0)).sum();
        producer.join().unwrap();
        assert_eq!(sum, (0..100u64).sum());
    }

    #[test]
    fn drop_releases_queued_elements() {
        let queue: MpmcQueue<Arc<()>> = MpmcQueue::new(params(8, 1, 1));
        let tracker = Arc::new(());
        queue.put(tracker.clone(), 0);
        queue.put(tracker.clone(), 0);
        assert_eq!(Arc::strong_count(&tracker), 3);
        drop(queue);
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
