//! Integration test: MPMC queue under producer/consumer contention.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use wireline::{MpmcQueue, MpmcQueueParams};

const PRODUCERS: usize = 8;
const CONSUMERS: usize = 8;
const PER_PRODUCER: u64 = 50_000;

fn run_stress(wait_duration: Duration) {
    let queue: Arc<MpmcQueue<u64>> = Arc::new(MpmcQueue::new(
        MpmcQueueParams::default()
            .set_capacity(128)
            .set_producers(PRODUCERS)
            .set_consumers(CONSUMERS)
            .set_wait_duration(wait_duration),
    ));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for value in 0..PER_PRODUCER {
                    queue.put(value, id);
                }
            })
        })
        .collect();

    let per_consumer = PER_PRODUCER as usize * PRODUCERS / CONSUMERS;
    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|id| {
            let queue = queue.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::with_capacity(per_consumer);
                for _ in 0..per_consumer {
                    seen.push(queue.get(id));
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let mut histogram: HashMap<u64, usize> = HashMap::new();
    for consumer in consumers {
        let seen = consumer.join().unwrap();
        // Every consumer got exactly its share.
        assert_eq!(seen.len(), per_consumer);
        for value in seen {
            *histogram.entry(value).or_default() += 1;
        }
    }

    // The dequeued multiset is {0..N} with multiplicity PRODUCERS.
    assert_eq!(histogram.len(), PER_PRODUCER as usize);
    for value in 0..PER_PRODUCER {
        assert_eq!(histogram[&value], PRODUCERS, "multiplicity of {value}");
    }
    assert!(queue.is_empty());
}

#[test]
fn stress_with_semaphore_backoff() {
    run_stress(Duration::from_micros(10));
}

#[test]
fn stress_with_spin_backoff() {
    run_stress(Duration::ZERO);
}
