//! Stop-the-world handshake between local heaps and collection requests.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{small_config, CountingCollector};
use concurrent_alloc::{GarbageCollector, Heap, LocalHeap};

fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(10), "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_collection_starts_only_after_everyone_parks() {
    let collector = CountingCollector::new();
    let collections = collector.counter();
    let heap = Heap::builder(small_config())
        .collector(collector)
        .build()
        .unwrap();
    let mut main = LocalHeap::new(&heap);

    let requester = {
        let heap = Arc::clone(&heap);
        thread::spawn(move || {
            let local = LocalHeap::new(&heap);
            let _parked = local.parked_scope();
            heap.request_and_wait_for_collection();
        })
    };

    wait_for("pause request", || heap.safepoint().is_pause_requested());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(collections.load(Ordering::SeqCst), 0);

    main.safepoint();
    assert_eq!(collections.load(Ordering::SeqCst), 1);
    assert!(!main.is_parked());

    requester.join().unwrap();
    assert!(!heap.safepoint().is_pause_requested());
    assert_eq!(heap.metrics().snapshot().collection_requests, 1);
}

#[test]
fn test_parked_thread_does_not_block_collection() {
    let collector = CountingCollector::new();
    let collections = collector.counter();
    let heap = Heap::builder(small_config())
        .collector(collector)
        .build()
        .unwrap();

    let idle = LocalHeap::new(&heap);
    let _idle_parked = idle.parked_scope();

    let requester = LocalHeap::new(&heap);
    {
        let _parked = requester.parked_scope();
        heap.request_and_wait_for_collection();
    }

    assert_eq!(collections.load(Ordering::SeqCst), 1);
    assert_eq!(heap.safepoint().running_threads(), 1);
}

struct PanickingCollector(AtomicUsize);

impl GarbageCollector for PanickingCollector {
    fn collect_garbage(&self, _: &Heap) {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("collector failed");
        }
    }
}

#[test]
fn test_panicking_collector_releases_pause() {
    let heap = Heap::builder(small_config())
        .collector(PanickingCollector(AtomicUsize::new(0)))
        .build()
        .unwrap();
    let local = LocalHeap::new(&heap);

    let result = catch_unwind(AssertUnwindSafe(|| {
        let _parked = local.parked_scope();
        heap.request_and_wait_for_collection();
    }));

    assert!(result.is_err());
    assert!(!local.is_parked());
    assert!(!heap.safepoint().is_pause_requested());
    assert_eq!(heap.safepoint().epoch(), 1);

    {
        let _parked = local.parked_scope();
        heap.request_and_wait_for_collection();
    }
    assert_eq!(heap.safepoint().epoch(), 2);
}

#[test]
fn test_concurrent_requests_all_return() {
    let collector = CountingCollector::new();
    let collections = collector.counter();
    let heap = Heap::builder(small_config())
        .collector(collector)
        .build()
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let local = LocalHeap::new(&heap);
                for _ in 0..10 {
                    let _parked = local.parked_scope();
                    heap.request_and_wait_for_collection();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let collections = collections.load(Ordering::SeqCst);
    assert!((10..=40).contains(&collections));
    assert_eq!(heap.metrics().snapshot().collection_requests, 40);
    assert_eq!(heap.safepoint().registered_threads(), 0);
}
