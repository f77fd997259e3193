use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fabric_core::{FabricBuilder, Mutex, WaitGroup};

#[test]
fn thousand_increments_land_exactly_once_each() {
    let fabric = FabricBuilder::new()
        .name("adder")
        .worker_count(4)
        .build()
        .unwrap();

    let lock = Arc::new(Mutex::new("counter"));
    let counter = Arc::new(AtomicUsize::new(0));
    let wg = WaitGroup::new();

    wg.add(1000);
    for _ in 0..1000 {
        let lock = Arc::clone(&lock);
        let counter = Arc::clone(&counter);
        let wg = wg.clone();
        fabric.go(move || {
            let _held = lock.lock();
            counter.fetch_add(1, Ordering::Relaxed);
            drop(_held);
            wg.done();
        });
    }
    wg.wait();

    assert_eq!(counter.load(Ordering::SeqCst), 1000);
}

#[test]
fn single_worker_runs_jobs_in_submission_order() {
    let fabric = FabricBuilder::new()
        .name("serial")
        .worker_count(1)
        .build()
        .unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let wg = WaitGroup::new();

    wg.add(64);
    for i in 0..64 {
        let order = Arc::clone(&order);
        let wg = wg.clone();
        fabric.go(move || {
            order.lock().unwrap().push(i);
            wg.done();
        });
    }
    wg.wait();

    let order = order.lock().unwrap();
    let expected: Vec<usize> = (0..64).collect();
    assert_eq!(*order, expected);
}

#[test]
fn drain_on_quit_runs_every_queued_job() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let fabric = FabricBuilder::new()
            .name("drainer")
            .worker_count(2)
            .drain_on_quit(true)
            .build()
            .unwrap();
        for _ in 0..500 {
            let counter = Arc::clone(&counter);
            fabric.go(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        // Shutdown races the workers; drain mode means the leftovers run
        // anyway before drop returns.
    }
    assert_eq!(counter.load(Ordering::SeqCst), 500);
}

#[test]
fn after_each_job_runs_between_jobs() {
    let between = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&between);
    let fabric = FabricBuilder::new()
        .name("tidy")
        .worker_count(1)
        .after_each_job(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        })
        .build()
        .unwrap();

    let wg = WaitGroup::new();
    wg.add(8);
    for _ in 0..8 {
        let wg = wg.clone();
        fabric.go(move || wg.done());
    }
    wg.wait();
    drop(fabric);

    assert_eq!(between.load(Ordering::SeqCst), 8);
}
