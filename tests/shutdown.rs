use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Instant;

use fabric_core::{sleep, FabricBuilder};

/// Travels inside a job's closure; tallies whether the body ran and on
/// which thread the closure was destroyed.
struct Tally {
    ran: bool,
    executed: Arc<AtomicUsize>,
    unexecuted_drop_threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl Drop for Tally {
    fn drop(&mut self) {
        if self.ran {
            self.executed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.unexecuted_drop_threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
        }
    }
}

#[test]
fn shutdown_waits_for_in_flight_jobs_and_drops_the_rest() {
    let executed = Arc::new(AtomicUsize::new(0));
    let unexecuted_drop_threads = Arc::new(Mutex::new(Vec::new()));

    let fabric = FabricBuilder::new()
        .name("teardown")
        .worker_count(2)
        .build()
        .unwrap();

    for _ in 0..100 {
        let mut tally = Tally {
            ran: false,
            executed: Arc::clone(&executed),
            unexecuted_drop_threads: Arc::clone(&unexecuted_drop_threads),
        };
        fabric.go(move || {
            tally.ran = true;
            sleep(300);
        });
    }

    // Let the two workers take a job each, then pull the plug.
    sleep(100);
    let begun = Instant::now();
    drop(fabric);
    let held_for = begun.elapsed();

    let executed = executed.load(Ordering::SeqCst);
    assert!(executed <= 2, "at most the in-flight jobs ran, got {}", executed);

    // Control came back only after the in-flight jobs finished.
    if executed > 0 {
        assert!(
            held_for.as_millis() >= 150,
            "drop returned before in-flight jobs completed ({:?})",
            held_for
        );
    }

    let dropped = unexecuted_drop_threads.lock().unwrap();
    assert_eq!(dropped.len(), 100 - executed);
    let caller = std::thread::current().id();
    assert!(
        dropped.iter().all(|id| *id == caller),
        "unexecuted jobs must be destroyed on the shutting-down caller"
    );
}

#[test]
fn an_idle_fabric_shuts_down_promptly() {
    let fabric = FabricBuilder::new()
        .name("idle")
        .worker_count(4)
        .build()
        .unwrap();
    let begun = Instant::now();
    drop(fabric);
    assert!(
        begun.elapsed().as_millis() < 2_000,
        "idle workers must wake and exit without waiting on work"
    );
}
