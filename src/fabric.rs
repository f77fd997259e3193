//! The task dispatcher: a fixed pool of worker threads draining a shared
//! FIFO queue, plus a watchdog that keeps the queue moving past stalled
//! workers and scans the lock wait-for graph.
//!
//! Every submitted job runs to completion on one worker's OS thread; a
//! job that blocks, blocks its worker. There is no stealing and no
//! preemption — the put-aside reserve exists so a fabric can survive a
//! worker parking itself on a long operation.

use std::collections::{HashMap, VecDeque};
use std::env;
use std::fmt;
use std::mem;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use crossbeam_utils::CachePadded;

use crate::deadlock::DeadlockDetector;
use crate::hooks;
use crate::job::Job;
use crate::thread::Thread;
use crate::unwind;
use crate::{ErrorKind, FabricBuildError};

/// Callback run on a worker thread between jobs; commonly used to clear
/// the worker's scratch arena.
type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

const DEFAULT_BLOCKING_THRESHOLD: Duration = Duration::from_millis(10_000);

/// The watchdog never sleeps longer than this, so deadlock reports stay
/// timely even under the default stall threshold.
const MAX_WATCHDOG_TICK: Duration = Duration::from_millis(500);

/// Configuration for a [`Fabric`].
pub struct FabricBuilder {
    worker_count: usize,
    name: Option<String>,
    after_each_job: Option<Callback>,
    put_aside_worker_count: usize,
    blocking_workers_threshold: Duration,
    drain_on_quit: bool,
    stack_size: Option<usize>,
}

impl FabricBuilder {
    pub fn new() -> FabricBuilder {
        FabricBuilder {
            worker_count: 0,
            name: None,
            after_each_job: None,
            put_aside_worker_count: 0,
            blocking_workers_threshold: DEFAULT_BLOCKING_THRESHOLD,
            drain_on_quit: false,
            stack_size: None,
        }
    }

    /// Number of worker threads. Defaults to the `FABRIC_NUM_WORKERS`
    /// environment variable, then to the logical CPU count.
    pub fn worker_count(mut self, count: usize) -> FabricBuilder {
        self.worker_count = count;
        self
    }

    /// Prefix for worker thread names; workers are named
    /// `"{name}/{index}"`. Defaults to `"fabric"`.
    pub fn name(mut self, name: impl Into<String>) -> FabricBuilder {
        self.name = Some(name.into());
        self
    }

    /// Callback invoked on the worker thread between jobs. A panic inside
    /// it is swallowed.
    pub fn after_each_job<F>(mut self, callback: F) -> FabricBuilder
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.after_each_job = Some(Arc::new(callback));
        self
    }

    /// Reserve workers activated on demand when a regular worker is
    /// observed blocked past the threshold. Defaults to zero.
    pub fn put_aside_worker_count(mut self, count: usize) -> FabricBuilder {
        self.put_aside_worker_count = count;
        self
    }

    /// How long a worker may sit on one job before the watchdog calls it
    /// blocked. Defaults to ten seconds.
    pub fn blocking_workers_threshold(mut self, threshold: Duration) -> FabricBuilder {
        self.blocking_workers_threshold = threshold;
        self
    }

    /// Whether workers run the jobs still queued when the fabric shuts
    /// down. Defaults to false: queued jobs are dropped unexecuted.
    pub fn drain_on_quit(mut self, drain: bool) -> FabricBuilder {
        self.drain_on_quit = drain;
        self
    }

    /// Stack size for worker threads, in bytes.
    pub fn stack_size(mut self, bytes: usize) -> FabricBuilder {
        self.stack_size = Some(bytes);
        self
    }

    /// Spawns the workers and the watchdog. If a thread fails to spawn,
    /// the workers already running are shut down before the error is
    /// returned.
    pub fn build(self) -> Result<Fabric, FabricBuildError> {
        let worker_count = match self.worker_count {
            0 => default_worker_count(),
            n => n,
        };
        let slot_count = worker_count + self.put_aside_worker_count;
        let name = self.name.unwrap_or_else(|| "fabric".to_owned());

        // The spawning thread's context exists before any worker does.
        crate::context::with(|_| ());

        // The detector must see lock traffic from the very first job.
        DeadlockDetector::install();

        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                queue: VecDeque::new(),
                num_idle: 0,
                num_notify: 0,
                quit: false,
                slots: vec![WorkerSlot::default(); slot_count],
                handles: HashMap::new(),
                spawned: 0,
            }),
            not_empty: Condvar::new(),
            name,
            after_each_job: self.after_each_job,
            threshold: self.blocking_workers_threshold,
            drain_on_quit: self.drain_on_quit,
            stack_size: self.stack_size,
            worker_count,
            reserve_count: self.put_aside_worker_count,
            live_workers: CachePadded::new(AtomicUsize::new(0)),
            degraded: CachePadded::new(AtomicBool::new(false)),
        });

        for index in 0..worker_count {
            if let Err(e) = Inner::spawn_worker(&inner, index) {
                inner.terminate_for_build_failure();
                return Err(FabricBuildError::new(ErrorKind::IOError(e)));
            }
        }

        let (watchdog_quit, ticks) = bounded::<()>(0);
        let tick = inner.threshold.min(MAX_WATCHDOG_TICK);
        let watchdog_inner = Arc::clone(&inner);
        let watchdog = Thread::spawn(&format!("{}-watchdog", inner.name), move || {
            // The watchdog's own activity must not show up in the
            // diagnostics it produces.
            hooks::disable_profiling_for_this_thread();
            let detector = DeadlockDetector::install();
            loop {
                match ticks.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {
                        Inner::check_stalled_workers(&watchdog_inner);
                        detector.scan();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        let watchdog = match watchdog {
            Ok(handle) => handle,
            Err(e) => {
                inner.terminate_for_build_failure();
                return Err(FabricBuildError::new(ErrorKind::IOError(e)));
            }
        };

        Ok(Fabric {
            inner,
            watchdog: Some(watchdog),
            watchdog_quit: Some(watchdog_quit),
        })
    }
}

impl Default for FabricBuilder {
    fn default() -> FabricBuilder {
        FabricBuilder::new()
    }
}

impl fmt::Debug for FabricBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricBuilder")
            .field("worker_count", &self.worker_count)
            .field("name", &self.name)
            .field("put_aside_worker_count", &self.put_aside_worker_count)
            .field("blocking_workers_threshold", &self.blocking_workers_threshold)
            .field("drain_on_quit", &self.drain_on_quit)
            .finish()
    }
}

/// A fixed pool of worker threads draining a shared FIFO job queue.
///
/// Dropping the fabric shuts it down: workers are woken, in-flight jobs
/// run to completion, queued jobs are dropped unexecuted (unless the
/// fabric was built with `drain_on_quit`), and every thread is joined
/// before `drop` returns.
pub struct Fabric {
    inner: Arc<Inner>,
    watchdog: Option<Thread>,
    watchdog_quit: Option<Sender<()>>,
}

struct Inner {
    shared: Mutex<Shared>,
    not_empty: Condvar,
    name: String,
    after_each_job: Option<Callback>,
    threshold: Duration,
    drain_on_quit: bool,
    stack_size: Option<usize>,
    worker_count: usize,
    reserve_count: usize,
    live_workers: CachePadded<AtomicUsize>,
    degraded: CachePadded<AtomicBool>,
}

struct Shared {
    queue: VecDeque<Job>,
    /// Workers parked on the condvar.
    num_idle: usize,
    /// Outstanding legitimate wakeups; the counter keeps spurious wakes
    /// from being mistaken for work.
    num_notify: usize,
    quit: bool,
    /// One slot per potential worker (regular + reserve).
    slots: Vec<WorkerSlot>,
    handles: HashMap<usize, Thread>,
    /// Workers spawned so far; indexes `spawned..slots.len()` are the
    /// remaining put-aside reserve.
    spawned: usize,
}

#[derive(Clone, Default)]
struct WorkerSlot {
    executing_since: Option<Instant>,
    site: Option<&'static Location<'static>>,
    /// The watchdog already reported this occupation and drew a
    /// replacement for it.
    stalled: bool,
}

impl Fabric {
    /// A fabric with default settings.
    pub fn new() -> Result<Fabric, FabricBuildError> {
        FabricBuilder::new().build()
    }

    /// Submits `job` to the back of the queue and returns immediately.
    ///
    /// Jobs from one submitter thread are enqueued in submission order;
    /// between threads, order follows the enqueue lock. The job must not
    /// assume any thread affinity.
    #[track_caller]
    pub fn go<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let site = Location::caller();
        self.inner.submit(Job::new(site, Box::new(job)));
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of regular workers (the put-aside reserve not included).
    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    /// Size of the put-aside reserve this fabric was built with.
    pub fn put_aside_worker_count(&self) -> usize {
        self.inner.reserve_count
    }

    /// Workers currently running, activated reserves included.
    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::Acquire)
    }

    /// True once a worker has been lost to a panicking job.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Jobs currently queued (not including in-flight ones).
    pub fn pending_jobs(&self) -> usize {
        self.inner.lock_shared().queue.len()
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("name", &self.inner.name)
            .field("worker_count", &self.inner.worker_count)
            .finish()
    }
}

impl Drop for Fabric {
    fn drop(&mut self) {
        {
            let mut shared = self.inner.lock_shared();
            shared.quit = true;
        }
        self.inner.not_empty.notify_all();

        // Watchdog first, so it cannot observe half-torn-down workers.
        drop(self.watchdog_quit.take());
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.join();
        }

        // Blocks until in-flight jobs complete. A worker lost to a panic
        // surfaces as Err here and was already reported.
        let handles = mem::take(&mut self.inner.lock_shared().handles);
        for (_, handle) in handles {
            let _ = handle.join();
        }

        // Whatever never ran is dropped here, on the shutting-down caller.
        let leftovers: Vec<Job> = self.inner.lock_shared().queue.drain(..).collect();
        drop(leftovers);
    }
}

/// Submits `job` to `fabric`, or runs it inline on the calling thread
/// when `fabric` is `None`.
#[track_caller]
pub fn go<F>(fabric: Option<&Fabric>, job: F)
where
    F: FnOnce() + Send + 'static,
{
    match fabric {
        Some(fabric) => fabric.go(job),
        None => job(),
    }
}

impl Inner {
    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, job: Job) {
        let mut shared = self.lock_shared();
        debug_assert!(!shared.quit, "job submitted to a fabric that is shutting down");
        shared.queue.push_back(job);
        if shared.num_idle > shared.num_notify {
            shared.num_notify += 1;
            self.not_empty.notify_one();
        }
    }

    fn spawn_worker(inner: &Arc<Inner>, index: usize) -> std::io::Result<()> {
        let name = format!("{}/{}", inner.name, index);
        let body_inner = Arc::clone(inner);
        let handle = Thread::spawn_with_stack(&name, inner.stack_size, move || {
            Inner::worker_main(body_inner, index);
        })?;
        let mut shared = inner.lock_shared();
        shared.handles.insert(index, handle);
        shared.spawned += 1;
        Ok(())
    }

    /// Build-failure path: stop and join whatever was already spawned.
    fn terminate_for_build_failure(&self) {
        let handles = {
            let mut shared = self.lock_shared();
            shared.quit = true;
            mem::take(&mut shared.handles)
        };
        self.not_empty.notify_all();
        for (_, handle) in handles {
            let _ = handle.join();
        }
    }

    fn worker_main(inner: Arc<Inner>, index: usize) {
        inner.live_workers.fetch_add(1, Ordering::AcqRel);
        hooks::log_debug(&format!("worker '{}/{}' online", inner.name, index));
        let exit_guard = WorkerExitGuard {
            inner: &inner,
            index,
        };
        inner.worker_loop(index);
        drop(exit_guard);
        hooks::log_debug(&format!("worker '{}/{}' stopped", inner.name, index));
    }

    fn worker_loop(&self, index: usize) {
        let mut shared = self.lock_shared();
        'main: loop {
            // BUSY: drain the queue. In drain mode this keeps going after
            // quit; otherwise quit stops the popping immediately.
            while !(shared.quit && !self.drain_on_quit) {
                let job = match shared.queue.pop_front() {
                    Some(job) => job,
                    None => break,
                };
                shared.slots[index].executing_since = Some(Instant::now());
                shared.slots[index].site = Some(job.site());
                shared.slots[index].stalled = false;
                drop(shared);

                job.execute();

                if let Some(callback) = &self.after_each_job {
                    let _ = unwind::halt_unwinding(|| callback());
                }

                shared = self.lock_shared();
                shared.slots[index] = WorkerSlot::default();
            }

            if shared.quit {
                break 'main;
            }

            // IDLE: wait for a legitimate wakeup.
            shared.num_idle += 1;
            loop {
                shared = self
                    .not_empty
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner);
                if shared.num_notify > 0 {
                    shared.num_notify -= 1;
                    shared.num_idle -= 1;
                    continue 'main;
                }
                if shared.quit {
                    shared.num_idle -= 1;
                    continue 'main;
                }
                // Spurious wakeup; back to sleep.
            }
        }
    }

    /// One watchdog pass over the worker slots: report fresh stalls and
    /// draw from the put-aside reserve to keep the queue draining.
    fn check_stalled_workers(inner: &Arc<Inner>) {
        let now = Instant::now();
        let mut reports = Vec::new();
        let mut activate = Vec::new();
        {
            let mut shared = inner.lock_shared();
            if shared.quit {
                return;
            }
            let slot_count = shared.slots.len();
            for (index, slot) in shared.slots.iter_mut().enumerate() {
                let since = match slot.executing_since {
                    Some(since) => since,
                    None => continue,
                };
                if slot.stalled || now.duration_since(since) < inner.threshold {
                    continue;
                }
                slot.stalled = true;
                reports.push((index, slot.site));
            }
            // The watchdog is the only activator, so reading `spawned`
            // here and spawning after the lock drops cannot race.
            let available = slot_count - shared.spawned;
            for offset in 0..reports.len().min(available) {
                activate.push(shared.spawned + offset);
            }
        }

        for (index, site) in reports {
            let at = site
                .map(|s| format!("{}:{}", s.file(), s.line()))
                .unwrap_or_else(|| "unknown".to_owned());
            hooks::log_warning(&format!(
                "worker '{}/{}' blocked on the job submitted at {} for over {:?}",
                inner.name, index, at, inner.threshold
            ));
        }
        for index in activate {
            match Inner::spawn_worker(inner, index) {
                Ok(()) => hooks::log_info(&format!(
                    "activated put-aside worker '{}/{}'",
                    inner.name, index
                )),
                Err(e) => hooks::log_error(&format!(
                    "failed to activate put-aside worker '{}/{}': {}",
                    inner.name, index, e
                )),
            }
        }
    }
}

/// Runs on every worker exit path. A normal return just retires the
/// worker; an unwind means a job panicked through the worker, which
/// degrades the fabric but does not take down its siblings.
struct WorkerExitGuard<'a> {
    inner: &'a Arc<Inner>,
    index: usize,
}

impl Drop for WorkerExitGuard<'_> {
    fn drop(&mut self) {
        self.inner.live_workers.fetch_sub(1, Ordering::AcqRel);
        if thread::panicking() {
            self.inner.degraded.store(true, Ordering::Release);
            let mut shared = self.inner.lock_shared();
            shared.slots[self.index] = WorkerSlot::default();
            drop(shared);
            hooks::log_error(&format!(
                "worker '{}/{}' terminated by a panicking job; the fabric continues degraded",
                self.inner.name, self.index
            ));
        }
    }
}

fn default_worker_count() -> usize {
    env::var("FABRIC_NUM_WORKERS")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|&count| count > 0)
        .unwrap_or_else(num_cpus::get)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waitgroup::WaitGroup;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submitted_jobs_run() {
        let fabric = FabricBuilder::new()
            .name("smoke")
            .worker_count(2)
            .build()
            .unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new();
        wg.add(16);
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            let wg = wg.clone();
            fabric.go(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn inline_execution_without_a_fabric() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        go(None, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        // Ran on the calling thread, so the effect is visible immediately.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_panicking_job_degrades_but_does_not_stop_the_fabric() {
        let fabric = FabricBuilder::new()
            .name("degrade")
            .worker_count(2)
            .build()
            .unwrap();
        let wg = WaitGroup::new();
        wg.add(1);
        {
            let wg = wg.clone();
            fabric.go(move || {
                let _done_on_unwind = Done(wg);
                panic!("job failure");
            });
        }
        wg.wait();
        // The surviving worker still serves jobs.
        let wg2 = WaitGroup::new();
        wg2.add(4);
        for _ in 0..4 {
            let wg2 = wg2.clone();
            fabric.go(move || wg2.done());
        }
        wg2.wait();

        // The waitgroup retires during the unwind, a moment before the
        // worker's exit guard flags the fabric; give the flag a beat.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !fabric.is_degraded() {
            assert!(Instant::now() < deadline, "degradation never flagged");
            thread::sleep(Duration::from_millis(5));
        }

        struct Done(WaitGroup);
        impl Drop for Done {
            fn drop(&mut self) {
                self.0.done();
            }
        }
    }
}
