//! Lock wait-for graph and cycle reporting.
//!
//! The detector is a thread profile table: `before_lock` records that the
//! calling thread waits on a lock, `after_lock` converts the wait into an
//! ownership record, and the unlock hooks retire ownership. The fabric
//! watchdog periodically asks for a cycle scan; any cycle spanning two or
//! more threads is reported once through the `critical` log hook, naming
//! every participating thread and lock. The detector is advisory only —
//! it never aborts the process, and every event is forwarded to the table
//! it displaced at installation.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use crate::hooks::{self, LockTag, ThreadProfileInterface};

type LockId = usize;

#[derive(Default)]
struct Graph {
    /// Thread -> the lock it is currently blocked acquiring.
    waits_for: HashMap<ThreadId, LockId>,
    /// Lock -> its current owner(s).
    owners: HashMap<LockId, Owner>,
    thread_names: HashMap<ThreadId, String>,
    lock_names: HashMap<LockId, String>,
    /// Normalized signatures of cycles already reported; an entry retires
    /// once its cycle dissolves, so a persisting deadlock logs once.
    reported: HashSet<Vec<LockId>>,
}

enum Owner {
    Writer(ThreadId),
    /// One entry per shared acquisition; a thread holding two read guards
    /// appears twice.
    Readers(Vec<ThreadId>),
}

pub(crate) struct DeadlockDetector {
    graph: Mutex<Graph>,
    forward: OnceLock<&'static dyn ThreadProfileInterface>,
}

impl DeadlockDetector {
    pub(crate) fn new() -> DeadlockDetector {
        DeadlockDetector {
            graph: Mutex::new(Graph::default()),
            forward: OnceLock::new(),
        }
    }

    /// Installs the process-wide detector in front of whatever thread
    /// profile table is currently active. Idempotent; every fabric calls
    /// this at creation.
    pub(crate) fn install() -> &'static DeadlockDetector {
        static INSTALLED: OnceLock<&'static DeadlockDetector> = OnceLock::new();
        *INSTALLED.get_or_init(|| {
            let detector: &'static DeadlockDetector = Box::leak(Box::new(DeadlockDetector::new()));
            let prev = hooks::thread_profile_interface_set(detector);
            let _ = detector.forward.set(prev);
            detector
        })
    }

    /// Runs the cycle search and routes fresh findings to the `critical`
    /// log hook. Messages are emitted after the graph lock is released so
    /// a log table is free to take hooked locks of its own.
    pub(crate) fn scan(&self) {
        let fresh = {
            let mut graph = self.lock_graph();
            graph.collect_fresh_cycles()
        };
        for message in &fresh {
            hooks::log_critical(message);
        }
    }

    fn lock_graph(&self) -> std::sync::MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forward(&self) -> Option<&'static dyn ThreadProfileInterface> {
        self.forward.get().copied()
    }

    /// The calling thread's graph key, naming it on first contact.
    fn self_key(graph: &mut Graph) -> ThreadId {
        let current = thread::current();
        let id = current.id();
        if !graph.thread_names.contains_key(&id) {
            let name = current
                .name()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{:?}", id));
            graph.thread_names.insert(id, name);
        }
        id
    }
}

impl ThreadProfileInterface for DeadlockDetector {
    fn thread_new(&self, thread: ThreadId, name: &str) {
        self.lock_graph().thread_names.insert(thread, name.to_owned());
        if let Some(fwd) = self.forward() {
            fwd.thread_new(thread, name);
        }
    }

    fn mutex_new(&self, mutex: &LockTag) {
        self.lock_graph()
            .lock_names
            .insert(mutex.id(), mutex.name().to_owned());
        if let Some(fwd) = self.forward() {
            fwd.mutex_new(mutex);
        }
    }

    fn mutex_free(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        graph.owners.remove(&mutex.id());
        graph.lock_names.remove(&mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_free(mutex);
        }
    }

    fn mutex_before_lock(&self, mutex: &LockTag) -> bool {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.insert(me, mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_before_lock(mutex);
        }
        true
    }

    fn mutex_after_lock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.remove(&me);
        graph.owners.insert(mutex.id(), Owner::Writer(me));
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_lock(mutex);
        }
    }

    fn mutex_after_unlock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        graph.owners.remove(&mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_unlock(mutex);
        }
    }

    fn mutex_rw_new(&self, mutex: &LockTag) {
        self.lock_graph()
            .lock_names
            .insert(mutex.id(), mutex.name().to_owned());
        if let Some(fwd) = self.forward() {
            fwd.mutex_rw_new(mutex);
        }
    }

    fn mutex_rw_free(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        graph.owners.remove(&mutex.id());
        graph.lock_names.remove(&mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_rw_free(mutex);
        }
    }

    fn mutex_before_read_lock(&self, mutex: &LockTag) -> bool {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.insert(me, mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_before_read_lock(mutex);
        }
        true
    }

    fn mutex_after_read_lock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.remove(&me);
        match graph.owners.entry(mutex.id()).or_insert_with(|| Owner::Readers(Vec::new())) {
            Owner::Readers(readers) => readers.push(me),
            // A writer record can linger if lock and unlock hooks raced;
            // shared ownership supersedes it.
            slot => *slot = Owner::Readers(vec![me]),
        }
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_read_lock(mutex);
        }
    }

    fn mutex_after_read_unlock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        let me = thread::current().id();
        let empty = match graph.owners.get_mut(&mutex.id()) {
            Some(Owner::Readers(readers)) => {
                if let Some(at) = readers.iter().position(|r| *r == me) {
                    readers.swap_remove(at);
                }
                readers.is_empty()
            }
            _ => false,
        };
        if empty {
            graph.owners.remove(&mutex.id());
        }
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_read_unlock(mutex);
        }
    }

    fn mutex_before_write_lock(&self, mutex: &LockTag) -> bool {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.insert(me, mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_before_write_lock(mutex);
        }
        true
    }

    fn mutex_after_write_lock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        let me = DeadlockDetector::self_key(&mut graph);
        graph.waits_for.remove(&me);
        graph.owners.insert(mutex.id(), Owner::Writer(me));
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_write_lock(mutex);
        }
    }

    fn mutex_after_write_unlock(&self, mutex: &LockTag) {
        let mut graph = self.lock_graph();
        graph.owners.remove(&mutex.id());
        drop(graph);
        if let Some(fwd) = self.forward() {
            fwd.mutex_after_write_unlock(mutex);
        }
    }
}

impl Graph {
    /// Finds every cycle not yet reported, retires the signatures of
    /// cycles that have dissolved, and renders fresh ones into report
    /// messages.
    fn collect_fresh_cycles(&mut self) -> Vec<String> {
        let mut live = HashSet::new();
        let mut fresh = Vec::new();

        let starts: Vec<ThreadId> = self.waits_for.keys().copied().collect();
        for start in starts {
            if let Some((threads, locks)) = self.cycle_from(start) {
                if threads.len() < 2 {
                    // A thread re-acquiring its own lock is not a
                    // cross-thread cycle; leave it to the OS primitive.
                    continue;
                }
                let mut signature: Vec<LockId> = locks.clone();
                signature.sort_unstable();
                if live.insert(signature.clone()) && !self.reported.contains(&signature) {
                    fresh.push(self.describe(&threads, &locks));
                    self.reported.insert(signature);
                }
            }
        }

        self.reported.retain(|sig| live.contains(sig));
        fresh
    }

    /// Depth-first walk from `start` along thread -> awaited lock ->
    /// owning thread edges. Returns the cycle's threads and locks in wait
    /// order when the walk closes back on `start`.
    fn cycle_from(&self, start: ThreadId) -> Option<(Vec<ThreadId>, Vec<LockId>)> {
        let mut threads = vec![start];
        let mut locks = Vec::new();
        let mut visited: HashSet<ThreadId> = [start].iter().copied().collect();
        if self.dfs(start, start, &mut threads, &mut locks, &mut visited) {
            Some((threads, locks))
        } else {
            None
        }
    }

    fn dfs(
        &self,
        at: ThreadId,
        start: ThreadId,
        threads: &mut Vec<ThreadId>,
        locks: &mut Vec<LockId>,
        visited: &mut HashSet<ThreadId>,
    ) -> bool {
        let awaited = match self.waits_for.get(&at) {
            Some(lock) => *lock,
            None => return false,
        };
        let owners: Vec<ThreadId> = match self.owners.get(&awaited) {
            Some(Owner::Writer(t)) => vec![*t],
            Some(Owner::Readers(readers)) => readers.clone(),
            None => return false,
        };

        locks.push(awaited);
        for owner in owners {
            if owner == start && locks.len() > 1 {
                return true;
            }
            if owner != at && visited.insert(owner) {
                threads.push(owner);
                if self.dfs(owner, start, threads, locks, visited) {
                    return true;
                }
                threads.pop();
            }
        }
        locks.pop();
        false
    }

    fn describe(&self, threads: &[ThreadId], locks: &[LockId]) -> String {
        let mut message = String::from("deadlock suspected: ");
        for (i, (thread, lock)) in threads.iter().zip(locks.iter()).enumerate() {
            if i > 0 {
                message.push_str("; ");
            }
            let waiter = self.thread_name(thread);
            let holder = self.thread_name(&threads[(i + 1) % threads.len()]);
            message.push_str(&format!(
                "thread '{}' waits on lock '{}' held by thread '{}'",
                waiter,
                self.lock_name(lock),
                holder,
            ));
        }
        message
    }

    fn thread_name(&self, thread: &ThreadId) -> String {
        self.thread_names
            .get(thread)
            .cloned()
            .unwrap_or_else(|| format!("{:?}", thread))
    }

    fn lock_name(&self, lock: &LockId) -> String {
        self.lock_names
            .get(lock)
            .cloned()
            .unwrap_or_else(|| format!("lock#{}", lock))
    }
}
