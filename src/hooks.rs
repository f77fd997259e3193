//! Process-wide profiling hook tables.
//!
//! Three independent tables — memory, log, and thread — can be installed at
//! runtime. Primitives report every relevant event to the current table;
//! an absent table is a no-op. Each `*_interface_set` call returns the
//! previously installed table so that interfaces compose: a new table can
//! record an event and then forward it to the table it displaced.
//!
//! Installation is a release store of the table pointer and every dispatch
//! is an acquire load; an in-flight hook call may observe either the old or
//! the new table, so callers must not rely on atomic replacement.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::thread::ThreadId;

use crate::unwind;

/// Stable identity of a named lock, handed to every thread-profile hook
/// concerning that lock.
///
/// The numeric id is unique for the lifetime of the process; two locks
/// sharing a name remain distinguishable, and an id is never reused even
/// after the lock is freed.
pub struct LockTag {
    id: usize,
    name: Box<str>,
}

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(1);

impl LockTag {
    pub(crate) fn new(name: &str) -> LockTag {
        LockTag {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Hooks invoked on every allocation and deallocation that goes through the
/// root allocator.
pub trait MemoryProfileInterface: Sync {
    fn alloc(&self, _ptr: *mut u8, _size: usize) {}
    fn free(&self, _ptr: *mut u8, _size: usize) {}
}

/// Hooks giving the runtime (and its users) a unified logging surface.
///
/// The default table forwards each level to the `log` facade.
pub trait LogInterface: Sync {
    fn debug(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}
    fn critical(&self, _msg: &str) {}
}

/// Hooks bracketing thread creation and every lock state transition.
///
/// `*_before_lock` fires before the OS primitive is acquired and
/// `*_after_lock` after it; this bracket is the one place a hook runs
/// adjacent to the primitive's own blocking, and it is the contract the
/// deadlock wait-for graph is built on. The boolean returned from a
/// `before` hook is advisory (a detector may vote "abort"); the lock
/// operation is performed regardless.
pub trait ThreadProfileInterface: Sync {
    /// Reported from the newly spawned thread, before its body runs.
    fn thread_new(&self, _thread: ThreadId, _name: &str) {}

    fn mutex_new(&self, _mutex: &LockTag) {}
    fn mutex_free(&self, _mutex: &LockTag) {}
    fn mutex_before_lock(&self, _mutex: &LockTag) -> bool {
        true
    }
    fn mutex_after_lock(&self, _mutex: &LockTag) {}
    fn mutex_after_unlock(&self, _mutex: &LockTag) {}

    fn mutex_rw_new(&self, _mutex: &LockTag) {}
    fn mutex_rw_free(&self, _mutex: &LockTag) {}
    fn mutex_before_read_lock(&self, _mutex: &LockTag) -> bool {
        true
    }
    fn mutex_after_read_lock(&self, _mutex: &LockTag) {}
    fn mutex_after_read_unlock(&self, _mutex: &LockTag) {}
    fn mutex_before_write_lock(&self, _mutex: &LockTag) -> bool {
        true
    }
    fn mutex_after_write_lock(&self, _mutex: &LockTag) {}
    fn mutex_after_write_unlock(&self, _mutex: &LockTag) {}
}

struct NoopMemoryProfile;
impl MemoryProfileInterface for NoopMemoryProfile {}
static NOOP_MEMORY: NoopMemoryProfile = NoopMemoryProfile;

struct NoopThreadProfile;
impl ThreadProfileInterface for NoopThreadProfile {}
static NOOP_THREAD: NoopThreadProfile = NoopThreadProfile;

/// Default log table: forwards to the `log` facade under the "fabric"
/// target, mapping `critical` onto the facade's error level.
struct FacadeLog;
impl LogInterface for FacadeLog {
    fn debug(&self, msg: &str) {
        log::debug!(target: "fabric", "{}", msg);
    }
    fn info(&self, msg: &str) {
        log::info!(target: "fabric", "{}", msg);
    }
    fn warning(&self, msg: &str) {
        log::warn!(target: "fabric", "{}", msg);
    }
    fn error(&self, msg: &str) {
        log::error!(target: "fabric", "{}", msg);
    }
    fn critical(&self, msg: &str) {
        log::error!(target: "fabric", "critical: {}", msg);
    }
}
static FACADE_LOG: FacadeLog = FacadeLog;

// Fat trait-object pointers do not fit in an `AtomicPtr`, so each table is
// stored as a thin pointer to a leaked slot holding the wide reference. One
// slot leaks per set call, which keeps every table ever installed valid for
// in-flight readers.
struct MemorySlot(&'static dyn MemoryProfileInterface);
struct LogSlot(&'static dyn LogInterface);
struct ThreadSlot(&'static dyn ThreadProfileInterface);

static MEMORY_TABLE: AtomicPtr<MemorySlot> = AtomicPtr::new(ptr::null_mut());
static LOG_TABLE: AtomicPtr<LogSlot> = AtomicPtr::new(ptr::null_mut());
static THREAD_TABLE: AtomicPtr<ThreadSlot> = AtomicPtr::new(ptr::null_mut());

/// Installs `new` as the process-wide memory profile table and returns the
/// table it replaced.
pub fn memory_profile_interface_set(
    new: &'static dyn MemoryProfileInterface,
) -> &'static dyn MemoryProfileInterface {
    let slot = Box::into_raw(Box::new(MemorySlot(new)));
    let prev = MEMORY_TABLE.swap(slot, Ordering::AcqRel);
    if prev.is_null() {
        &NOOP_MEMORY
    } else {
        unsafe { (*prev).0 }
    }
}

/// Installs `new` as the process-wide log table and returns the table it
/// replaced.
pub fn log_interface_set(new: &'static dyn LogInterface) -> &'static dyn LogInterface {
    let slot = Box::into_raw(Box::new(LogSlot(new)));
    let prev = LOG_TABLE.swap(slot, Ordering::AcqRel);
    if prev.is_null() {
        &FACADE_LOG
    } else {
        unsafe { (*prev).0 }
    }
}

/// Installs `new` as the process-wide thread profile table and returns the
/// table it replaced.
pub fn thread_profile_interface_set(
    new: &'static dyn ThreadProfileInterface,
) -> &'static dyn ThreadProfileInterface {
    let slot = Box::into_raw(Box::new(ThreadSlot(new)));
    let prev = THREAD_TABLE.swap(slot, Ordering::AcqRel);
    if prev.is_null() {
        &NOOP_THREAD
    } else {
        unsafe { (*prev).0 }
    }
}

fn memory_table() -> &'static dyn MemoryProfileInterface {
    let p = MEMORY_TABLE.load(Ordering::Acquire);
    if p.is_null() {
        &NOOP_MEMORY
    } else {
        unsafe { (*p).0 }
    }
}

fn log_table() -> &'static dyn LogInterface {
    let p = LOG_TABLE.load(Ordering::Acquire);
    if p.is_null() {
        &FACADE_LOG
    } else {
        unsafe { (*p).0 }
    }
}

fn thread_table() -> &'static dyn ThreadProfileInterface {
    let p = THREAD_TABLE.load(Ordering::Acquire);
    if p.is_null() {
        &NOOP_THREAD
    } else {
        unsafe { (*p).0 }
    }
}

thread_local! {
    static PROFILING_DISABLED: Cell<bool> = Cell::new(false);
}

/// Opts the calling thread out of memory and thread profiling. Used by
/// runtime-internal threads whose lock traffic would only pollute the
/// diagnostics; log hooks are unaffected.
pub fn disable_profiling_for_this_thread() {
    PROFILING_DISABLED.with(|flag| flag.set(true));
}

fn profiling_disabled() -> bool {
    PROFILING_DISABLED.with(Cell::get)
}

// Dispatch helpers. Hooks must not unwind into the primitive that fired
// them; a panicking hook is swallowed here.

pub(crate) fn profile_alloc(ptr: *mut u8, size: usize) {
    if profiling_disabled() {
        return;
    }
    let table = memory_table();
    let _ = unwind::halt_unwinding(|| table.alloc(ptr, size));
}

pub(crate) fn profile_free(ptr: *mut u8, size: usize) {
    if profiling_disabled() {
        return;
    }
    let table = memory_table();
    let _ = unwind::halt_unwinding(|| table.free(ptr, size));
}

pub(crate) fn log_debug(msg: &str) {
    let table = log_table();
    let _ = unwind::halt_unwinding(|| table.debug(msg));
}

pub(crate) fn log_info(msg: &str) {
    let table = log_table();
    let _ = unwind::halt_unwinding(|| table.info(msg));
}

pub(crate) fn log_warning(msg: &str) {
    let table = log_table();
    let _ = unwind::halt_unwinding(|| table.warning(msg));
}

pub(crate) fn log_error(msg: &str) {
    let table = log_table();
    let _ = unwind::halt_unwinding(|| table.error(msg));
}

pub(crate) fn log_critical(msg: &str) {
    let table = log_table();
    let _ = unwind::halt_unwinding(|| table.critical(msg));
}

pub(crate) fn thread_new(thread: ThreadId, name: &str) {
    if profiling_disabled() {
        return;
    }
    let table = thread_table();
    let _ = unwind::halt_unwinding(|| table.thread_new(thread, name));
}

macro_rules! lock_event {
    ($name:ident) => {
        pub(crate) fn $name(tag: &LockTag) {
            if profiling_disabled() {
                return;
            }
            let table = thread_table();
            let _ = unwind::halt_unwinding(|| table.$name(tag));
        }
    };
    ($name:ident -> bool) => {
        pub(crate) fn $name(tag: &LockTag) -> bool {
            if profiling_disabled() {
                return true;
            }
            let table = thread_table();
            unwind::halt_unwinding(|| table.$name(tag)).unwrap_or(true)
        }
    };
}

lock_event!(mutex_new);
lock_event!(mutex_free);
lock_event!(mutex_before_lock -> bool);
lock_event!(mutex_after_lock);
lock_event!(mutex_after_unlock);
lock_event!(mutex_rw_new);
lock_event!(mutex_rw_free);
lock_event!(mutex_before_read_lock -> bool);
lock_event!(mutex_after_read_lock);
lock_event!(mutex_after_read_unlock);
lock_event!(mutex_before_write_lock -> bool);
lock_event!(mutex_after_write_lock);
lock_event!(mutex_after_write_unlock);
