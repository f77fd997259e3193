//! Foundation primitives beneath the standard runtime: memory allocation
//! policy, task-based concurrency, synchronization, and the diagnostics
//! to see through all three.
//!
//! The centerpiece is the [`Fabric`], a cooperative task dispatcher: a
//! fixed set of worker threads drains a shared FIFO queue of submitted
//! closures. Around it sit the per-thread execution [`context`] (an
//! allocator stack plus a bump-allocated scratch arena), named
//! synchronization primitives ([`Mutex`], [`RwMutex`], [`WaitGroup`]),
//! and a process-wide [`hooks`] registry through which every memory, log,
//! and lock event can be observed. A deadlock watchdog subscribes to the
//! lock hooks, maintains the wait-for graph, and reports cycles through
//! the `critical` log hook without ever aborting the process.
//!
//! ```
//! use fabric_core::{FabricBuilder, WaitGroup};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let fabric = FabricBuilder::new().worker_count(4).build().unwrap();
//! let counter = Arc::new(AtomicUsize::new(0));
//! let wg = WaitGroup::new();
//!
//! wg.add(100);
//! for _ in 0..100 {
//!     let counter = Arc::clone(&counter);
//!     let wg = wg.clone();
//!     fabric.go(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!         wg.done();
//!     });
//! }
//! wg.wait();
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//! ```

#![doc(html_root_url = "https://docs.rs/fabric-core/0.3.2")]
#![warn(rust_2018_idioms)]

use std::error::Error;
use std::fmt;
use std::io;

pub mod context;
pub mod hooks;
pub mod memory;

mod deadlock;
mod fabric;
mod job;
mod mutex;
mod thread;
mod unwind;
mod waitgroup;

pub use crate::context::{
    allocator_pop, allocator_push, allocator_top, reader_tmp, Context, TmpReader,
    ALLOCATOR_CAPACITY,
};
pub use crate::fabric::{go, Fabric, FabricBuilder};
pub use crate::hooks::{
    disable_profiling_for_this_thread, log_interface_set, memory_profile_interface_set,
    thread_profile_interface_set, LockTag, LogInterface, MemoryProfileInterface,
    ThreadProfileInterface,
};
pub use crate::memory::{clib, tmp, AllocError, AllocRef, Allocator, Arena, Scratch};
pub use crate::mutex::{Mutex, MutexGuard, RwMutex, RwMutexReadGuard, RwMutexWriteGuard};
pub use crate::thread::{sleep, Thread};
pub use crate::waitgroup::WaitGroup;

/// Error when constructing a fabric.
#[derive(Debug)]
pub struct FabricBuildError {
    kind: ErrorKind,
}

#[derive(Debug)]
enum ErrorKind {
    IOError(io::Error),
}

impl FabricBuildError {
    pub(crate) fn new(kind: ErrorKind) -> FabricBuildError {
        FabricBuildError { kind }
    }
}

impl Error for FabricBuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self.kind {
            ErrorKind::IOError(ref e) => Some(e),
        }
    }
}

impl fmt::Display for FabricBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::IOError(ref e) => e.fmt(f),
        }
    }
}
