//! Type-erased owned jobs.

use std::fmt;
use std::panic::Location;

/// An owned, zero-argument, zero-result callable plus the source location
/// that submitted it.
///
/// Ownership moves to the fabric on submission. A job is dropped right
/// after it executes on a worker, or unexecuted on the shutting-down
/// caller when the queue is discarded.
pub(crate) struct Job {
    call: Box<dyn FnOnce() + Send>,
    site: &'static Location<'static>,
}

impl Job {
    pub(crate) fn new(site: &'static Location<'static>, call: Box<dyn FnOnce() + Send>) -> Job {
        Job { call, site }
    }

    pub(crate) fn site(&self) -> &'static Location<'static> {
        self.site
    }

    pub(crate) fn execute(self) {
        (self.call)()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job submitted at {}:{}", self.site.file(), self.site.line())
    }
}
