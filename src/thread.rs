//! Named OS thread handles.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::hooks;

/// An OS thread carrying a stable name.
///
/// The name is set on the OS thread (surfacing in debuggers where the
/// platform supports it) and reported through the thread profile hook
/// table from the new thread itself, before its body runs.
pub struct Thread {
    name: String,
    handle: JoinHandle<()>,
}

impl Thread {
    pub fn spawn<F>(name: &str, body: F) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        Thread::spawn_with_stack(name, None, body)
    }

    /// Like [`spawn`](Thread::spawn) with an explicit stack size.
    pub fn spawn_with_stack<F>(name: &str, stack_size: Option<usize>, body: F) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.to_owned();
        let hook_name = name.clone();
        let mut builder = thread::Builder::new().name(name.clone());
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || {
            hooks::thread_new(thread::current().id(), &hook_name);
            body();
        })?;
        Ok(Thread { name, handle })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until the thread's body returns. A panic that escaped the
    /// body is surfaced as the `Err` payload.
    pub fn join(self) -> thread::Result<()> {
        self.handle.join()
    }
}

/// Puts the calling thread to sleep for `ms` milliseconds.
pub fn sleep(ms: u64) {
    thread::sleep(Duration::from_millis(ms));
}
