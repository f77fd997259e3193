//! Per-thread execution context: the allocator stack, the scratch arena,
//! and the cached scratch reader.
//!
//! A context is created lazily the first time a thread touches it and torn
//! down by the TLS destructor when the thread exits, returning every arena
//! block to the root allocator. A thread that wants to hand a pre-built
//! context to a child (to donate its memory policy) builds a [`Context`],
//! moves it to the child, and has the child install it with [`swap`].

use std::cell::RefCell;
use std::io::{self, Read};
use std::marker::PhantomData;

use crate::memory::{clib, AllocRef, Arena};

/// Upper bound on the per-thread allocator stack depth.
pub const ALLOCATOR_CAPACITY: usize = 1024;

/// The scratch arena reserves blocks of this size.
const SCRATCH_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Per-thread state record.
pub struct Context {
    /// Bounded pushdown stack of allocator handles; the base slot is the
    /// root allocator and is never popped.
    allocator_stack: Vec<AllocRef>,
    pub(crate) scratch_arena: Arena,
    scratch_reader: ReaderState,
}

struct ReaderState {
    buf: Vec<u8>,
    pos: usize,
}

impl Context {
    pub fn new() -> Context {
        Context {
            allocator_stack: vec![clib()],
            scratch_arena: Arena::new(SCRATCH_BLOCK_SIZE, clib()),
            scratch_reader: ReaderState {
                buf: Vec::new(),
                pos: 0,
            },
        }
    }

    /// The thread's current default allocator.
    pub fn allocator_top(&self) -> AllocRef {
        let top = self
            .allocator_stack
            .last()
            .expect("allocator stack always holds its base slot");
        AllocRef::clone(top)
    }

    pub fn allocator_push(&mut self, allocator: AllocRef) {
        assert!(
            self.allocator_stack.len() < ALLOCATOR_CAPACITY,
            "allocator stack overflow"
        );
        self.allocator_stack.push(allocator);
    }

    pub fn allocator_pop(&mut self) {
        assert!(
            self.allocator_stack.len() > 1,
            "the base allocator cannot be popped"
        );
        self.allocator_stack.pop();
    }

    pub fn allocator_depth(&self) -> usize {
        self.allocator_stack.len()
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Box<Context>>> = RefCell::new(None);
}

/// Runs `f` with the calling thread's context, creating it on first use.
///
/// Reentrant use (touching the context again from inside `f`, e.g. through
/// [`crate::memory::tmp`]) panics.
pub fn with<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let ctx = slot.get_or_insert_with(|| Box::new(Context::new()));
        f(ctx)
    })
}

/// Installs `new` as the calling thread's context and returns the one it
/// replaced (freshly created if the thread had none yet).
pub fn swap(new: Box<Context>) -> Box<Context> {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.replace(new)
            .unwrap_or_else(|| Box::new(Context::new()))
    })
}

/// The calling thread's current default allocator: the top of its
/// allocator stack, the root allocator if nothing was pushed.
pub fn allocator_top() -> AllocRef {
    with(|ctx| ctx.allocator_top())
}

/// Pushes `allocator` as the calling thread's default.
pub fn allocator_push(allocator: AllocRef) {
    with(|ctx| ctx.allocator_push(allocator))
}

/// Pops the calling thread's default allocator. The base slot stays.
pub fn allocator_pop() {
    with(|ctx| ctx.allocator_pop())
}

/// Handle to the calling thread's cached scratch reader, a rewindable byte
/// source for transient parsing. Like [`crate::memory::tmp`], the handle
/// is `!Send`.
pub struct TmpReader {
    _not_send: PhantomData<*mut ()>,
}

/// Returns the calling thread's scratch reader. The reader's contents
/// persist on the thread until the next [`reset`](TmpReader::reset).
pub fn reader_tmp() -> TmpReader {
    TmpReader {
        _not_send: PhantomData,
    }
}

impl TmpReader {
    /// Replaces the reader's contents and rewinds it. The previous buffer's
    /// capacity is reused.
    pub fn reset(&mut self, bytes: &[u8]) {
        with(|ctx| {
            let state = &mut ctx.scratch_reader;
            state.buf.clear();
            state.buf.extend_from_slice(bytes);
            state.pos = 0;
        })
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        with(|ctx| {
            let state = &ctx.scratch_reader;
            state.buf.len() - state.pos
        })
    }
}

impl Read for TmpReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        with(|ctx| {
            let state = &mut ctx.scratch_reader;
            let n = (state.buf.len() - state.pos).min(out.len());
            out[..n].copy_from_slice(&state.buf[state.pos..state.pos + n]);
            state.pos += n;
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AllocError, Allocator};
    use std::ptr::NonNull;
    use std::sync::Arc;

    struct Passthrough(AllocRef);

    impl Allocator for Passthrough {
        fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
            self.0.alloc(size, align)
        }
        unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize) {
            self.0.dealloc(ptr, size, align)
        }
    }

    #[test]
    fn base_of_the_stack_is_clib() {
        let top = allocator_top();
        assert!(Arc::ptr_eq(&top, &clib()));
    }

    #[test]
    fn nested_push_pop_restores_the_outer_allocator() {
        let a: AllocRef = Arc::new(Passthrough(clib()));
        let b: AllocRef = Arc::new(Passthrough(clib()));

        allocator_push(Arc::clone(&a));
        {
            allocator_push(Arc::clone(&b));
            assert!(Arc::ptr_eq(&allocator_top(), &b));
            allocator_pop();
        }
        assert!(Arc::ptr_eq(&allocator_top(), &a));
        allocator_pop();
        assert!(Arc::ptr_eq(&allocator_top(), &clib()));
    }

    #[test]
    fn swap_hands_the_context_across() {
        let donated = Box::new(Context::new());
        let donated_ptr = &*donated as *const Context;
        let prior = swap(donated);
        assert_ne!(&*prior as *const Context, donated_ptr);
        // Restore the thread's original context.
        let ours = swap(prior);
        assert_eq!(&*ours as *const Context, donated_ptr);
    }

    #[test]
    #[should_panic(expected = "base allocator cannot be popped")]
    fn popping_the_base_slot_is_a_contract_violation() {
        // A fresh thread so the panic cannot corrupt sibling tests' stacks.
        std::thread::spawn(|| allocator_pop())
            .join()
            .unwrap_or_else(|e| std::panic::resume_unwind(e));
    }

    #[test]
    fn scratch_reader_replays_its_contents() {
        let mut reader = reader_tmp();
        reader.reset(b"a b a\nb c");
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "a b a\nb c");
        assert_eq!(reader.remaining(), 0);
    }
}
