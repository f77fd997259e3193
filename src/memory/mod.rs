//! Memory allocation policy: the allocator interface, the root C-runtime
//! allocator, and the per-thread scratch arena accessor.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::context;
use crate::hooks;

mod arena;
pub use self::arena::Arena;

/// Error returned when an allocator cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    size: usize,
    align: usize,
}

impl AllocError {
    pub(crate) fn new(size: usize, align: usize) -> AllocError {
        AllocError { size, align }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "allocation of {} bytes (align {}) failed",
            self.size, self.align
        )
    }
}

impl std::error::Error for AllocError {}

/// An allocator installable as a thread's default through the allocator
/// stack.
///
/// Implementations are expected to be thread-safe unless their docs say
/// otherwise; the scratch arena is the deliberate exception and therefore
/// never appears behind this trait.
pub trait Allocator: Send + Sync {
    /// Allocates `size` bytes aligned to `align`. `align` must be a power
    /// of two.
    fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError>;

    /// Returns a region to the allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been obtained from `alloc(size, align)` on this same
    /// allocator and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize);
}

/// Refcounted allocator handle. A child allocator stays alive exactly as
/// long as some handle references it; the root allocator is never dropped.
pub type AllocRef = Arc<dyn Allocator>;

/// The root allocator, backed by the C runtime heap via `std::alloc`.
/// Every allocation and deallocation is reported to the memory profile
/// hook table.
struct Clib;

impl Allocator for Clib {
    fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            // A dangling, well-aligned pointer; never dereferenced, never freed.
            return Ok(unsafe { NonNull::new_unchecked(align.max(1) as *mut u8) });
        }
        let layout = Layout::from_size_align(size, align).map_err(|_| AllocError::new(size, align))?;
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(region) => {
                hooks::profile_alloc(ptr, size);
                Ok(region)
            }
            None => Err(AllocError::new(size, align)),
        }
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        if size == 0 {
            return;
        }
        hooks::profile_free(ptr.as_ptr(), size);
        alloc::dealloc(ptr.as_ptr(), Layout::from_size_align_unchecked(size, align));
    }
}

/// Returns a handle to the root allocator. This is the base of every
/// thread's allocator stack.
pub fn clib() -> AllocRef {
    static CLIB: OnceLock<AllocRef> = OnceLock::new();
    Arc::clone(CLIB.get_or_init(|| Arc::new(Clib)))
}

/// Zero-sized accessor for the calling thread's scratch arena.
///
/// Deliberately `!Send`: scratch regions are owned by one thread and the
/// handle must not be smuggled to another.
#[derive(Clone, Copy)]
pub struct Scratch {
    _not_send: PhantomData<*mut ()>,
}

/// Returns the calling thread's scratch arena.
///
/// Regions handed out by the arena are valid only until the next
/// [`clear_all`](Scratch::clear_all) on the same thread.
pub fn tmp() -> Scratch {
    Scratch {
        _not_send: PhantomData,
    }
}

impl Scratch {
    /// Bump-allocates `size` bytes aligned to `align` from the thread's
    /// scratch arena.
    pub fn alloc(self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        context::with(|ctx| ctx.scratch_arena.alloc(size, align))
    }

    /// Copies `bytes` into the scratch arena and returns the copy's
    /// address. The region is exactly `bytes.len()` long.
    pub fn alloc_bytes(self, bytes: &[u8]) -> Result<NonNull<u8>, AllocError> {
        context::with(|ctx| ctx.scratch_arena.alloc_bytes(bytes))
    }

    /// Invalidates every region handed out since the last clear. The
    /// arena's blocks are retained, so subsequent allocations reuse the
    /// same backing memory.
    pub fn clear_all(self) {
        context::with(|ctx| ctx.scratch_arena.clear_all())
    }

    /// Bytes handed out since the last clear.
    pub fn used(self) -> usize {
        context::with(|ctx| ctx.scratch_arena.used())
    }

    /// Total backing capacity currently held by the arena.
    pub fn capacity(self) -> usize {
        context::with(|ctx| ctx.scratch_arena.capacity())
    }

    /// Number of backing blocks currently held.
    pub fn block_count(self) -> usize {
        context::with(|ctx| ctx.scratch_arena.block_count())
    }

    /// High-water mark of `used` over the arena's lifetime.
    pub fn peak(self) -> usize {
        context::with(|ctx| ctx.scratch_arena.peak())
    }
}
