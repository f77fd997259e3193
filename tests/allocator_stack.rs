use std::ptr::NonNull;
use std::sync::Arc;

use fabric_core::{
    allocator_pop, allocator_push, allocator_top, clib, AllocError, AllocRef, Allocator,
};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

/// Pass-through allocator distinguishable by identity.
struct Labeled(AllocRef);

impl Allocator for Labeled {
    fn alloc(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        self.0.alloc(size, align)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        self.0.dealloc(ptr, size, align)
    }
}

fn labeled() -> AllocRef {
    Arc::new(Labeled(clib()))
}

#[test]
fn nested_scopes_restore_the_outer_top() {
    let a = labeled();
    let b = labeled();

    allocator_push(Arc::clone(&a));
    {
        // Nested code installs and removes its own default.
        allocator_push(Arc::clone(&b));
        assert!(Arc::ptr_eq(&allocator_top(), &b));
        allocator_pop();
    }
    assert!(
        Arc::ptr_eq(&allocator_top(), &a),
        "the outer scope's allocator must be restored"
    );
    allocator_pop();
    assert!(Arc::ptr_eq(&allocator_top(), &clib()));
}

#[test]
fn balanced_random_sequences_preserve_the_top() {
    let mut rng = XorShiftRng::seed_from_u64(0x5eed_cafe);
    for _trial in 0..32 {
        let baseline = allocator_top();
        let mut depth = 0usize;
        for _ in 0..200 {
            if depth > 0 && rng.gen_bool(0.5) {
                allocator_pop();
                depth -= 1;
            } else if depth < 64 {
                allocator_push(labeled());
                depth += 1;
            }
        }
        for _ in 0..depth {
            allocator_pop();
        }
        assert!(Arc::ptr_eq(&allocator_top(), &baseline));
    }
}

#[test]
fn pushed_allocator_serves_the_thread() {
    let a = labeled();
    allocator_push(Arc::clone(&a));
    let region = allocator_top().alloc(64, 8).unwrap();
    unsafe {
        allocator_top().dealloc(region, 64, 8);
    }
    allocator_pop();
}
