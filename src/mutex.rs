//! Named locks that report every state transition to the thread profile
//! hook table.
//!
//! The locks carry no data; they guard whatever the surrounding code says
//! they guard. Acquisition returns an RAII guard, which makes release by a
//! thread that does not hold the lock unrepresentable. The hook sequence
//! around each acquisition is the contract the deadlock detector's
//! wait-for graph is built on: `before_lock` fires on the acquiring
//! thread before it can block, `after_lock` once the lock is held, and
//! `after_unlock` after the OS primitive has been released.

use std::sync::{Mutex as RawMutex, MutexGuard as RawMutexGuard, PoisonError};
use std::sync::{RwLock as RawRwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::hooks::{self, LockTag};

/// A named mutual-exclusion lock with two observable states: free, or
/// held by exactly one thread.
pub struct Mutex {
    tag: LockTag,
    raw: RawMutex<()>,
}

impl Mutex {
    pub fn new(name: &str) -> Mutex {
        let tag = LockTag::new(name);
        hooks::mutex_new(&tag);
        Mutex {
            tag,
            raw: RawMutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.tag.name()
    }

    pub fn tag(&self) -> &LockTag {
        &self.tag
    }

    /// Acquires the lock, blocking until it is free.
    pub fn lock(&self) -> MutexGuard<'_> {
        hooks::mutex_before_lock(&self.tag);
        // The lock holds no data, so a poisoned () is safe to take over.
        let held = self.raw.lock().unwrap_or_else(PoisonError::into_inner);
        hooks::mutex_after_lock(&self.tag);
        MutexGuard {
            lock: self,
            held: Some(held),
        }
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        hooks::mutex_free(&self.tag);
    }
}

pub struct MutexGuard<'a> {
    lock: &'a Mutex,
    held: Option<RawMutexGuard<'a, ()>>,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        // Release before reporting: the unlock hook must observe a free lock.
        self.held.take();
        hooks::mutex_after_unlock(&self.lock.tag);
    }
}

/// A named reader-writer lock: free, held for read by one or more
/// threads, or held for write by exactly one.
pub struct RwMutex {
    tag: LockTag,
    raw: RawRwLock<()>,
}

impl RwMutex {
    pub fn new(name: &str) -> RwMutex {
        let tag = LockTag::new(name);
        hooks::mutex_rw_new(&tag);
        RwMutex {
            tag,
            raw: RawRwLock::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.tag.name()
    }

    pub fn tag(&self) -> &LockTag {
        &self.tag
    }

    /// Acquires the lock shared. The read hooks fire once per shared
    /// acquisition; individual readers are not otherwise tracked.
    pub fn read_lock(&self) -> RwMutexReadGuard<'_> {
        hooks::mutex_before_read_lock(&self.tag);
        let held = self.raw.read().unwrap_or_else(PoisonError::into_inner);
        hooks::mutex_after_read_lock(&self.tag);
        RwMutexReadGuard {
            lock: self,
            held: Some(held),
        }
    }

    /// Acquires the lock exclusive.
    pub fn write_lock(&self) -> RwMutexWriteGuard<'_> {
        hooks::mutex_before_write_lock(&self.tag);
        let held = self.raw.write().unwrap_or_else(PoisonError::into_inner);
        hooks::mutex_after_write_lock(&self.tag);
        RwMutexWriteGuard {
            lock: self,
            held: Some(held),
        }
    }
}

impl Drop for RwMutex {
    fn drop(&mut self) {
        hooks::mutex_rw_free(&self.tag);
    }
}

pub struct RwMutexReadGuard<'a> {
    lock: &'a RwMutex,
    held: Option<RwLockReadGuard<'a, ()>>,
}

impl Drop for RwMutexReadGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        hooks::mutex_after_read_unlock(&self.lock.tag);
    }
}

pub struct RwMutexWriteGuard<'a> {
    lock: &'a RwMutex,
    held: Option<RwLockWriteGuard<'a, ()>>,
}

impl Drop for RwMutexWriteGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        hooks::mutex_after_write_unlock(&self.lock.tag);
    }
}
