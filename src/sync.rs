//! Reader/writer lock for foreign lock/unlock callbacks
//!
//! libcurl's share interface calls a lock function and, later, an unlock
//! function that does not say which mode it is releasing. No guard can live
//! across that boundary, so [`SharedMutex`] exposes explicit lock and unlock
//! calls over a raw `parking_lot` lock and remembers the mode itself.

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as _;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SharedMutex {
    raw: RawRwLock,
    exclusive: AtomicBool,
}

impl SharedMutex {
    pub const fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            exclusive: AtomicBool::new(false),
        }
    }

    /// Acquire exclusive access, blocking until every reader has left.
    pub fn lock(&self) {
        self.raw.lock_exclusive();
        self.exclusive.store(true, Ordering::Release);
    }

    /// Acquire shared access.
    pub fn lock_shared(&self) {
        self.raw.lock_shared();
    }

    pub fn try_lock(&self) -> bool {
        let locked = self.raw.try_lock_exclusive();
        if locked {
            self.exclusive.store(true, Ordering::Release);
        }
        locked
    }

    pub fn try_lock_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    /// Release whichever mode the current holder acquired.
    ///
    /// # Safety
    ///
    /// The calling context must hold the lock, through one matching
    /// [`lock`](Self::lock) or [`lock_shared`](Self::lock_shared) call that
    /// has not been released yet.
    pub unsafe fn unlock(&self) {
        // The flag can only be set while the exclusive holder is the sole owner.
        if self.exclusive.swap(false, Ordering::AcqRel) {
            unsafe { self.raw.unlock_exclusive() }
        } else {
            unsafe { self.raw.unlock_shared() }
        }
    }
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}
