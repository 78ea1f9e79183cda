//! Share lock callbacks
//!
//! libcurl calls these from whichever thread is touching a shared cache
//! entry. The user pointer is the first element of the lock table owned by
//! [`Share`](crate::share::Share), indexed by `curl_lock_data`.

use crate::share::LOCK_SLOTS;
use crate::sync::SharedMutex;
use curl_sys::{CURL, curl_lock_access, curl_lock_data};
use std::ffi::c_void;

fn lock_for<'a>(data: curl_lock_data, user: *mut c_void) -> Option<&'a SharedMutex> {
    // SAFETY: `user` is the table installed through CURLSHOPT_USERDATA, which
    // outlives the share handle and therefore every callback.
    let table = unsafe { (user as *const [SharedMutex; LOCK_SLOTS]).as_ref() }?;
    usize::try_from(data).ok().and_then(|slot| table.get(slot))
}

/// # Safety
///
/// Called by libcurl with the user pointer installed by `Share::new`.
pub(crate) unsafe extern "C" fn share_lock(
    _easy: *mut CURL,
    data: curl_lock_data,
    access: curl_lock_access,
    user: *mut c_void,
) {
    let Some(lock) = lock_for(data, user) else {
        return;
    };

    if access == curl_sys::CURL_LOCK_ACCESS_SHARED {
        lock.lock_shared();
    } else {
        lock.lock();
    }
}

/// # Safety
///
/// Called by libcurl exactly once per matching `share_lock` call.
pub(crate) unsafe extern "C" fn share_unlock(
    _easy: *mut CURL,
    data: curl_lock_data,
    user: *mut c_void,
) {
    let Some(lock) = lock_for(data, user) else {
        return;
    };

    // SAFETY: libcurl pairs every unlock with a preceding lock on the same slot.
    unsafe { lock.unlock() }
}
