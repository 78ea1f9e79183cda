//! Shared DNS, TLS session and connection cache
//!
//! One [`Share`] exists per running engine. Every easy handle the engine
//! creates points at it through `CURLOPT_SHARE`, so resolutions, TLS
//! sessions and idle connections are reused across handles. Cookies are not
//! shared: handles may serve unrelated logical sessions.

use crate::callback::{share_lock, share_unlock};
use crate::error::Error;
use crate::handle::ShareHandle;
use crate::sync::SharedMutex;
use curl_sys::{CURL, CURLSHcode, curl_lock_access, curl_lock_data};
use std::ffi::c_void;

/// One lock per `curl_lock_data` category, indexed by the category value.
pub(crate) const LOCK_SLOTS: usize = 8;

type LockFn = unsafe extern "C" fn(*mut CURL, curl_lock_data, curl_lock_access, *mut c_void);
type UnlockFn = unsafe extern "C" fn(*mut CURL, curl_lock_data, *mut c_void);

pub(crate) struct Share {
    // Dropped before `locks`: cleanup may still call into the callbacks.
    handle: ShareHandle,
    locks: Box<[SharedMutex; LOCK_SLOTS]>,
}

impl Share {
    pub(crate) fn new() -> Result<Self, Error> {
        let handle = ShareHandle::init()
            .ok_or_else(|| Error::Share("curl_share_init returned null".to_string()))?;
        let locks = Box::new(std::array::from_fn(|_| SharedMutex::new()));

        let share = Self { handle, locks };
        share.setopt_ptr(
            curl_sys::CURLSHOPT_USERDATA,
            share.locks.as_ptr() as *mut c_void,
        )?;
        share.setopt_callbacks()?;
        for data in [
            curl_sys::CURL_LOCK_DATA_DNS,
            curl_sys::CURL_LOCK_DATA_SSL_SESSION,
            curl_sys::CURL_LOCK_DATA_CONNECT,
        ] {
            share.setopt_data(data)?;
        }
        Ok(share)
    }

    pub(crate) fn as_raw(&self) -> *mut curl_sys::CURLSH {
        self.handle.as_raw()
    }

    fn setopt_callbacks(&self) -> Result<(), Error> {
        let lock: LockFn = share_lock;
        let unlock: UnlockFn = share_unlock;
        let code = unsafe {
            curl_sys::curl_share_setopt(self.as_raw(), curl_sys::CURLSHOPT_LOCKFUNC, lock)
        };
        check(code, "CURLSHOPT_LOCKFUNC")?;
        let code = unsafe {
            curl_sys::curl_share_setopt(self.as_raw(), curl_sys::CURLSHOPT_UNLOCKFUNC, unlock)
        };
        check(code, "CURLSHOPT_UNLOCKFUNC")
    }

    fn setopt_ptr(&self, option: curl_sys::CURLSHoption, value: *mut c_void) -> Result<(), Error> {
        let code = unsafe { curl_sys::curl_share_setopt(self.as_raw(), option, value) };
        check(code, "CURLSHOPT_USERDATA")
    }

    fn setopt_data(&self, data: curl_lock_data) -> Result<(), Error> {
        let code = unsafe {
            curl_sys::curl_share_setopt(self.as_raw(), curl_sys::CURLSHOPT_SHARE, data)
        };
        check(code, "CURLSHOPT_SHARE")
    }
}

fn check(code: CURLSHcode, what: &str) -> Result<(), Error> {
    if code == curl_sys::CURLSHE_OK {
        Ok(())
    } else {
        Err(Error::Share(format!("{what} failed with code {code}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_setup() {
        let share = Share::new().expect("share handle");
        assert!(!share.as_raw().is_null());
        for lock in share.locks.iter() {
            assert!(lock.try_lock_shared());
            unsafe { lock.unlock() };
        }
    }
}
