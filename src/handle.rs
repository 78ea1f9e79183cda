//! Owner of the raw `CURLSH`
//!
//! The `curl` crate wraps easy and multi handles but not the share
//! interface. [`ShareHandle`] pairs `curl_share_init` with
//! `curl_share_cleanup`; the options and lock table live in
//! [`Share`](crate::share::Share).

use std::ptr::NonNull;
use tracing::warn;

pub(crate) struct ShareHandle(NonNull<curl_sys::CURLSH>);

impl ShareHandle {
    /// `None` when libcurl could not allocate the handle.
    pub(crate) fn init() -> Option<Self> {
        NonNull::new(unsafe { curl_sys::curl_share_init() }).map(Self)
    }

    pub(crate) fn as_raw(&self) -> *mut curl_sys::CURLSH {
        self.0.as_ptr()
    }
}

impl Drop for ShareHandle {
    fn drop(&mut self) {
        let code = unsafe { curl_sys::curl_share_cleanup(self.as_raw()) };
        // CURLSHE_IN_USE: an easy handle still points here. libcurl keeps
        // the share alive rather than freeing it under that handle.
        if code != curl_sys::CURLSHE_OK {
            warn!(code, "share handle not released");
        }
    }
}

// Every easy handle reaches the share through the lock callbacks, which
// `Share::new` installs before the first `CURLOPT_SHARE`.
unsafe impl Send for ShareHandle {}
unsafe impl Sync for ShareHandle {}
