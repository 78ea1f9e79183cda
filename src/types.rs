//! Raw libcurl option numbers and setters
//!
//! The `curl` crate covers most easy-handle options, but it cannot reset a
//! string option to NULL and has no SMTP envelope setters. Option numbers
//! come from `curl-sys`; the few it does not export yet mirror `curl.h`.

use crate::sink::Sink;
use curl::easy::Easy2;
use curl_sys::{CURLINFO, CURLcode, CURLoption};
use std::ffi::{CStr, CString, c_char, c_long, c_ulong};

pub(crate) use curl_sys::{
    CURLAUTH_BASIC, CURLAUTH_DIGEST, CURLOPT_ACCEPT_ENCODING, CURLOPT_CAINFO, CURLOPT_CAPATH,
    CURLOPT_COOKIEFILE, CURLOPT_FOLLOWLOCATION, CURLOPT_HTTPAUTH, CURLOPT_KEYPASSWD,
    CURLOPT_MAIL_FROM, CURLOPT_MAIL_RCPT, CURLOPT_PASSWORD, CURLOPT_PROXY, CURLOPT_PROXY_CAINFO,
    CURLOPT_PROXY_CAPATH, CURLOPT_PROXY_KEYPASSWD, CURLOPT_PROXY_SSLCERT,
    CURLOPT_PROXY_SSLCERTTYPE, CURLOPT_PROXY_SSLKEY, CURLOPT_PROXY_SSLKEYTYPE, CURLOPT_SHARE,
    CURLOPT_SSLCERT, CURLOPT_SSLCERTTYPE, CURLOPT_SSLENGINE, CURLOPT_SSLKEY, CURLOPT_SSLKEYTYPE,
    CURLOPT_USERNAME,
};

pub(crate) const CURLOPT_MAIL_RCPT_ALLOWFAILS: CURLoption = curl_sys::CURLOPTTYPE_LONG + 290;
pub(crate) const CURLINFO_CAINFO: CURLINFO = curl_sys::CURLINFO_STRING + 61;
pub(crate) const CURLINFO_CAPATH: CURLINFO = curl_sys::CURLINFO_STRING + 62;
pub(crate) const CURLAUTH_BEARER: c_ulong = 1 << 6;
pub(crate) const CURLOPT_MIMEPOST: CURLoption = curl_sys::CURLOPTTYPE_OBJECTPOINT + 269;
pub(crate) const CURLOPT_XOAUTH2_BEARER: CURLoption = curl_sys::CURLOPTTYPE_OBJECTPOINT + 220;

/// An owned `curl_slist` for options the `curl` crate has no setter for.
/// libcurl reads it during the transfer, so it must outlive the transfer.
#[derive(Debug)]
pub(crate) struct StringList(*mut curl_sys::curl_slist);

// SAFETY: the list is only touched through `&mut self` or by libcurl while
// the owning handle is running, never from two threads at once.
unsafe impl Send for StringList {}

impl Default for StringList {
    fn default() -> Self {
        Self(std::ptr::null_mut())
    }
}

impl StringList {
    pub(crate) fn new<I, S>(items: I) -> Result<Self, curl::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut list = Self::default();
        for item in items {
            let item = CString::new(item.as_ref())
                .map_err(|_| curl::Error::new(curl_sys::CURLE_BAD_FUNCTION_ARGUMENT))?;
            let appended = unsafe { curl_sys::curl_slist_append(list.0, item.as_ptr()) };
            if appended.is_null() {
                return Err(curl::Error::new(curl_sys::CURLE_OUT_OF_MEMORY));
            }
            list.0 = appended;
        }
        Ok(list)
    }

    pub(crate) fn as_raw(&self) -> *mut curl_sys::curl_slist {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn to_vec(&self) -> Vec<String> {
        let mut items = Vec::new();
        let mut node = self.0;
        while !node.is_null() {
            let entry = unsafe { &*node };
            items.push(unsafe { CStr::from_ptr(entry.data) }.to_string_lossy().into_owned());
            node = entry.next;
        }
        items
    }
}

impl Drop for StringList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { curl_sys::curl_slist_free_all(self.0) };
        }
    }
}

pub(crate) fn cvt(code: CURLcode) -> Result<(), curl::Error> {
    if code == curl_sys::CURLE_OK {
        Ok(())
    } else {
        Err(curl::Error::new(code))
    }
}

/// Set a string option; `None` resets it to the library default.
pub(crate) fn setopt_str(
    easy: &mut Easy2<Sink>,
    option: CURLoption,
    value: Option<&str>,
) -> Result<(), curl::Error> {
    let value = value
        .map(CString::new)
        .transpose()
        .map_err(|_| curl::Error::new(curl_sys::CURLE_BAD_FUNCTION_ARGUMENT))?;
    let ptr = value.as_ref().map_or(std::ptr::null(), |v| v.as_ptr());
    // libcurl copies string arguments, so `value` may drop after the call.
    cvt(unsafe { curl_sys::curl_easy_setopt(easy.raw(), option, ptr) })
}

/// Set a string option, treating the empty string as a reset.
pub(crate) fn setopt_str_or_reset(
    easy: &mut Easy2<Sink>,
    option: CURLoption,
    value: &str,
) -> Result<(), curl::Error> {
    setopt_str(easy, option, Some(value).filter(|v| !v.is_empty()))
}

pub(crate) fn setopt_long(
    easy: &mut Easy2<Sink>,
    option: CURLoption,
    value: c_long,
) -> Result<(), curl::Error> {
    cvt(unsafe { curl_sys::curl_easy_setopt(easy.raw(), option, value) })
}

/// Set `CURLOPT_HTTPAUTH` from a `CURLAUTH_*` mask.
pub(crate) fn setopt_httpauth(easy: &mut Easy2<Sink>, mask: c_ulong) -> Result<(), curl::Error> {
    setopt_long(easy, CURLOPT_HTTPAUTH, mask as c_long)
}

pub(crate) fn setopt_ptr(
    easy: &mut Easy2<Sink>,
    option: CURLoption,
    value: *mut std::ffi::c_void,
) -> Result<(), curl::Error> {
    cvt(unsafe { curl_sys::curl_easy_setopt(easy.raw(), option, value) })
}

/// Read a string info field from any easy handle. Unknown or unset fields
/// come back empty.
pub(crate) fn getinfo_str(raw: *mut curl_sys::CURL, info: CURLINFO) -> String {
    let mut ptr: *const c_char = std::ptr::null();
    let code = unsafe { curl_sys::curl_easy_getinfo(raw, info, &mut ptr) };
    if code != curl_sys::CURLE_OK || ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
