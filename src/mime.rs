//! MIME documents for HTTP form posts and SMTP messages
//!
//! A document is a list of [`Part`]s. Each part is either one [`Content`]
//! (a form parameter, in-memory data or a file) or a set of alternatives,
//! sent as a `multipart/alternative` subpart. Empty fields are left unset.
//!
//! ```no_run
//! use curlev::{Engine, Http};
//! use curlev::mime::{Content, Part};
//!
//! let engine = Engine::new();
//! engine.start()?;
//!
//! let http = Http::create(&engine)?;
//! http.post("https://httpbin.org/post", "", "")
//!     .add_mime_parameters([
//!         Part::parameter("title", "report"),
//!         Content::file("upload", "/tmp/report.pdf")
//!             .content_type("application/pdf")
//!             .into(),
//!     ])
//!     .exec();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::sink::Sink;
use crate::types::{CURLOPT_MIMEPOST, cvt, setopt_ptr};
use curl::easy::Easy2;
use curl_sys::{CURL, CURLcode};
use std::ffi::{CString, c_char};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

#[allow(non_camel_case_types)]
enum curl_mime {}
#[allow(non_camel_case_types)]
enum curl_mimepart {}

// Part of libcurl since 7.56; `curl-sys` does not declare them.
unsafe extern "C" {
    fn curl_mime_init(easy: *mut CURL) -> *mut curl_mime;
    fn curl_mime_free(mime: *mut curl_mime);
    fn curl_mime_addpart(mime: *mut curl_mime) -> *mut curl_mimepart;
    fn curl_mime_name(part: *mut curl_mimepart, name: *const c_char) -> CURLcode;
    fn curl_mime_filename(part: *mut curl_mimepart, filename: *const c_char) -> CURLcode;
    fn curl_mime_type(part: *mut curl_mimepart, mimetype: *const c_char) -> CURLcode;
    fn curl_mime_data(part: *mut curl_mimepart, data: *const c_char, size: usize) -> CURLcode;
    fn curl_mime_filedata(part: *mut curl_mimepart, filename: *const c_char) -> CURLcode;
    fn curl_mime_subparts(part: *mut curl_mimepart, subparts: *mut curl_mime) -> CURLcode;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Data(Vec<u8>),
    File(PathBuf),
}

/// One leaf of a MIME document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    name: String,
    source: Source,
    content_type: String,
    filename: String,
}

impl Content {
    /// A plain `name=value` form field.
    pub fn parameter(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::data(name, value.into().into_bytes())
    }

    /// In-memory data. libcurl copies it when the document is built.
    pub fn data(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: Source::Data(data.into()),
            content_type: String::new(),
            filename: String::new(),
        }
    }

    /// Data read from `path` while the transfer runs. The file name doubles
    /// as the remote file name unless [`filename`](Self::filename) is set.
    pub fn file(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            source: Source::File(path.as_ref().to_path_buf()),
            content_type: String::new(),
            filename: String::new(),
        }
    }

    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// The file name announced to the remote side.
    #[must_use]
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    fn fill(&self, part: *mut curl_mimepart) -> Result<(), curl::Error> {
        set_text(part, curl_mime_name, &self.name)?;
        match &self.source {
            Source::Data(data) if data.is_empty() => {}
            Source::Data(data) => {
                cvt(unsafe { curl_mime_data(part, data.as_ptr().cast(), data.len()) })?;
            }
            Source::File(path) => {
                let path = path.to_str().ok_or_else(bad_argument)?;
                set_text(part, curl_mime_filedata, path)?;
            }
        }
        set_text(part, curl_mime_type, &self.content_type)?;
        set_text(part, curl_mime_filename, &self.filename)
    }
}

/// A top-level entry of a MIME document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Content(Content),
    /// Renderings of the same content, such as plain text and HTML
    Alternatives(Vec<Content>),
}

impl Part {
    pub fn parameter(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Content(Content::parameter(name, value))
    }

    pub fn data(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Content(Content::data(name, data))
    }

    pub fn file(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::Content(Content::file(name, path))
    }

    pub fn alternatives(contents: impl IntoIterator<Item = Content>) -> Self {
        Self::Alternatives(contents.into_iter().collect())
    }
}

impl From<Content> for Part {
    fn from(content: Content) -> Self {
        Self::Content(content)
    }
}

fn bad_argument() -> curl::Error {
    curl::Error::new(curl_sys::CURLE_BAD_FUNCTION_ARGUMENT)
}

type TextSetter = unsafe extern "C" fn(*mut curl_mimepart, *const c_char) -> CURLcode;

fn set_text(part: *mut curl_mimepart, setter: TextSetter, value: &str) -> Result<(), curl::Error> {
    if value.is_empty() {
        return Ok(());
    }
    let value = CString::new(value).map_err(|_| bad_argument())?;
    // libcurl copies the string.
    cvt(unsafe { setter(part, value.as_ptr()) })
}

/// A built `curl_mime`, freed on drop. libcurl reads it during the
/// transfer, so it lives next to the request that attached it.
#[derive(Debug)]
pub(crate) struct Mime(NonNull<curl_mime>);

// SAFETY: the document is only touched through `&mut self` or by libcurl
// while the owning handle is running, never from two threads at once.
unsafe impl Send for Mime {}

impl Mime {
    fn new(easy: *mut CURL) -> Result<Self, curl::Error> {
        NonNull::new(unsafe { curl_mime_init(easy) })
            .map(Self)
            .ok_or_else(|| curl::Error::new(curl_sys::CURLE_OUT_OF_MEMORY))
    }

    fn add_part(&mut self) -> Result<*mut curl_mimepart, curl::Error> {
        let part = unsafe { curl_mime_addpart(self.0.as_ptr()) };
        if part.is_null() {
            Err(curl::Error::new(curl_sys::CURLE_OUT_OF_MEMORY))
        } else {
            Ok(part)
        }
    }

    /// Build `parts` against `easy`.
    pub(crate) fn build(easy: &mut Easy2<Sink>, parts: &[Part]) -> Result<Self, curl::Error> {
        let raw = easy.raw();
        let mut mime = Self::new(raw)?;
        for part in parts {
            let target = mime.add_part()?;
            match part {
                Part::Content(content) => content.fill(target)?,
                Part::Alternatives(contents) => {
                    let mut alternatives = Self::new(raw)?;
                    for content in contents {
                        content.fill(alternatives.add_part()?)?;
                    }
                    set_text(target, curl_mime_type, "multipart/alternative")?;
                    cvt(unsafe { curl_mime_subparts(target, alternatives.0.as_ptr()) })?;
                    // Now owned by `target`.
                    std::mem::forget(alternatives);
                }
            }
        }
        Ok(mime)
    }

    /// Point `CURLOPT_MIMEPOST` at this document.
    pub(crate) fn attach(&self, easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        setopt_ptr(easy, CURLOPT_MIMEPOST, self.0.as_ptr().cast())
    }

    /// Clear `CURLOPT_MIMEPOST`. Must come before options that select the
    /// request method, since setting it switches the method to a MIME post.
    pub(crate) fn detach(easy: &mut Easy2<Sink>) -> Result<(), curl::Error> {
        setopt_ptr(easy, CURLOPT_MIMEPOST, std::ptr::null_mut())
    }
}

impl Drop for Mime {
    fn drop(&mut self) {
        unsafe { curl_mime_free(self.0.as_ptr()) };
    }
}
