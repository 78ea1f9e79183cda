//! Write, header and read sinks
//!
//! Each easy handle carries one [`Sink`] as its `curl::easy::Handler` for its
//! whole life. libcurl writes the response body and header lines into it and
//! pulls the request body from it. The owning handle resets it before every
//! attempt and the protocol drains it after completion.

use crate::cskv::{parse_number, trim};
use crate::headers::Headers;
use crate::share::Share;
use curl::easy::{Handler, ReadError, SeekResult, WriteError};
use std::io::SeekFrom;
use std::sync::Arc;

/// Largest response body a handle accepts unless told otherwise.
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 1 << 30;

pub struct Sink {
    pub(crate) body: Vec<u8>,
    pub(crate) headers: Headers,
    content_length: Option<usize>,
    max_response_size: usize,
    upload: Vec<u8>,
    upload_pos: usize,
    // Keeps the shared cache alive until libcurl has released this handle.
    _share: Option<Arc<Share>>,
}

impl Sink {
    pub(crate) fn new(share: Option<Arc<Share>>) -> Self {
        Self {
            body: Vec::new(),
            headers: Headers::new(),
            content_length: None,
            max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
            upload: Vec::new(),
            upload_pos: 0,
            _share: share,
        }
    }

    /// Forget everything a previous attempt accumulated.
    pub(crate) fn reset_response(&mut self) {
        self.body = Vec::new();
        self.headers.clear();
        self.content_length = None;
        self.upload_pos = 0;
    }

    pub(crate) fn set_max_response_size(&mut self, max: usize) {
        self.max_response_size = max;
    }

    pub(crate) fn set_upload(&mut self, body: Vec<u8>) {
        self.upload = body;
        self.upload_pos = 0;
    }

    pub(crate) fn upload_len(&self) -> usize {
        self.upload.len()
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn take_headers(&mut self) -> Headers {
        std::mem::take(&mut self.headers)
    }
}

impl Handler for Sink {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if let Some(length) = self.content_length.take() {
            if length > self.max_response_size {
                tracing::warn!(length, max = self.max_response_size, "response exceeds size limit");
                return Ok(0);
            }
            self.body.reserve_exact(length.saturating_sub(self.body.len()));
        }

        if self.body.len().saturating_add(data.len()) > self.max_response_size {
            tracing::warn!(max = self.max_response_size, "response body grew past size limit");
            // A short count makes libcurl fail the transfer with CURLE_WRITE_ERROR.
            return Ok(0);
        }

        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn header(&mut self, data: &[u8]) -> bool {
        let line = String::from_utf8_lossy(data);
        let Some((key, value)) = line.split_once(':') else {
            // Status lines and the blank separator carry no field.
            return true;
        };
        let key = trim(key);
        let value = trim(value);

        if key.eq_ignore_ascii_case("content-length") {
            let Some(length) = parse_number::<usize>(value) else {
                tracing::warn!(value, "malformed Content-Length");
                return false;
            };
            self.content_length = Some(length);
        }

        self.headers.insert(key, value);
        true
    }

    fn read(&mut self, into: &mut [u8]) -> Result<usize, ReadError> {
        let remaining = self.upload.get(self.upload_pos..).unwrap_or_default();
        let count = remaining.len().min(into.len());
        into[..count].copy_from_slice(&remaining[..count]);
        self.upload_pos += count;
        Ok(count)
    }

    fn seek(&mut self, whence: SeekFrom) -> SeekResult {
        match whence {
            SeekFrom::Start(offset) => match usize::try_from(offset) {
                Ok(offset) if offset <= self.upload.len() => {
                    self.upload_pos = offset;
                    SeekResult::Ok
                }
                _ => SeekResult::Fail,
            },
            _ => SeekResult::CantSeek,
        }
    }
}
