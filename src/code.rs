//! Transfer outcome codes
//!
//! Every transfer settles into a [`Code`]. Nothing about a transfer is
//! reported through `Result`: configuration mistakes, preparation failures,
//! libcurl errors and protocol status codes all end up here so a caller can
//! inspect one field after `join()`.

use std::fmt;

/// Failures detected by this crate rather than by libcurl
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Internal {
    /// An `options()` string could not be parsed
    Options,
    /// An `authentication()` string could not be parsed or applied
    Authentication,
    /// A `certificates()` string could not be parsed or applied
    Certificates,
    /// The protocol could not build its header list
    Headers,
    /// No method was selected, or the method does not fit the request
    Method,
    /// The protocol refused to prepare the transfer
    Prepare,
    /// The handle lost its libcurl easy handle and none could be recreated
    NoHandle,
    /// The engine refused to register the transfer
    Start,
    /// A retry could not be re-registered with the multiplexer
    RestartFailed,
    /// The user completion callback panicked
    CallbackCrashed,
    /// The engine was torn down while the transfer was still registered
    EngineStopped,
    /// The multiplexer failed to hand the transfer back
    Multiplexer,
    /// A MIME document could not be built or attached
    Mime,
}

impl Internal {
    /// Numeric value in the negative internal range
    #[must_use]
    pub fn value(self) -> i64 {
        match self {
            Self::Options => -1,
            Self::Headers => -2,
            Self::Prepare => -3,
            Self::Method => -4,
            Self::Authentication => -5,
            Self::Certificates => -6,
            Self::NoHandle => -7,
            Self::Start => -8,
            Self::RestartFailed => -9,
            Self::CallbackCrashed => -10,
            Self::EngineStopped => -11,
            Self::Multiplexer => -12,
            Self::Mime => -13,
        }
    }
}

/// Outcome of the last transfer on a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Code {
    /// Nothing failed and no transfer has settled yet
    #[default]
    Success,
    /// Returned by `code()` while a transfer is in flight
    Running,
    /// The transfer completed and the server answered with this status
    Status(u32),
    /// libcurl reported this `CURLcode`
    Transfer(curl_sys::CURLcode),
    /// The crate itself gave up on the transfer
    Internal(Internal),
}

impl Code {
    /// The code used when a transfer is aborted by its owner
    pub const ABORTED: Self = Self::Transfer(curl_sys::CURLE_ABORTED_BY_CALLBACK);

    const RUNNING_VALUE: i64 = -100;

    /// Collapse the code into a single numeric space: negative for internal
    /// failures, the `CURLcode` for libcurl failures, the status otherwise.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::Running => Self::RUNNING_VALUE,
            Self::Status(status) => i64::from(status),
            Self::Transfer(code) => i64::from(code),
            Self::Internal(internal) => internal.value(),
        }
    }

    #[must_use]
    pub fn is_running(self) -> bool {
        self == Self::Running
    }

    #[must_use]
    pub fn is_aborted(self) -> bool {
        self == Self::ABORTED
    }

    /// Returns `true` for 2xx statuses.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Status(status) if (200..300).contains(&status))
    }

    /// Transport failures worth another attempt on any protocol.
    #[must_use]
    pub fn is_transient_transfer(self) -> bool {
        matches!(
            self,
            Self::Transfer(
                curl_sys::CURLE_COULDNT_RESOLVE_HOST
                    | curl_sys::CURLE_COULDNT_RESOLVE_PROXY
                    | curl_sys::CURLE_COULDNT_CONNECT
                    | curl_sys::CURLE_SSL_CONNECT_ERROR
                    | curl_sys::CURLE_PEER_FAILED_VERIFICATION
            )
        )
    }

    /// Whether a retry may be attempted. Status codes are only eligible when
    /// `status_eligible` accepts them, which keeps protocol-specific statuses
    /// from colliding across protocols.
    pub(crate) fn is_safe_to_retry(self, status_eligible: impl FnOnce(u32) -> bool) -> bool {
        match self {
            Self::Status(status) => status_eligible(status),
            other => other.is_transient_transfer(),
        }
    }
}

impl From<Code> for i64 {
    fn from(code: Code) -> Self {
        code.as_i64()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Running => f.write_str("still running"),
            Self::Status(status) => write!(f, "status {status}"),
            Self::Transfer(code) => write!(f, "{}", curl::Error::new(*code)),
            Self::Internal(internal) => write!(f, "internal error {internal:?}"),
        }
    }
}

impl From<Internal> for Code {
    fn from(internal: Internal) -> Self {
        Self::Internal(internal)
    }
}
